mod fakes;
mod manager_tests;
mod storage_tests;

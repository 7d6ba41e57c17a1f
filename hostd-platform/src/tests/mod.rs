mod device_pool_tests;

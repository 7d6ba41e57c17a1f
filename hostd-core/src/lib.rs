pub mod config;
pub mod error;
pub mod locks;
pub mod logging;
pub mod task;
pub mod types;

pub use config::*;
pub use error::*;
pub use locks::{KeyGuard, KeyedLocks};
pub use logging::{DiskEventLog, LogLevel as DiskLogLevel};
pub use task::{TaskCompletion, WorkManager};
pub use types::*;

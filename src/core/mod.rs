//! 核心层：错误类型、重试/退避引擎、工具并发池、优雅关闭

pub mod error;
pub mod retry;
pub mod shutdown;
pub mod task_scheduler;

pub use error::ChatError;
pub use retry::{Attempted, ErrorClass, RetryError, RetryPolicy};
pub use shutdown::{ShutdownManager, ShutdownReason};
pub use task_scheduler::TaskScheduler;

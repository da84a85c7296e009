//! 公共模块
//!
//! 提供跨模块使用的通用组件

mod concurrency;
mod throttle;

pub use concurrency::{ConcurrencyController, ConcurrencyStatus, SchedulerError};
pub use throttle::{ProgressThrottler, DEFAULT_THROTTLE_INTERVAL_MS};

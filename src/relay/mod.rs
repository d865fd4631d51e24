//! 双向中继模块
//! 两个复制循环加一个空闲看门狗，协同完成只关闭一次的对称停机

mod copy;
pub mod engine;
pub mod log;
mod shutdown;

pub use engine::{RelayEngine, DEFAULT_GRACE_PERIOD, DEFAULT_IDLE_TIMEOUT};
pub use log::{DebugLevel, LogSink, NoopSink, TracingSink};

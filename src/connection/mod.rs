//! 连接层：字节流抽象、计数连接与接入速率统计
//! 基于 tokio 异步 IO 实现

pub mod buffer;
pub mod counter;
pub mod listener;
pub mod stream;

// 重新导出常用类型
pub use buffer::{BufferPool, PooledBuffer};
pub use counter::InstrumentedConn;
pub use listener::{AcceptRateTracker, Listener, MAX_MINUTES};
pub use stream::{ByteStream, StreamEndpoint};

//! TCP 中继工具库
//! 计数连接、接入速率统计与带空闲超时的双向中继

pub mod common;
pub mod config;
pub mod connection;
pub mod relay;
pub mod server;

pub use common::error::{NetRelayError, RelayError, RelayFailure, Result, ServerError};
pub use config::NodeConfig;
pub use connection::{AcceptRateTracker, ByteStream, InstrumentedConn, Listener, StreamEndpoint};
pub use relay::{DebugLevel, LogSink, RelayEngine};
pub use server::Forwarder;

use tracing_subscriber::EnvFilter;

/// 初始化日志，`RUST_LOG` 优先于配置的级别；重复调用时忽略
pub fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

//! 配置管理模块
//! 加载并解析转发节点配置，支持 TOML 文件与环境变量覆盖

use serde::{Deserialize, Serialize};
use config::{Config, ConfigError, Environment, File};
use std::net::SocketAddr;
use crate::connection::buffer::DEFAULT_CHUNK_SIZE;
use crate::relay::DebugLevel;

/// 节点配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// 监听地址
    pub listen_addr: SocketAddr,

    /// 上游地址
    pub upstream_addr: String,

    /// 连接上游超时(秒)
    pub connect_timeout_secs: u64,

    /// 每条接入连接的双向字节上限，0 表示不限
    pub byte_cap: u64,

    /// 接入速率统计输出间隔(秒)，0 表示不输出
    pub stats_interval_secs: u64,

    /// 中继配置
    pub relay: RelayConfig,

    /// 日志配置
    pub log: LogConfig,
}

/// 中继配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// 空闲超时(秒)，0 表示使用默认的两小时
    pub idle_timeout_secs: u64,

    /// 首个方向结束后等待另一方向的宽限期(毫秒)
    pub grace_period_ms: u64,

    /// 复制缓冲区大小
    pub buffer_size: usize,

    /// 缓冲区池最多保留的空闲缓冲区数量
    pub max_pooled_buffers: usize,

    /// 调试级别
    pub debug: DebugLevel,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// 日志级别
    pub level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            upstream_addr: "127.0.0.1:80".to_string(),
            connect_timeout_secs: 10,
            byte_cap: 0,
            stats_interval_secs: 60,
            relay: RelayConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 2 * 60 * 60,
            grace_period_ms: 1000,
            buffer_size: DEFAULT_CHUNK_SIZE,
            max_pooled_buffers: 256,
            debug: DebugLevel::Off,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// 加载配置文件
pub fn load(config_path: &str) -> Result<NodeConfig, ConfigError> {
    Config::builder()
        // 从文件加载基础配置，文件不存在时使用默认值
        .add_source(File::with_name(config_path).required(false))
        // 从环境变量覆盖配置 (NETRELAY__ 前缀)
        .add_source(Environment::with_prefix("NETRELAY").separator("__"))
        .build()?
        .try_deserialize()
}

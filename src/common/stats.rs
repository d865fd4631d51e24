//! 统计信息模块
//! 跟踪转发连接指标并周期输出接入速率

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::info;
use crate::connection::{AcceptRateTracker, Listener, MAX_MINUTES};

/// 连接统计快照
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// 总连接数
    pub total_connections: u64,
    /// 当前连接数
    pub current_connections: u64,
    /// 连接错误数
    pub connection_errors: u64,
    /// 客户端发往上游的字节数
    pub upstream_bytes: u64,
    /// 上游发往客户端的字节数
    pub downstream_bytes: u64,
}

/// 全局统计管理器
#[derive(Debug)]
pub struct StatsManager {
    total_connections: AtomicU64,
    current_connections: AtomicU64,
    connection_errors: AtomicU64,
    upstream_bytes: AtomicU64,
    downstream_bytes: AtomicU64,
    /// 启动时间
    start_time: DateTime<Utc>,
}

impl Default for StatsManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsManager {
    /// 创建新的统计管理器
    pub fn new() -> Self {
        Self {
            total_connections: AtomicU64::new(0),
            current_connections: AtomicU64::new(0),
            connection_errors: AtomicU64::new(0),
            upstream_bytes: AtomicU64::new(0),
            downstream_bytes: AtomicU64::new(0),
            start_time: Utc::now(),
        }
    }

    /// 增加连接
    pub fn increment_connection(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.current_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// 减少连接，同时累加该连接的双向字节数
    pub fn decrement_connection(&self, upstream_bytes: u64, downstream_bytes: u64) {
        let _ = self
            .current_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        self.upstream_bytes.fetch_add(upstream_bytes, Ordering::Relaxed);
        self.downstream_bytes.fetch_add(downstream_bytes, Ordering::Relaxed);
    }

    /// 增加连接错误
    pub fn increment_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// 获取连接统计
    pub fn connection_stats(&self) -> ConnectionStats {
        ConnectionStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            current_connections: self.current_connections.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            upstream_bytes: self.upstream_bytes.load(Ordering::Relaxed),
            downstream_bytes: self.downstream_bytes.load(Ordering::Relaxed),
        }
    }

    /// 正常运行时间(秒)
    pub fn uptime_seconds(&self) -> u64 {
        u64::try_from((Utc::now() - self.start_time).num_seconds()).unwrap_or(0)
    }

    /// 启动周期输出任务，`shutdown` 置为 true 时退出
    pub fn start<L>(
        self: &Arc<Self>,
        tracker: Arc<AcceptRateTracker<L>>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()>
    where
        L: Listener + 'static,
    {
        let stats = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // 第一次 tick 立即完成，跳过
            ticker.tick().await;
            info!("统计输出已启动，间隔 {:?}", period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => stats.report(&tracker.rates_per_minute()),
                    _ = shutdown.wait_for(|stop| *stop) => break,
                }
            }
            info!("统计输出已停止");
        })
    }

    fn report(&self, rates: &[u64; MAX_MINUTES]) {
        let conn = self.connection_stats();
        info!(
            total = conn.total_connections,
            current = conn.current_connections,
            errors = conn.connection_errors,
            upstream_bytes = conn.upstream_bytes,
            downstream_bytes = conn.downstream_bytes,
            uptime = self.uptime_seconds(),
            "每分钟接入次数(最近在前): {:?}",
            rates
        );
    }
}

//! 计数连接
//! 统计每个方向的传输字节数，并可按双向合计的字节上限强制关闭连接

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;
use super::stream::ByteStream;
use crate::common::error::cap_exceeded;

/// 剩余额度的哨兵值，表示未设置上限
const UNCAPPED: i64 = i64::MIN;

/// 一次传输扣减额度后的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Budget {
    /// 未设置上限
    Unlimited,
    /// 仍有剩余
    Remaining,
    /// 恰好用尽，本次调用正常完成
    Exhausted,
    /// 超出上限，需强制关闭
    Overdrawn,
}

/// 带字节计数与上限控制的连接
pub struct InstrumentedConn<S> {
    /// 被包装的字节流
    inner: S,
    /// 读方向累计字节数
    upstream: AtomicU64,
    /// 写方向累计字节数
    downstream: AtomicU64,
    /// 双向共享的剩余额度
    remaining: AtomicI64,
    /// 是否已因额度耗尽被强制关闭
    force_closed: AtomicBool,
}

impl<S: ByteStream> InstrumentedConn<S> {
    /// 包装字节流，计数器归零且不设上限
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            upstream: AtomicU64::new(0),
            downstream: AtomicU64::new(0),
            remaining: AtomicI64::new(UNCAPPED),
            force_closed: AtomicBool::new(false),
        }
    }

    /// 设置双向合计的字节上限，0 表示不限
    pub fn set_cap(&self, cap: u64) {
        let remaining = if cap == 0 {
            UNCAPPED
        } else {
            i64::try_from(cap).unwrap_or(i64::MAX)
        };
        self.remaining.store(remaining, Ordering::SeqCst);
    }

    /// 剩余额度，未设上限时为 `None`
    pub fn remaining_cap(&self) -> Option<u64> {
        match self.remaining.load(Ordering::SeqCst) {
            UNCAPPED => None,
            remaining => Some(remaining.max(0) as u64),
        }
    }

    /// 读方向累计字节数
    pub fn upstream_bytes(&self) -> u64 {
        self.upstream.load(Ordering::Relaxed)
    }

    /// 写方向累计字节数
    pub fn downstream_bytes(&self) -> u64 {
        self.downstream.load(Ordering::Relaxed)
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    /// 额度是否已耗尽
    fn is_exhausted(&self) -> bool {
        let remaining = self.remaining.load(Ordering::SeqCst);
        remaining != UNCAPPED && remaining <= 0
    }

    /// 原子地扣减额度
    fn charge(&self, n: usize) -> Budget {
        let n = i64::try_from(n).unwrap_or(i64::MAX);
        let previous = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current != UNCAPPED).then(|| current.saturating_sub(n).max(UNCAPPED + 1))
            });
        match previous {
            Err(_) => Budget::Unlimited,
            Ok(previous) => match previous.saturating_sub(n) {
                left if left > 0 => Budget::Remaining,
                0 => Budget::Exhausted,
                _ => Budget::Overdrawn,
            },
        }
    }

    /// 关闭底层流，至多执行一次
    async fn force_close(&self) {
        if self
            .force_closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        debug!("byte cap exhausted, closing connection");
        if let Err(err) = self.inner.close().await {
            debug!("close after cap exhausted failed: {}", err);
        }
    }

    /// 调用前检查：额度已耗尽则关闭连接并返回流结束
    async fn ensure_budget(&self) -> io::Result<()> {
        if self.is_exhausted() {
            self.force_close().await;
            return Err(cap_exceeded());
        }
        Ok(())
    }

    /// 额度耗尽导致的关闭会让另一方向挂起中的调用以关闭错误返回，统一归类为流结束
    fn classify(&self, err: io::Error) -> io::Error {
        if self.force_closed.load(Ordering::SeqCst) || self.is_exhausted() {
            cap_exceeded()
        } else {
            err
        }
    }

    /// 调用后结算：超额时关闭连接，本次传输的字节数仍如实返回
    async fn settle(&self, n: usize) -> usize {
        if self.charge(n) == Budget::Overdrawn {
            self.force_close().await;
        }
        n
    }
}

impl<S> fmt::Debug for InstrumentedConn<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentedConn")
            .field("upstream", &self.upstream.load(Ordering::Relaxed))
            .field("downstream", &self.downstream.load(Ordering::Relaxed))
            .field("remaining", &self.remaining.load(Ordering::Relaxed))
            .field("force_closed", &self.force_closed.load(Ordering::Relaxed))
            .finish()
    }
}

#[async_trait]
impl<S: ByteStream> ByteStream for InstrumentedConn<S> {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.ensure_budget().await?;
        let n = self.inner.read(buf).await.map_err(|err| self.classify(err))?;
        self.upstream.fetch_add(n as u64, Ordering::Relaxed);
        Ok(self.settle(n).await)
    }

    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.ensure_budget().await?;
        let n = self.inner.write(buf).await.map_err(|err| self.classify(err))?;
        self.downstream.fetch_add(n as u64, Ordering::Relaxed);
        Ok(self.settle(n).await)
    }

    async fn close(&self) -> io::Result<()> {
        self.inner.close().await
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.inner.set_read_deadline(deadline)
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.inner.set_write_deadline(deadline)
    }
}

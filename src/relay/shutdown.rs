//! 两端关闭守卫
//! 空闲超时、外部取消与复制循环结束均可触发关闭，实际关闭只执行一次

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use super::log::Reporter;
use crate::connection::ByteStream;

const ACTIVE: u8 = 0;

/// 触发关闭的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum CloseReason {
    /// 某一方向的复制循环已结束
    StreamEnded = 1,
    /// 空闲超时
    IdleTimeout = 2,
    /// 外部取消
    Cancelled = 3,
}

impl CloseReason {
    fn from_state(state: u8) -> Option<Self> {
        match state {
            1 => Some(CloseReason::StreamEnded),
            2 => Some(CloseReason::IdleTimeout),
            3 => Some(CloseReason::Cancelled),
            _ => None,
        }
    }
}

/// 一次中继的关闭守卫，持有两个端点
pub(crate) struct Shutdown<A: ?Sized, B: ?Sized> {
    /// 0 表示运行中，否则为首个触发者的关闭原因
    state: AtomicU8,
    a: Arc<A>,
    b: Arc<B>,
    /// 两端关闭完成后置为 true
    done: watch::Sender<bool>,
    reporter: Reporter,
}

impl<A, B> Shutdown<A, B>
where
    A: ByteStream + ?Sized,
    B: ByteStream + ?Sized,
{
    pub(crate) fn new(a: Arc<A>, b: Arc<B>, reporter: Reporter) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            state: AtomicU8::new(ACTIVE),
            a,
            b,
            done,
            reporter,
        }
    }

    /// 关闭两端；仅首个调用者执行关闭并返回 true，其余调用者等待关闭完成
    pub(crate) async fn close(&self, reason: CloseReason) -> bool {
        self.reporter
            .verbose(format_args!("close both ends requested by {:?}", reason));
        if self
            .state
            .compare_exchange(ACTIVE, reason as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.closed().await;
            return false;
        }
        self.reporter.verbose(format_args!("swapped, closing both ends"));

        if let Err(err) = self.a.close().await {
            self.reporter.verbose(format_args!("closing first end failed: {}", err));
        }
        if let Err(err) = self.b.close().await {
            self.reporter.verbose(format_args!("closing second end failed: {}", err));
        }
        self.done.send_replace(true);
        self.reporter.verbose(format_args!("both ends closed"));
        true
    }

    /// 等待两端关闭完成
    pub(crate) async fn closed(&self) {
        let mut rx = self.done.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    /// 首个触发者的关闭原因，尚未关闭时为 `None`
    pub(crate) fn reason(&self) -> Option<CloseReason> {
        CloseReason::from_state(self.state.load(Ordering::SeqCst))
    }
}

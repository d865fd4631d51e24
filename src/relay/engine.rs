//! 中继引擎
//! 在两个字节流之间双向复制数据，直到一端关闭、空闲超时或外部取消

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep_until;
use super::copy::{copy_half, IdleTimer};
use super::log::{DebugLevel, LogSink, Reporter, TracingSink};
use super::shutdown::{CloseReason, Shutdown};
use crate::common::error::{RelayError, RelayFailure};
use crate::config::RelayConfig;
use crate::connection::{BufferPool, ByteStream};

/// 未配置空闲超时时使用的默认值
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

/// 首个方向结束后等待另一方向退出的时长
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(1);

type CopyResult = Result<(), RelayError>;

/// 双向中继引擎
///
/// 引擎本身只保存配置，可被多次调用；每次 [`RelayEngine::run`] 都有独立的
/// 关闭守卫、空闲计时器与结果通道，并在返回前关闭两个端点。
pub struct RelayEngine {
    /// 调试日志接收端
    sink: Arc<dyn LogSink>,
    /// 空闲超时，0 表示使用默认值
    timeout: Duration,
    /// 等待第二个方向退出的宽限期
    grace_period: Duration,
    /// 调试级别
    debug_level: DebugLevel,
    /// 复制缓冲区池
    buffers: Arc<BufferPool>,
}

impl RelayEngine {
    /// 创建新的中继引擎
    pub fn new(sink: Arc<dyn LogSink>, timeout: Duration) -> Self {
        Self {
            sink,
            timeout,
            grace_period: DEFAULT_GRACE_PERIOD,
            debug_level: DebugLevel::Off,
            buffers: Arc::new(BufferPool::default()),
        }
    }

    /// 根据配置创建，日志转发到 tracing
    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(
            Arc::new(TracingSink),
            Duration::from_secs(config.idle_timeout_secs),
        )
        .with_grace_period(Duration::from_millis(config.grace_period_ms))
        .with_buffer_pool(Arc::new(BufferPool::new(config.buffer_size, config.max_pooled_buffers)))
        .with_debug_level(config.debug)
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// 在多个引擎之间共享缓冲区池
    pub fn with_buffer_pool(mut self, buffers: Arc<BufferPool>) -> Self {
        self.buffers = buffers;
        self
    }

    pub fn with_debug_level(mut self, level: DebugLevel) -> Self {
        self.debug_level = level;
        self
    }

    /// 开关调试输出
    pub fn set_debug(&mut self, debug: bool) {
        self.debug_level = if debug { DebugLevel::Basic } else { DebugLevel::Off };
    }

    pub fn set_debug_level(&mut self, level: DebugLevel) {
        self.debug_level = level;
    }

    /// 生效的空闲超时
    pub fn timeout(&self) -> Duration {
        if self.timeout.is_zero() {
            DEFAULT_IDLE_TIMEOUT
        } else {
            self.timeout
        }
    }

    /// 在 `a` 与 `b` 之间双向复制数据
    ///
    /// 任一触发条件出现即关闭两端：`cancel` 完成、双向空闲超过超时时长、
    /// 或任一方向的复制结束。返回双向写出的字节总数；失败时
    /// [`RelayFailure`] 同样携带该字节数。先结束方向的结果为准，
    /// 另一方向最多再等待宽限期。
    pub async fn run<A, B, F>(&self, cancel: F, a: A, b: B) -> Result<u64, RelayFailure>
    where
        A: ByteStream + 'static,
        B: ByteStream + 'static,
        F: Future<Output = ()> + Send + 'static,
    {
        let timeout = self.timeout();
        let reporter = Reporter::new(Arc::clone(&self.sink), self.debug_level);
        reporter.verbose(format_args!("running idle timeout relay for {:?}", timeout));

        let a = Arc::new(a);
        let b = Arc::new(b);
        let idle = Arc::new(IdleTimer::new(timeout));
        let shutdown = Arc::new(Shutdown::new(Arc::clone(&a), Arc::clone(&b), reporter.clone()));
        let forward_written = Arc::new(AtomicU64::new(0));
        let backward_written = Arc::new(AtomicU64::new(0));

        // 容量为 2，两个复制循环上报结果时都不会阻塞
        let (results_tx, mut results_rx) = mpsc::channel::<CopyResult>(2);
        self.spawn_copy(
            Arc::clone(&a),
            Arc::clone(&b),
            Arc::clone(&idle),
            Arc::clone(&forward_written),
            results_tx.clone(),
        );
        self.spawn_copy(
            Arc::clone(&b),
            Arc::clone(&a),
            Arc::clone(&idle),
            Arc::clone(&backward_written),
            results_tx,
        );
        let watchdog = spawn_watchdog(cancel, Arc::clone(&idle), Arc::clone(&shutdown), reporter.clone());

        let first = match results_rx.recv().await {
            Some(result) => result,
            None => {
                reporter.basic(format_args!("copy loops exited without reporting a result"));
                Err(RelayError::CopyAborted)
            }
        };
        shutdown.close(CloseReason::StreamEnded).await;

        reporter.verbose(format_args!("emptying results channel"));
        let drained = tokio::time::timeout(self.grace_period, async {
            results_rx.recv().await;
            let _ = watchdog.await;
        })
        .await
        .is_ok();
        if drained {
            reporter.verbose(format_args!("emptied results channel"));
        } else {
            reporter.basic(format_args!(
                "second direction still running after {:?}, not waiting",
                self.grace_period
            ));
        }

        let transferred =
            forward_written.load(Ordering::SeqCst) + backward_written.load(Ordering::SeqCst);
        let error = match shutdown.reason() {
            Some(CloseReason::IdleTimeout) => Some(RelayError::IdleTimeout(timeout)),
            Some(CloseReason::Cancelled) => Some(RelayError::Cancelled),
            _ => first.err(),
        };
        match error {
            None => Ok(transferred),
            Some(error) => Err(RelayFailure::new(transferred, error)),
        }
    }

    fn spawn_copy<R, W>(
        &self,
        src: Arc<R>,
        dst: Arc<W>,
        idle: Arc<IdleTimer>,
        written: Arc<AtomicU64>,
        results: mpsc::Sender<CopyResult>,
    ) where
        R: ByteStream + 'static,
        W: ByteStream + 'static,
    {
        let buffers = Arc::clone(&self.buffers);
        tokio::spawn(async move {
            let mut buf = buffers.acquire();
            let result = copy_half(&*src, &*dst, &mut buf[..], &idle, &written).await;
            let _ = results.send(result).await;
        });
    }
}

/// 空闲看门狗：外部取消或空闲超时时关闭两端，两端已关闭时退出
fn spawn_watchdog<F, A, B>(
    cancel: F,
    idle: Arc<IdleTimer>,
    shutdown: Arc<Shutdown<A, B>>,
    reporter: Reporter,
) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
    A: ByteStream + 'static,
    B: ByteStream + 'static,
{
    tokio::spawn(async move {
        tokio::pin!(cancel);
        loop {
            let deadline = idle.deadline();
            tokio::select! {
                biased;
                _ = &mut cancel => {
                    reporter.verbose(format_args!("cancel signal received"));
                    shutdown.close(CloseReason::Cancelled).await;
                    return;
                }
                _ = sleep_until(deadline) => {
                    if idle.expired() {
                        reporter.basic(format_args!("idle timeout reached after {:?}", idle.timeout()));
                        shutdown.close(CloseReason::IdleTimeout).await;
                        return;
                    }
                }
                _ = shutdown.closed() => return,
            }
        }
    })
}

//! 双工字节流抽象与基于 tokio 的实现
//! 支持读写截止时间与可并发调用的关闭操作

use std::future::Future;
use std::io;
use std::sync::Arc;
use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{watch, Mutex};
use tokio::time::{timeout_at, Instant};
use tracing::debug;
use crate::common::error::{deadline_exceeded, stream_closed};

/// 可设置截止时间的双工字节流
///
/// 读到流结束时返回 `Ok(0)`；截止时间到期返回 `ErrorKind::TimedOut`；
/// 关闭后的任何操作返回 `ErrorKind::NotConnected`。`close` 可重复调用。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ByteStream: Send + Sync {
    /// 读取一次数据，返回读取的字节数
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// 写入数据，返回实际写入的字节数
    async fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// 关闭流，解除所有阻塞中的读写
    async fn close(&self) -> io::Result<()>;

    /// 设置读截止时间，`None` 表示不限
    fn set_read_deadline(&self, deadline: Option<Instant>);

    /// 设置写截止时间，`None` 表示不限
    fn set_write_deadline(&self, deadline: Option<Instant>);

    /// 同时设置读写截止时间
    fn set_deadline(&self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }
}

#[async_trait]
impl<T: ByteStream + ?Sized> ByteStream for Arc<T> {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf).await
    }

    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        (**self).write(buf).await
    }

    async fn close(&self) -> io::Result<()> {
        (**self).close().await
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) {
        (**self).set_read_deadline(deadline)
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) {
        (**self).set_write_deadline(deadline)
    }
}

/// 基于 tokio 异步 IO 的字节流端点（TCP 连接、内存管道等）
pub struct StreamEndpoint<S> {
    /// 读半部，关闭后为空
    reader: Mutex<Option<ReadHalf<S>>>,
    /// 写半部，关闭后为空
    writer: Mutex<Option<WriteHalf<S>>>,
    /// 关闭信号，置为 true 后唤醒所有阻塞操作
    closed: watch::Sender<bool>,
    /// 读截止时间
    read_deadline: SyncMutex<Option<Instant>>,
    /// 写截止时间
    write_deadline: SyncMutex<Option<Instant>>,
}

impl<S> StreamEndpoint<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// 包装一个异步双工流
    pub fn new(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let (closed, _) = watch::channel(false);
        Self {
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            closed,
            read_deadline: SyncMutex::new(None),
            write_deadline: SyncMutex::new(None),
        }
    }

    /// 是否已关闭
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// 等待关闭信号
    async fn wait_closed(&self) {
        let mut rx = self.closed.subscribe();
        // 发送端由自身持有，wait_for 只会在值变为 true 时返回
        let _ = rx.wait_for(|closed| *closed).await;
    }

    async fn read_inner(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or_else(stream_closed)?;
        let deadline = *self.read_deadline.lock();
        with_deadline(deadline, reader.read(buf)).await
    }

    async fn write_inner(&self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(stream_closed)?;
        let deadline = *self.write_deadline.lock();

        // 已有数据写出后再遇到错误或截止时间，返回已写出的字节数，错误留给下一次调用
        let mut written = 0;
        while written < buf.len() {
            match with_deadline(deadline, writer.write(&buf[written..])).await {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(err) if written > 0 => {
                    debug!("write interrupted after {} bytes: {}", written, err);
                    return Ok(written);
                }
                Err(err) => return Err(err),
            }
        }
        if let Err(err) = with_deadline(deadline, writer.flush()).await {
            if written == 0 {
                return Err(err);
            }
            debug!("flush after {} bytes failed: {}", written, err);
        }
        Ok(written)
    }
}

/// 在截止时间内完成 IO，到期返回 `TimedOut`
async fn with_deadline<F, T>(deadline: Option<Instant>, op: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match deadline {
        Some(deadline) => timeout_at(deadline, op)
            .await
            .map_err(|_| deadline_exceeded())?,
        None => op.await,
    }
}

#[async_trait]
impl<S> ByteStream for StreamEndpoint<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if self.is_closed() {
            return Err(stream_closed());
        }
        tokio::select! {
            biased;
            _ = self.wait_closed() => Err(stream_closed()),
            result = self.read_inner(buf) => result,
        }
    }

    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        if self.is_closed() {
            return Err(stream_closed());
        }
        if buf.is_empty() {
            return Ok(0);
        }
        tokio::select! {
            biased;
            _ = self.wait_closed() => Err(stream_closed()),
            result = self.write_inner(buf) => result,
        }
    }

    async fn close(&self) -> io::Result<()> {
        if self.closed.send_replace(true) {
            return Ok(());
        }

        // 阻塞中的读写已被唤醒并释放锁，此处取出两个半部并丢弃
        let writer = self.writer.lock().await.take();
        let mut result = Ok(());
        if let Some(mut writer) = writer {
            if let Err(err) = writer.shutdown().await {
                debug!("shutdown on close failed: {}", err);
                if !matches!(
                    err.kind(),
                    io::ErrorKind::NotConnected
                        | io::ErrorKind::BrokenPipe
                        | io::ErrorKind::ConnectionReset
                ) {
                    result = Err(err);
                }
            }
        }
        drop(self.reader.lock().await.take());
        result
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) {
        *self.read_deadline.lock() = deadline;
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) {
        *self.write_deadline.lock() = deadline;
    }
}

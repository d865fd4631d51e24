//! 单向复制循环与共享空闲计时器

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use crate::common::error::{is_end_of_stream, is_timeout, RelayError};
use crate::connection::ByteStream;

/// 双向共享的空闲计时器，任一方向成功传输即重置
#[derive(Debug)]
pub(crate) struct IdleTimer {
    /// 计时起点
    origin: Instant,
    /// 空闲超时时长
    timeout: Duration,
    /// 最近一次传输距起点的纳秒数
    last_activity: AtomicU64,
}

impl IdleTimer {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self {
            origin: Instant::now(),
            timeout,
            last_activity: AtomicU64::new(0),
        }
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }

    /// 记录一次传输
    pub(crate) fn touch(&self) {
        let offset = u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.last_activity.fetch_max(offset, Ordering::SeqCst);
    }

    /// 当前的空闲截止时间
    pub(crate) fn deadline(&self) -> Instant {
        let last = Duration::from_nanos(self.last_activity.load(Ordering::SeqCst));
        self.origin + last + self.timeout
    }

    pub(crate) fn expired(&self) -> bool {
        Instant::now() >= self.deadline()
    }
}

/// 从 `src` 复制到 `dst`，直到流结束或出错
///
/// 读截止时间取自共享空闲计时器；读超时但另一方向仍有传输时重新计时。
/// 写出的字节数实时累加到 `written`。
pub(crate) async fn copy_half<R, W>(
    src: &R,
    dst: &W,
    buf: &mut [u8],
    idle: &IdleTimer,
    written: &AtomicU64,
) -> Result<(), RelayError>
where
    R: ByteStream + ?Sized,
    W: ByteStream + ?Sized,
{
    loop {
        src.set_read_deadline(Some(idle.deadline()));
        let nr = match src.read(buf).await {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(err) if is_end_of_stream(&err) => return Ok(()),
            Err(err) if is_timeout(&err) && !idle.expired() => continue,
            Err(err) => return Err(err.into()),
        };

        dst.set_write_deadline(Some(Instant::now() + idle.timeout()));
        let nw = match dst.write(&buf[..nr]).await {
            Ok(nw) => nw,
            // 目标端字节上限耗尽，与读到流结束一样正常结束
            Err(err) if is_end_of_stream(&err) => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        if nw > nr {
            return Err(RelayError::InvalidWrite);
        }
        written.fetch_add(nw as u64, Ordering::SeqCst);
        if nw < nr {
            return Err(RelayError::ShortWrite);
        }
        idle.touch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use crate::common::error::cap_exceeded;
    use crate::connection::stream::MockByteStream;

    fn source_with(reads: Vec<io::Result<usize>>) -> MockByteStream {
        let mut src = MockByteStream::new();
        src.expect_set_read_deadline().returning(|_| ());
        let mut reads = reads.into_iter();
        src.expect_read().returning(move |buf: &mut [u8]| {
            let result = reads.next().unwrap_or(Ok(0));
            if let Ok(n) = result {
                buf[..n].fill(0xab);
            }
            result
        });
        src
    }

    fn sink_with(write: fn(usize) -> io::Result<usize>) -> MockByteStream {
        let mut dst = MockByteStream::new();
        dst.expect_set_write_deadline().returning(|_| ());
        dst.expect_write().returning(move |buf: &[u8]| write(buf.len()));
        dst
    }

    #[tokio::test]
    async fn test_copies_until_clean_eof() {
        let src = source_with(vec![Ok(10), Ok(20)]);
        let dst = sink_with(Ok);
        let idle = IdleTimer::new(Duration::from_secs(5));
        let written = AtomicU64::new(0);
        let mut buf = [0u8; 64];

        copy_half(&src, &dst, &mut buf, &idle, &written).await.unwrap();
        assert_eq!(written.load(Ordering::SeqCst), 30);
    }

    #[tokio::test]
    async fn test_short_write_is_reported() {
        let src = source_with(vec![Ok(10), Ok(10)]);
        let dst = sink_with(|len| Ok(len / 2));
        let idle = IdleTimer::new(Duration::from_secs(5));
        let written = AtomicU64::new(0);
        let mut buf = [0u8; 64];

        let err = copy_half(&src, &dst, &mut buf, &idle, &written).await.unwrap_err();
        assert!(matches!(err, RelayError::ShortWrite));
        assert_eq!(written.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_out_of_range_write_is_invalid() {
        let src = source_with(vec![Ok(10)]);
        let dst = sink_with(|len| Ok(len + 1));
        let idle = IdleTimer::new(Duration::from_secs(5));
        let written = AtomicU64::new(0);
        let mut buf = [0u8; 64];

        let err = copy_half(&src, &dst, &mut buf, &idle, &written).await.unwrap_err();
        assert!(matches!(err, RelayError::InvalidWrite));
        assert_eq!(written.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_write_error_passes_through() {
        let src = source_with(vec![Ok(10)]);
        let dst = sink_with(|_| Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone")));
        let idle = IdleTimer::new(Duration::from_secs(5));
        let written = AtomicU64::new(0);
        let mut buf = [0u8; 64];

        match copy_half(&src, &dst, &mut buf, &idle, &written).await {
            Err(RelayError::Io(err)) => assert_eq!(err.kind(), io::ErrorKind::BrokenPipe),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cap_exhausted_read_ends_cleanly() {
        let src = source_with(vec![Ok(10), Err(cap_exceeded())]);
        let dst = sink_with(Ok);
        let idle = IdleTimer::new(Duration::from_secs(5));
        let written = AtomicU64::new(0);
        let mut buf = [0u8; 64];

        copy_half(&src, &dst, &mut buf, &idle, &written).await.unwrap();
        assert_eq!(written.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_cap_exhausted_write_ends_cleanly() {
        let src = source_with(vec![Ok(10), Ok(10)]);
        let mut dst = MockByteStream::new();
        dst.expect_set_write_deadline().returning(|_| ());
        let mut writes = vec![Ok(10), Err(cap_exceeded())].into_iter();
        dst.expect_write()
            .times(2)
            .returning(move |_| writes.next().unwrap_or(Ok(0)));
        let idle = IdleTimer::new(Duration::from_secs(5));
        let written = AtomicU64::new(0);
        let mut buf = [0u8; 64];

        copy_half(&src, &dst, &mut buf, &idle, &written).await.unwrap();
        assert_eq!(written.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_read_error_passes_through() {
        let src = source_with(vec![Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))]);
        let dst = sink_with(Ok);
        let idle = IdleTimer::new(Duration::from_secs(5));
        let written = AtomicU64::new(0);
        let mut buf = [0u8; 64];

        let err = copy_half(&src, &dst, &mut buf, &idle, &written).await.unwrap_err();
        assert!(matches!(err, RelayError::Io(ref e) if e.kind() == io::ErrorKind::ConnectionReset));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timer_resets_on_touch() {
        let idle = IdleTimer::new(Duration::from_secs(2));
        let first = idle.deadline();
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!idle.expired());
        idle.touch();
        assert_eq!(idle.deadline(), first + Duration::from_secs(1));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(idle.expired());
    }
}

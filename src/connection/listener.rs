//! 监听器抽象与接入速率统计
//! 以整分钟为桶，滚动记录最近 10 分钟的接入次数

use std::io;
use std::net::SocketAddr;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use super::counter::InstrumentedConn;
use super::stream::{ByteStream, StreamEndpoint};

/// 保留的分钟桶数量
pub const MAX_MINUTES: usize = 10;

/// 可接受连接的监听器
#[async_trait]
pub trait Listener: Send + Sync {
    /// 接受的连接类型
    type Stream: ByteStream;

    /// 接受一个新连接
    async fn accept(&self) -> io::Result<(Self::Stream, SocketAddr)>;

    /// 监听地址
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl Listener for TcpListener {
    type Stream = StreamEndpoint<TcpStream>;

    async fn accept(&self) -> io::Result<(Self::Stream, SocketAddr)> {
        let (stream, addr) = TcpListener::accept(self).await?;
        Ok((StreamEndpoint::new(stream), addr))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// 分钟直方图，下标 0 为当前分钟
#[derive(Debug, Default)]
struct Histogram {
    buckets: [u64; MAX_MINUTES],
    last_minute: i64,
}

impl Histogram {
    /// 记录一次接入；跨分钟时只平移一格，不回填跳过的分钟
    fn record(&mut self, minute: i64) {
        if minute != self.last_minute {
            self.buckets.rotate_right(1);
            self.buckets[0] = 1;
            self.last_minute = minute;
        } else {
            self.buckets[0] += 1;
        }
    }
}

/// 带接入速率统计的监听器
pub struct AcceptRateTracker<L> {
    /// 被包装的监听器
    inner: L,
    /// 每分钟接入次数
    histogram: Mutex<Histogram>,
}

impl<L: Listener> AcceptRateTracker<L> {
    /// 包装监听器
    pub fn new(inner: L) -> Self {
        Self {
            inner,
            histogram: Mutex::new(Histogram::default()),
        }
    }

    /// 接受连接并包装为计数连接；无论成功与否都计入直方图
    pub async fn accept(&self) -> io::Result<(InstrumentedConn<L::Stream>, SocketAddr)> {
        let accepted = self.inner.accept().await;
        self.record(current_minute());
        accepted.map(|(stream, addr)| (InstrumentedConn::new(stream), addr))
    }

    /// 最近 10 分钟每分钟的接入次数，下标 0 为最近一分钟
    pub fn rates_per_minute(&self) -> [u64; MAX_MINUTES] {
        self.histogram.lock().buckets
    }

    /// 监听地址
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn get_ref(&self) -> &L {
        &self.inner
    }

    fn record(&self, minute: i64) {
        self.histogram.lock().record(minute);
    }
}

/// 当前的整分钟纪元
fn current_minute() -> i64 {
    Utc::now().timestamp() / 60
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::io::{duplex, DuplexStream};

    /// 每次接受都返回一条内存管道；可切换为返回错误
    struct MockListener {
        fail: AtomicBool,
    }

    impl MockListener {
        fn new() -> Self {
            Self { fail: AtomicBool::new(false) }
        }
    }

    #[async_trait]
    impl Listener for MockListener {
        type Stream = StreamEndpoint<DuplexStream>;

        async fn accept(&self) -> io::Result<(Self::Stream, SocketAddr)> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::Other, "accept failed"));
            }
            let (local, _peer) = duplex(64);
            Ok((StreamEndpoint::new(local), "127.0.0.1:9".parse().unwrap()))
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok("127.0.0.1:2101".parse().unwrap())
        }
    }

    #[tokio::test]
    async fn test_accept_wraps_fresh_connection() {
        let tracker = AcceptRateTracker::new(MockListener::new());
        let (conn, addr) = tracker.accept().await.unwrap();
        assert_eq!(addr, "127.0.0.1:9".parse::<SocketAddr>().unwrap());
        assert_eq!(conn.upstream_bytes(), 0);
        assert_eq!(conn.downstream_bytes(), 0);
        assert_eq!(conn.remaining_cap(), None);
    }

    #[tokio::test]
    async fn test_accepts_are_counted() {
        let tracker = AcceptRateTracker::new(MockListener::new());
        for _ in 0..815 {
            tracker.accept().await.unwrap();
        }
        // 测试期间可能跨过整分钟边界，合计值不受影响
        let rates = tracker.rates_per_minute();
        assert_eq!(rates.iter().sum::<u64>(), 815);
    }

    #[tokio::test]
    async fn test_failed_accept_still_counted() {
        let tracker = AcceptRateTracker::new(MockListener::new());
        tracker.get_ref().fail.store(true, Ordering::SeqCst);
        let err = tracker.accept().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Other);
        assert_eq!(tracker.rates_per_minute().iter().sum::<u64>(), 1);
    }

    #[test]
    fn test_same_minute_increments_bucket_zero() {
        let tracker = AcceptRateTracker::new(MockListener::new());
        for _ in 0..60 {
            tracker.record(1_000);
        }
        assert_eq!(tracker.rates_per_minute()[0], 60);
    }

    #[test]
    fn test_minute_rollover_shifts_buckets() {
        let tracker = AcceptRateTracker::new(MockListener::new());
        for _ in 0..5 {
            tracker.record(1_000);
        }
        tracker.record(1_001);
        let rates = tracker.rates_per_minute();
        assert_eq!(rates[0], 1);
        assert_eq!(rates[1], 5);

        // 跳过多个分钟也只平移一格
        tracker.record(1_009);
        let rates = tracker.rates_per_minute();
        assert_eq!(&rates[..3], &[1, 1, 5]);
    }

    #[test]
    fn test_oldest_bucket_is_discarded() {
        let tracker = AcceptRateTracker::new(MockListener::new());
        for minute in 0..(MAX_MINUTES as i64 + 3) {
            for _ in 0..=minute {
                tracker.record(100 + minute);
            }
        }
        let rates = tracker.rates_per_minute();
        assert_eq!(rates[0], MAX_MINUTES as u64 + 3);
        assert_eq!(rates[MAX_MINUTES - 1], 4);
    }
}

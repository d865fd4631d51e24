//! 转发服务器模块
//! 接受客户端连接，连接上游并在两者之间中继数据

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use crate::common::error::{Result, ServerError};
use crate::common::stats::StatsManager;
use crate::config::NodeConfig;
use crate::connection::{AcceptRateTracker, ByteStream, InstrumentedConn, StreamEndpoint};
use crate::relay::RelayEngine;

type ClientConn = InstrumentedConn<StreamEndpoint<TcpStream>>;

/// TCP 转发服务器
pub struct Forwarder {
    config: NodeConfig,
    listener: Arc<AcceptRateTracker<TcpListener>>,
    engine: Arc<RelayEngine>,
    stats: Arc<StatsManager>,
    shutdown: watch::Sender<bool>,
}

impl Forwarder {
    /// 绑定监听地址
    pub async fn bind(config: NodeConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.listen_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.listen_addr.to_string(),
                source,
            })?;
        let engine = Arc::new(RelayEngine::from_config(&config.relay));
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            listener: Arc::new(AcceptRateTracker::new(listener)),
            engine,
            stats: Arc::new(StatsManager::new()),
            shutdown,
        })
    }

    /// 实际监听地址
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn stats(&self) -> Arc<StatsManager> {
        Arc::clone(&self.stats)
    }

    pub fn accept_rates(&self) -> Arc<AcceptRateTracker<TcpListener>> {
        Arc::clone(&self.listener)
    }

    /// 运行接受循环，直到 `signal` 完成；返回前取消并等待所有进行中的中继
    pub async fn run<F>(&self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!(
            "转发服务器已启动，监听地址: {}，上游: {}",
            self.local_addr()?,
            self.config.upstream_addr
        );

        let reporter = (self.config.stats_interval_secs > 0).then(|| {
            self.stats.start(
                Arc::clone(&self.listener),
                Duration::from_secs(self.config.stats_interval_secs),
                self.shutdown.subscribe(),
            )
        });

        let mut connections = JoinSet::new();
        tokio::pin!(signal);
        loop {
            tokio::select! {
                _ = &mut signal => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((client, addr)) => {
                        info!("新连接来自: {}", addr);
                        self.stats.increment_connection();
                        connections.spawn(handle_connection(
                            client,
                            addr,
                            self.config.clone(),
                            Arc::clone(&self.engine),
                            Arc::clone(&self.stats),
                            self.shutdown.subscribe(),
                        ));
                    }
                    Err(e) => {
                        error!("接受连接失败: {}", e);
                        self.stats.increment_error();
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        warn!("连接任务异常退出: {}", e);
                    }
                }
            }
        }

        info!("转发服务器正在关闭，等待 {} 个连接结束", connections.len());
        self.shutdown.send_replace(true);
        while let Some(joined) = connections.join_next().await {
            if let Err(e) = joined {
                warn!("连接任务异常退出: {}", e);
            }
        }
        if let Some(reporter) = reporter {
            let _ = reporter.await;
        }
        info!("所有连接已关闭");
        Ok(())
    }
}

/// 处理单个客户端连接
async fn handle_connection(
    client: ClientConn,
    addr: SocketAddr,
    config: NodeConfig,
    engine: Arc<RelayEngine>,
    stats: Arc<StatsManager>,
    mut shutdown: watch::Receiver<bool>,
) {
    client.set_cap(config.byte_cap);
    let client = Arc::new(client);

    let upstream = match connect_upstream(&config).await {
        Ok(upstream) => upstream,
        Err(e) => {
            warn!("{} 的上游连接失败: {}", addr, e);
            stats.increment_error();
            if let Err(e) = client.close().await {
                debug!("关闭客户端 {} 失败: {}", addr, e);
            }
            stats.decrement_connection(0, 0);
            return;
        }
    };

    let cancel = async move {
        let _ = shutdown.wait_for(|stop| *stop).await;
    };
    match engine
        .run(cancel, Arc::clone(&client), StreamEndpoint::new(upstream))
        .await
    {
        Ok(transferred) => info!("{} 中继结束，共传输 {} 字节", addr, transferred),
        Err(failure) if failure.is_timeout() => info!("{} {}", addr, failure),
        Err(failure) => {
            warn!("{} {}", addr, failure);
            stats.increment_error();
        }
    }

    debug!(
        "{} 上行 {} 字节，下行 {} 字节",
        addr,
        client.upstream_bytes(),
        client.downstream_bytes()
    );
    stats.decrement_connection(client.upstream_bytes(), client.downstream_bytes());
}

/// 在超时时间内连接上游
async fn connect_upstream(config: &NodeConfig) -> std::result::Result<TcpStream, ServerError> {
    let addr = config.upstream_addr.as_str();
    let connect_timeout = Duration::from_secs(config.connect_timeout_secs);
    match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(source)) => Err(ServerError::Connect {
            addr: addr.to_string(),
            source,
        }),
        Err(_) => Err(ServerError::ConnectTimeout(addr.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::oneshot;

    /// 回显服务器，返回其地址
    async fn spawn_echo() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut reader, mut writer) = stream.split();
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                });
            }
        });
        addr
    }

    fn test_config(upstream: String) -> NodeConfig {
        NodeConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            upstream_addr: upstream,
            connect_timeout_secs: 2,
            stats_interval_secs: 0,
            ..NodeConfig::default()
        }
    }

    #[tokio::test]
    async fn test_bind_error_reports_address() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = test_config("127.0.0.1:1".into());
        config.listen_addr = taken.local_addr().unwrap();

        let err = Forwarder::bind(config).await.err().expect("bind should fail");
        assert!(err.to_string().contains(&taken.local_addr().unwrap().to_string()));
    }

    #[tokio::test]
    async fn test_forwards_to_upstream_and_stops_on_shutdown() {
        let upstream = spawn_echo().await;
        let forwarder = Arc::new(Forwarder::bind(test_config(upstream.to_string())).await.unwrap());
        let addr = forwarder.local_addr().unwrap();

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = tokio::spawn({
            let forwarder = Arc::clone(&forwarder);
            async move {
                forwarder
                    .run(async move {
                        let _ = stop_rx.await;
                    })
                    .await
            }
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"omg it works!").await.unwrap();
        let mut buf = [0u8; 13];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"omg it works!");

        // 连接保持打开，关闭服务器时中继被取消
        stop_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("forwarder did not stop")
            .unwrap()
            .unwrap();

        let mut rest = Vec::new();
        let _ = client.read_to_end(&mut rest).await;
        assert!(rest.is_empty());

        let stats = forwarder.stats().connection_stats();
        assert_eq!(stats.total_connections, 1);
        assert_eq!(stats.current_connections, 0);
        assert_eq!(stats.upstream_bytes, 13);
        assert_eq!(stats.downstream_bytes, 13);
        assert_eq!(forwarder.accept_rates().rates_per_minute().iter().sum::<u64>(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_upstream_closes_client() {
        // 取一个已释放的端口作为不可达的上游
        let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream = unused.local_addr().unwrap();
        drop(unused);

        let forwarder = Arc::new(Forwarder::bind(test_config(upstream.to_string())).await.unwrap());
        let addr = forwarder.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = tokio::spawn({
            let forwarder = Arc::clone(&forwarder);
            async move {
                forwarder
                    .run(async move {
                        let _ = stop_rx.await;
                    })
                    .await
            }
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut buf))
            .await
            .expect("client was not closed");
        assert!(read.map(|n| n == 0).unwrap_or(true));

        stop_tx.send(()).unwrap();
        server.await.unwrap().unwrap();
        assert_eq!(forwarder.stats().connection_stats().connection_errors, 1);
    }
}

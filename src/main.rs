//! TCP 转发服务入口
//! 读取配置，监听客户端并转发到上游

use clap::Parser;
use std::net::SocketAddr;
use tracing::{error, info};
use netrelay::{config, init_logging, Forwarder};

/// 转发服务命令行参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// 监听地址，覆盖配置文件
    #[arg(short, long, env = "NETRELAY_LISTEN")]
    listen: Option<SocketAddr>,

    /// 上游地址，覆盖配置文件
    #[arg(short, long, env = "NETRELAY_UPSTREAM")]
    upstream: Option<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = config::load(&args.config)?;
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if let Some(upstream) = args.upstream {
        config.upstream_addr = upstream;
    }

    let rt = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    rt.block_on(async {
        init_logging(&config.log.level);
        info!("netrelay starting with config: {}", args.config);

        let forwarder = Forwarder::bind(config).await?;
        forwarder
            .run(async {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => info!("收到退出信号"),
                    Err(e) => {
                        error!("监听退出信号失败: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            })
            .await?;

        Ok::<(), Box<dyn std::error::Error>>(())
    })
}

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use wsproxy::config::{Config, DEFAULT_CONFIG_FILE};
use wsproxy::server::Server;
use wsproxy::tls;

/// 单端口多协议代理网关，TLS 连接升级为 WebSocket 隧道
#[derive(Parser, Debug)]
#[command(name = "wsproxy", version, about)]
struct Args {
    /// JSON 配置文件路径
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// 监听地址，配置文件的 ListenAddr 非空时以其为准
    #[arg(short, long, default_value = "0.0.0.0:1080")]
    listen: String,

    /// 日志详细程度（-v、-vv 递增）
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_target(false)
        .init();

    info!("wsproxy v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load(&args.config)?;
    info!(
        servers = config.servers.len(),
        disable_proxy = config.disable_proxy,
        encoding = %config.encoding,
        "configuration loaded from {}",
        args.config.display()
    );

    let acceptor = tls::build_acceptor(&config)?;
    let connector = if config.is_client_mode() {
        Some(tls::build_connector(&config)?)
    } else {
        None
    };

    let server = Arc::new(Server::new(config, acceptor, connector)?);

    let shutdown_server = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received shutdown signal, stopping server...");
            shutdown_server.stop();
        }
    });

    server.run(&args.listen).await?;
    info!("server stopped");
    Ok(())
}

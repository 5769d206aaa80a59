/// 监听管理
///
/// Server 同时驱动两个接受循环：绑定在配置地址上的公网 TCP 监听，
/// 和 <tmp>/wsproxy-<pid>/wsproxy.sock 上的本地 IPC 监听。每条接入
/// 连接分配一个进程内单调递增的连接 ID，然后交给独立任务中的分发
/// 器。一个监听器出错只结束它自己的循环，另一个继续工作。
use crate::config::{AuthFn, Config, CredentialStore};
use crate::dispatch;
use crate::error::{ProxyError, Result};
use crate::tunnel::DownstreamTarget;
use rand::seq::SliceRandom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::broadcast;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{error, info};

/// IPC 套接字文件名
const IPC_SOCK_NAME: &str = "wsproxy.sock";

/// 各连接处理器共享的只读状态
pub struct ServerContext {
    pub config: Config,
    /// 隧道用的 TLS 接受器
    pub acceptor: TlsAcceptor,
    /// 客户端模式下转发到上游用的 TLS 连接器
    pub connector: Option<TlsConnector>,
    credentials: Arc<CredentialStore>,
    ipc_path: PathBuf,
    next_id: AtomicU64,
}

impl ServerContext {
    /// 分配下一个连接 ID，从 1 开始，进程内严格递增
    pub fn next_connection_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// 凭据表非空时返回认证判定函数
    pub fn auth_fn(&self) -> Option<AuthFn> {
        self.credentials.auth_fn()
    }

    /// 均匀随机选取一个上游服务器
    pub fn pick_upstream(&self) -> Option<String> {
        self.config.servers.choose(&mut rand::thread_rng()).cloned()
    }

    /// 隧道的下游目标
    pub fn downstream_target(&self) -> DownstreamTarget {
        if self.config.upstream_proxy_server.is_empty() {
            DownstreamTarget::Ipc(self.ipc_path.clone())
        } else {
            DownstreamTarget::Tcp(self.config.upstream_proxy_server.clone())
        }
    }

    /// 本进程 IPC 端点的路径
    pub fn ipc_path(&self) -> &Path {
        &self.ipc_path
    }
}

/// 双监听代理网关
pub struct Server {
    ctx: Arc<ServerContext>,
    shutdown: broadcast::Sender<()>,
}

impl Server {
    /// 创建服务器并准备 IPC 目录
    pub fn new(
        config: Config,
        acceptor: TlsAcceptor,
        connector: Option<TlsConnector>,
    ) -> Result<Server> {
        let dir = std::env::temp_dir().join(format!("wsproxy-{}", std::process::id()));
        std::fs::create_dir_all(&dir).map_err(|e| ProxyError::Listener {
            addr: dir.display().to_string(),
            source: e,
        })?;
        let ipc_path = dir.join(IPC_SOCK_NAME);

        let credentials = Arc::new(CredentialStore::from_users(&config.users));
        let (shutdown, _) = broadcast::channel(1);

        Ok(Server {
            ctx: Arc::new(ServerContext {
                config,
                acceptor,
                connector,
                credentials,
                ipc_path,
                next_id: AtomicU64::new(0),
            }),
            shutdown,
        })
    }

    /// 共享状态
    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// 运行两个接受循环，直到 stop 或两个循环都退出
    ///
    /// 配置的 ListenAddr 非空时覆盖 default_addr。
    pub async fn run(&self, default_addr: &str) -> Result<()> {
        let listen_addr = if self.ctx.config.listen_addr.is_empty() {
            default_addr.to_string()
        } else {
            self.ctx.config.listen_addr.clone()
        };

        let public = tokio::spawn(public_loop(
            self.ctx.clone(),
            self.shutdown.subscribe(),
            listen_addr,
        ));
        let local = tokio::spawn(ipc_loop(self.ctx.clone(), self.shutdown.subscribe()));

        let _ = public.await;
        let _ = local.await;
        Ok(())
    }

    /// 关闭两个接受循环，存量连接自行结束
    pub fn stop(&self) {
        let _ = self.shutdown.send(());
    }
}

async fn public_loop(
    ctx: Arc<ServerContext>,
    mut shutdown: broadcast::Receiver<()>,
    addr: String,
) {
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("{}", ProxyError::Listener { addr, source: e });
            return;
        }
    };
    info!("listening on {}", addr);

    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((stream, peer)) => {
                    let id = ctx.next_connection_id();
                    info!(id, %peer, "accepted connection");
                    let ctx = ctx.clone();
                    tokio::spawn(dispatch::handle_client(ctx, id, stream, peer));
                }
                Err(e) => {
                    error!("accept error: {}", e);
                    break;
                }
            },
            _ = shutdown.recv() => {
                info!("public listener shutting down");
                break;
            }
        }
    }
}

async fn ipc_loop(ctx: Arc<ServerContext>, mut shutdown: broadcast::Receiver<()>) {
    let path = ctx.ipc_path().to_path_buf();

    // 复用时先清掉遗留的套接字文件
    let _ = std::fs::remove_file(&path);

    let listener = match UnixListener::bind(&path) {
        Ok(listener) => listener,
        Err(e) => {
            error!(
                "{}",
                ProxyError::Listener {
                    addr: path.display().to_string(),
                    source: e,
                }
            );
            return;
        }
    };
    info!("ipc endpoint at {}", path.display());

    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((stream, _)) => {
                    let id = ctx.next_connection_id();
                    let ctx = ctx.clone();
                    tokio::spawn(dispatch::handle_local(ctx, id, stream));
                }
                Err(e) => {
                    error!("ipc accept error: {}", e);
                    break;
                }
            },
            _ = shutdown.recv() => {
                info!("ipc listener shutting down");
                break;
            }
        }
    }
}

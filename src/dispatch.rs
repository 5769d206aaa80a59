/// 协议嗅探与分发
///
/// 每条接入连接先看一个字节：0x05 是 SOCKS5，'G'/'C' 是明文 HTTP
/// 请求行，0x16 是 TLS ClientHello，其余一律关闭。被看过的字节留
/// 在流里，选中的下游处理器会原样读到它。
use crate::error::{ProxyError, Result};
use crate::peek::PeekableStream;
use crate::server::ServerContext;
use crate::{http, socks5, tunnel, upstream};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpStream, UnixStream};
use tracing::{debug, info, warn};

/// 首字节分类结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// SOCKS5 版本字节
    Socks5,
    /// GET / CONNECT 等明文请求行
    Http,
    /// TLS ClientHello，走隧道
    Tls,
    /// 无法识别
    Unknown(u8),
}

impl Protocol {
    /// 按首字节分类
    pub fn classify(first_byte: u8) -> Self {
        match first_byte {
            0x05 => Protocol::Socks5,
            b'G' | b'C' => Protocol::Http,
            0x16 => Protocol::Tls,
            other => Protocol::Unknown(other),
        }
    }
}

/// 处理一条公网连接，所有失败都止步于本连接
pub async fn handle_client(ctx: Arc<ServerContext>, id: u64, stream: TcpStream, peer: SocketAddr) {
    if let Err(e) = dispatch_public(ctx, id, stream, peer).await {
        warn!(id, %peer, "connection closed: {}", e);
    }
}

async fn dispatch_public(
    ctx: Arc<ServerContext>,
    id: u64,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<()> {
    let mut stream = PeekableStream::new(stream);
    let first = stream
        .peek(1)
        .await
        .map_err(|e| ProxyError::relay(format!("peek first byte: {}", e)))?[0];

    match Protocol::classify(first) {
        proto @ (Protocol::Socks5 | Protocol::Http) => {
            if ctx.config.disable_proxy {
                info!(id, %peer, "proxy disabled, dropping non-tunnel connection");
                return Ok(());
            }

            if let (Some(server), Some(connector)) =
                (ctx.pick_upstream(), ctx.connector.as_ref())
            {
                // 客户端模式：随机选中的上游收走整条流，含已看过的首字节
                debug!(id, %peer, ?proto, %server, "forwarding to upstream");
                let (insize, tosize) =
                    upstream::forward(id, stream, &server, connector, ctx.config.encoding).await?;
                info!(id, %peer, insize, tosize, "exit proxy with client");
            } else {
                let auth = ctx.auth_fn();
                match proto {
                    Protocol::Socks5 => {
                        socks5::serve(id, stream, auth).await?;
                        info!(id, %peer, "leave socks5 proxy with client");
                    }
                    _ => {
                        http::serve(id, stream, auth).await?;
                        info!(id, %peer, "leave http proxy with client");
                    }
                }
            }
            Ok(())
        }
        Protocol::Tls => {
            info!(id, %peer, "start tls connection");
            let outcome = tunnel::serve(
                id,
                stream,
                &ctx.acceptor,
                &ctx.downstream_target(),
                ctx.config.encoding,
            )
            .await?;
            if let Some(e) = &outcome.error {
                debug!(id, "tunnel session ended: {}", e);
            }
            info!(
                id,
                from_ws = outcome.from_ws,
                to_ws = outcome.to_ws,
                "wss proxy disconnect"
            );
            Ok(())
        }
        Protocol::Unknown(byte) => Err(ProxyError::UnknownProtocol(byte)),
    }
}

/// 处理一条本地 IPC 连接，只在 SOCKS5 和 HTTP 之间分发
pub async fn handle_local(ctx: Arc<ServerContext>, id: u64, stream: UnixStream) {
    info!(id, "start local connection");
    match dispatch_local(ctx, id, stream).await {
        Ok(()) => info!(id, "exit local connection"),
        Err(e) => warn!(id, "local connection closed: {}", e),
    }
}

async fn dispatch_local(ctx: Arc<ServerContext>, id: u64, stream: UnixStream) -> Result<()> {
    let mut stream = PeekableStream::new(stream);
    let first = stream
        .peek(1)
        .await
        .map_err(|e| ProxyError::relay(format!("peek first byte: {}", e)))?[0];

    let auth = ctx.auth_fn();
    match Protocol::classify(first) {
        Protocol::Socks5 => {
            socks5::serve(id, stream, auth).await?;
            Ok(())
        }
        Protocol::Http => {
            http::serve(id, stream, auth).await?;
            Ok(())
        }
        // IPC 侧没有隧道路径
        Protocol::Tls | Protocol::Unknown(_) => Err(ProxyError::UnknownProtocol(first)),
    }
}

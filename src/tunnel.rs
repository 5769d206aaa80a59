/// TLS + WebSocket 隧道
///
/// 被分类为 TLS 的连接在这里完成服务端 TLS 握手、WebSocket 升级，
/// 然后与下游套接字做双向中继。下游每读出一块就封成一个二进制
/// WebSocket 消息，反方向每收到一个消息就整体写入下游。消息边界
/// 只是载荷的切块方式，与上层协议无关。
use crate::config::Encoding;
use crate::error::{ProxyError, Result};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use futures_util::{SinkExt, StreamExt};
use std::fmt;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

/// 下行读取缓冲大小，一次读取对应一个 WebSocket 帧
pub const READ_CHUNK_SIZE: usize = 256 * 1024;

/// 单个消息解压后的大小上限
pub const MAX_DECODED_FRAME: usize = 512 * 1024;

/// 隧道下游连接的统一封装
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// 隧道的下游目标
#[derive(Debug, Clone)]
pub enum DownstreamTarget {
    /// 配置的上游代理 TCP 地址
    Tcp(String),
    /// 本进程的 IPC 端点
    Ipc(PathBuf),
}

impl DownstreamTarget {
    /// 建立下游连接
    pub async fn dial(&self) -> io::Result<Pin<Box<dyn Transport>>> {
        match self {
            DownstreamTarget::Tcp(addr) => {
                let stream = TcpStream::connect(addr).await?;
                Ok(Box::pin(stream))
            }
            DownstreamTarget::Ipc(path) => {
                let stream = UnixStream::connect(path).await?;
                Ok(Box::pin(stream))
            }
        }
    }
}

impl fmt::Display for DownstreamTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownstreamTarget::Tcp(addr) => write!(f, "{}", addr),
            DownstreamTarget::Ipc(path) => write!(f, "{}", path.display()),
        }
    }
}

/// 一次隧道会话的收尾信息
pub struct RelayOutcome {
    /// 从 WebSocket 收到并写入下游的字节数
    pub from_ws: u64,
    /// 从下游读出并发往 WebSocket 的字节数（压缩前）
    pub to_ws: u64,
    /// 终止会话的错误，双向都正常收尾时为 None
    pub error: Option<ProxyError>,
}

/// 运行一条完整的隧道会话
pub async fn serve<S>(
    id: u64,
    stream: S,
    acceptor: &TlsAcceptor,
    target: &DownstreamTarget,
    encoding: Encoding,
) -> Result<RelayOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let tls_stream = acceptor
        .accept(stream)
        .await
        .map_err(|e| ProxyError::handshake(format!("tls accept: {}", e)))?;

    let ws = tokio_tungstenite::accept_async(tls_stream)
        .await
        .map_err(|e| ProxyError::handshake(format!("websocket upgrade: {}", e)))?;

    let downstream = target
        .dial()
        .await
        .map_err(|e| ProxyError::relay(format!("connect to {}: {}", target, e)))?;
    debug!(id, "tunnel session established, downstream {}", target);

    Ok(relay(ws, downstream, encoding, id).await)
}

/// 在 WebSocket 端与字节流之间双向中继
///
/// 两个方向各自运行在独立任务中，并把终止结果写入容量为 2 的
/// 通道。第一个错误立刻结束会话，两个方向都干净到达 EOF 也结束；
/// 残留的拷贝任务被中止，连接随之关闭。
pub async fn relay<T, S>(
    ws: WebSocketStream<T>,
    downstream: S,
    encoding: Encoding,
    id: u64,
) -> RelayOutcome
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut ws_sink, mut ws_source) = ws.split();
    let (mut down_read, mut down_write) = tokio::io::split(downstream);

    let (done_tx, mut done_rx) = mpsc::channel::<std::result::Result<(), ProxyError>>(2);

    let to_ws = Arc::new(AtomicU64::new(0));
    let from_ws = Arc::new(AtomicU64::new(0));

    let to_ws_count = to_ws.clone();
    let up_tx = done_tx.clone();
    let up = tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        let result = loop {
            let n = match down_read.read(&mut buf).await {
                // 下游半关，把 EOF 作为 Close 帧传给对端
                Ok(0) => {
                    let _ = ws_sink.send(Message::Close(None)).await;
                    break Ok(());
                }
                Ok(n) => n,
                Err(e) => break Err(ProxyError::relay(format!("downstream read: {}", e))),
            };
            let payload = match encode_chunk(encoding, &buf[..n]) {
                Ok(p) => p,
                Err(e) => break Err(ProxyError::relay(format!("compress: {}", e))),
            };
            // send 自带 flush，保证整帧落到线上
            if let Err(e) = ws_sink.send(Message::Binary(payload.into())).await {
                break Err(ProxyError::relay(format!("websocket send: {}", e)));
            }
            to_ws_count.fetch_add(n as u64, Ordering::Relaxed);
        };
        let _ = up_tx.send(result).await;
    });

    let from_ws_count = from_ws.clone();
    let down = tokio::spawn(async move {
        let result = loop {
            let message = match ws_source.next().await {
                None => {
                    let _ = down_write.shutdown().await;
                    break Ok(());
                }
                Some(Ok(m)) => m,
                Some(Err(e)) => break Err(ProxyError::relay(format!("websocket read: {}", e))),
            };
            match message {
                Message::Binary(payload) => {
                    let data = match decode_chunk(encoding, &payload) {
                        Ok(d) => d,
                        Err(e) => break Err(ProxyError::relay(format!("decompress: {}", e))),
                    };
                    if let Err(e) = down_write.write_all(&data).await {
                        break Err(ProxyError::relay(format!("downstream write: {}", e)));
                    }
                    from_ws_count.fetch_add(data.len() as u64, Ordering::Relaxed);
                }
                // 对端半关，传给下游写侧
                Message::Close(_) => {
                    let _ = down_write.shutdown().await;
                    break Ok(());
                }
                // Ping/Pong 由协议层应答，文本帧不在协议之内，忽略
                _ => {}
            }
        };
        let _ = done_tx.send(result).await;
    });

    let mut error = None;
    for _ in 0..2 {
        match done_rx.recv().await {
            Some(Ok(())) => continue,
            Some(Err(e)) => {
                debug!(id, "relay direction failed: {}", e);
                error = Some(e);
                break;
            }
            None => break,
        }
    }

    up.abort();
    down.abort();

    RelayOutcome {
        from_ws: from_ws.load(Ordering::Relaxed),
        to_ws: to_ws.load(Ordering::Relaxed),
        error,
    }
}

/// 把一块下游数据编码为一帧载荷
///
/// zlib 模式下每帧都是独立完整的 zlib 流，接收端不得假设帧间
/// 共享压缩状态。
fn encode_chunk(encoding: Encoding, chunk: &[u8]) -> io::Result<Vec<u8>> {
    match encoding {
        Encoding::None => Ok(chunk.to_vec()),
        Encoding::Zlib => {
            let mut encoder = ZlibEncoder::new(
                Vec::with_capacity(chunk.len() / 2 + 64),
                Compression::default(),
            );
            encoder.write_all(chunk)?;
            encoder.finish()
        }
    }
}

/// 把一帧载荷还原为下游数据
fn decode_chunk(encoding: Encoding, payload: &[u8]) -> io::Result<Vec<u8>> {
    match encoding {
        Encoding::None => Ok(payload.to_vec()),
        Encoding::Zlib => {
            let mut decoded = Vec::new();
            let mut decoder = ZlibDecoder::new(payload).take(MAX_DECODED_FRAME as u64 + 1);
            decoder.read_to_end(&mut decoded)?;
            if decoded.len() > MAX_DECODED_FRAME {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("decompressed frame exceeds {} bytes", MAX_DECODED_FRAME),
                ));
            }
            Ok(decoded)
        }
    }
}

/// 上游转发
///
/// 客户端模式下，被分类为代理协议的连接整条转发给选中的上游节点。
/// 转发走与隧道对称的通道：TLS 1.3 握手（按配置出示客户端证书）、
/// WebSocket 升级，然后把本地字节流按配置的编码装帧中继。上游节点
/// 的分发器会把这条连接当作 TLS 隧道收下并解包回代理字节流。
use crate::config::Encoding;
use crate::error::{ProxyError, Result};
use crate::tunnel::{self, RelayOutcome};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// 把一条已分类的客户端连接转发给上游，返回（收到的字节数，送出的字节数）
pub async fn forward<S>(
    id: u64,
    stream: S,
    server: &str,
    connector: &TlsConnector,
    encoding: Encoding,
) -> Result<(u64, u64)>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let host = server
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(server)
        .trim_start_matches('[')
        .trim_end_matches(']');

    let tcp = TcpStream::connect(server)
        .await
        .map_err(|e| ProxyError::relay(format!("connect to upstream {}: {}", server, e)))?;

    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| ProxyError::handshake(format!("invalid upstream server name {}: {}", host, e)))?;

    let tls_stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| ProxyError::handshake(format!("tls connect to {}: {}", server, e)))?;

    let url = format!("wss://{}/", server);
    let (ws, _) = tokio_tungstenite::client_async(url, tls_stream)
        .await
        .map_err(|e| ProxyError::handshake(format!("websocket upgrade with {}: {}", server, e)))?;
    debug!(id, server, "upstream websocket session established");

    let RelayOutcome {
        from_ws,
        to_ws,
        error,
    } = tunnel::relay(ws, stream, encoding, id).await;

    if let Some(e) = error {
        debug!(id, "upstream relay ended: {}", e);
    }
    Ok((from_ws, to_ws))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls;

    #[tokio::test]
    async fn test_forward_fails_when_upstream_unreachable() {
        // 绑定后立刻释放，得到一个大概率无人监听的端口
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let connector = TlsConnector::from(tls::load_client_config(None, None, true).unwrap());
        let (_client, gateway_side) = tokio::io::duplex(64);

        let err = forward(
            1,
            gateway_side,
            &format!("127.0.0.1:{}", port),
            &connector,
            Encoding::None,
        )
        .await
        .unwrap_err();
        assert!(err.is_relay());
    }
}

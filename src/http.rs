/// HTTP 代理会话
///
/// CONNECT 建立隧道，绝对形式的普通请求重写为 origin 形式后转发
/// 给源站。凭据表非空时校验 Proxy-Authorization 的 Basic 凭据。
use crate::config::AuthFn;
use crate::io_util::relay_streams;
use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// 请求头大小上限
const MAX_HEAD_SIZE: usize = 8 * 1024;

/// 运行一次完整的 HTTP 代理会话直到连接结束
pub async fn serve<S>(id: u64, mut stream: S, auth: Option<AuthFn>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let head = read_head(&mut stream).await?;
    let head = String::from_utf8_lossy(&head).into_owned();

    let first_line = head.lines().next().unwrap_or_default();
    let parts: Vec<&str> = first_line.split_whitespace().collect();
    if parts.len() < 3 {
        respond(&mut stream, "400 Bad Request").await.ok();
        bail!("malformed request line: {:?}", first_line);
    }
    let (method, target, version) = (parts[0], parts[1], parts[2]);

    if let Some(auth) = &auth {
        if !check_proxy_auth(&head, auth) {
            stream
                .write_all(
                    b"HTTP/1.1 407 Proxy Authentication Required\r\n\
                      Proxy-Authenticate: Basic realm=\"wsproxy\"\r\n\
                      Connection: close\r\n\r\n",
                )
                .await?;
            bail!("proxy authentication failed");
        }
    }

    if method.eq_ignore_ascii_case("CONNECT") {
        if !target.contains(':') {
            respond(&mut stream, "400 Bad Request").await.ok();
            bail!("invalid CONNECT target: {}", target);
        }
        debug!(id, "http connect to {}", target);

        let upstream = match TcpStream::connect(target).await {
            Ok(s) => s,
            Err(e) => {
                respond(&mut stream, "502 Bad Gateway").await.ok();
                return Err(e).with_context(|| format!("connect to {}", target));
            }
        };
        stream
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await?;

        relay_streams(id, stream, upstream).await;
    } else {
        // 绝对形式，如 GET http://example.com/ HTTP/1.1
        let (addr, origin_form) = match parse_absolute_uri(target) {
            Ok(v) => v,
            Err(e) => {
                respond(&mut stream, "400 Bad Request").await.ok();
                return Err(e);
            }
        };
        debug!(id, "http forward {} to {}", method, addr);

        let mut upstream = match TcpStream::connect(&addr).await {
            Ok(s) => s,
            Err(e) => {
                respond(&mut stream, "502 Bad Gateway").await.ok();
                return Err(e).with_context(|| format!("connect to {}", addr));
            }
        };

        let rewritten = rewrite_head(&head, method, &origin_form, version);
        upstream.write_all(rewritten.as_bytes()).await?;

        relay_streams(id, stream, upstream).await;
    }

    Ok(())
}

/// 逐字节读取请求头直到空行，超过上限即拒绝
async fn read_head<S>(stream: &mut S) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut buffer = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await.context("read request head")?;
        buffer.push(byte[0]);

        if buffer.len() >= 4 && &buffer[buffer.len() - 4..] == b"\r\n\r\n" {
            break;
        }
        if buffer.len() > MAX_HEAD_SIZE {
            bail!("http request head too long");
        }
    }
    Ok(buffer)
}

/// 校验 Proxy-Authorization 头中的 Basic 凭据
fn check_proxy_auth(head: &str, auth: &AuthFn) -> bool {
    for line in head.lines() {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if !name.eq_ignore_ascii_case("proxy-authorization") {
            continue;
        }

        let value = value.trim();
        let Some(encoded) = value
            .strip_prefix("Basic ")
            .or_else(|| value.strip_prefix("basic "))
        else {
            return false;
        };
        let Ok(decoded) = BASE64.decode(encoded.trim()) else {
            return false;
        };
        let Ok(text) = String::from_utf8(decoded) else {
            return false;
        };
        let Some((user, passwd)) = text.split_once(':') else {
            return false;
        };
        return auth(user, passwd);
    }
    false
}

/// 把绝对形式的请求目标拆成拨号地址和 origin 形式路径
fn parse_absolute_uri(uri: &str) -> Result<(String, String)> {
    let rest = uri
        .strip_prefix("http://")
        .ok_or_else(|| anyhow!("unsupported request target: {}", uri))?;

    let (host_port, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };
    if host_port.is_empty() {
        bail!("empty host in request target: {}", uri);
    }

    let addr = if host_port.contains(':') {
        host_port.to_string()
    } else {
        format!("{}:80", host_port)
    };
    Ok((addr, path.to_string()))
}

/// 重写请求行为 origin 形式，丢弃仅与代理有关的头
fn rewrite_head(head: &str, method: &str, origin_form: &str, version: &str) -> String {
    let mut out = format!("{} {} {}\r\n", method, origin_form, version);
    for line in head.lines().skip(1) {
        if line.is_empty() {
            continue;
        }
        if let Some((name, _)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("proxy-authorization")
                || name.eq_ignore_ascii_case("proxy-connection")
            {
                continue;
            }
        }
        out.push_str(line);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    out
}

async fn respond<S: AsyncWrite + Unpin>(stream: &mut S, status: &str) -> std::io::Result<()> {
    let response = format!(
        "HTTP/1.1 {}\r\nConnection: close\r\nContent-Length: 0\r\n\r\n",
        status
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_absolute_uri() {
        let (addr, path) = parse_absolute_uri("http://example.com/index.html").unwrap();
        assert_eq!(addr, "example.com:80");
        assert_eq!(path, "/index.html");

        let (addr, path) = parse_absolute_uri("http://example.com:8080").unwrap();
        assert_eq!(addr, "example.com:8080");
        assert_eq!(path, "/");

        assert!(parse_absolute_uri("ftp://example.com/").is_err());
        assert!(parse_absolute_uri("http:///nohost").is_err());
    }

    #[test]
    fn test_rewrite_head_strips_proxy_headers() {
        let head = "GET http://example.com/a HTTP/1.1\r\n\
                    Host: example.com\r\n\
                    Proxy-Authorization: Basic abc\r\n\
                    Proxy-Connection: keep-alive\r\n\
                    Accept: */*\r\n\r\n";
        let rewritten = rewrite_head(head, "GET", "/a", "HTTP/1.1");
        assert!(rewritten.starts_with("GET /a HTTP/1.1\r\n"));
        assert!(rewritten.contains("Host: example.com\r\n"));
        assert!(rewritten.contains("Accept: */*\r\n"));
        assert!(!rewritten.to_ascii_lowercase().contains("proxy-"));
        assert!(rewritten.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_check_proxy_auth() {
        let auth: AuthFn =
            Arc::new(|user: &str, passwd: &str| user == "alice" && passwd == "secret");

        let ok = format!(
            "CONNECT x:1 HTTP/1.1\r\nProxy-Authorization: Basic {}\r\n\r\n",
            BASE64.encode("alice:secret")
        );
        assert!(check_proxy_auth(&ok, &auth));

        let bad = format!(
            "CONNECT x:1 HTTP/1.1\r\nProxy-Authorization: Basic {}\r\n\r\n",
            BASE64.encode("alice:wrong")
        );
        assert!(!check_proxy_auth(&bad, &auth));

        let missing = "CONNECT x:1 HTTP/1.1\r\nHost: x\r\n\r\n";
        assert!(!check_proxy_auth(missing, &auth));
    }

    #[tokio::test]
    async fn test_connect_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let (mut client, server) = tokio::io::duplex(1024);
        let session = tokio::spawn(serve(1, server, None));

        let request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n", addr, addr);
        client.write_all(request.as_bytes()).await.unwrap();

        let mut response = Vec::new();
        let mut byte = [0u8; 1];
        while !response.ends_with(b"\r\n\r\n") {
            client.read_exact(&mut byte).await.unwrap();
            response.push(byte[0]);
        }
        let response = String::from_utf8(response).unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));

        client.write_all(b"ping").await.unwrap();
        let mut out = [0u8; 4];
        client.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"ping");

        drop(client);
        session.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_auth_failure_responds_407() {
        let auth: AuthFn = Arc::new(|_: &str, _: &str| false);

        let (mut client, server) = tokio::io::duplex(1024);
        let session = tokio::spawn(serve(2, server, Some(auth)));

        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();

        let mut response = vec![0u8; 30];
        client.read_exact(&mut response).await.unwrap();
        assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 407"));
        assert!(session.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_malformed_request_responds_400() {
        let (mut client, server) = tokio::io::duplex(1024);
        let session = tokio::spawn(serve(3, server, None));

        client.write_all(b"GARBAGE\r\n\r\n").await.unwrap();

        let mut response = vec![0u8; 16];
        client.read_exact(&mut response).await.unwrap();
        assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 400"));
        assert!(session.await.unwrap().is_err());
    }
}

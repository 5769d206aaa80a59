/// SOCKS5 代理会话（RFC 1928）
///
/// 只支持 CONNECT 命令。凭据表非空时要求 RFC 1929 用户名密码
/// 认证，否则走无认证方法。
use crate::config::AuthFn;
use crate::io_util::relay_streams;
use anyhow::{bail, Context, Result};
use std::net::{Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

const SOCKS_VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_NO_ACCEPTABLE: u8 = 0xff;

const CMD_CONNECT: u8 = 0x01;

const REP_SUCCEEDED: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_HOST_UNREACHABLE: u8 = 0x04;
const REP_CONNECTION_REFUSED: u8 = 0x05;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;

/// 运行一次完整的 SOCKS5 会话直到连接结束
pub async fn serve<S>(id: u64, mut stream: S, auth: Option<AuthFn>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    // 问候与方法协商
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        bail!("unsupported SOCKS version: {}", header[0]);
    }

    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;

    let required = if auth.is_some() {
        METHOD_USER_PASS
    } else {
        METHOD_NO_AUTH
    };
    if !methods.contains(&required) {
        stream
            .write_all(&[SOCKS_VERSION, METHOD_NO_ACCEPTABLE])
            .await?;
        bail!("no acceptable authentication method");
    }
    stream.write_all(&[SOCKS_VERSION, required]).await?;

    if let Some(auth) = &auth {
        subnegotiate(id, &mut stream, auth).await?;
    }

    // 请求
    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    if request[0] != SOCKS_VERSION {
        bail!("invalid SOCKS5 request version: {}", request[0]);
    }
    if request[1] != CMD_CONNECT {
        reply(&mut stream, REP_COMMAND_NOT_SUPPORTED).await.ok();
        bail!("unsupported SOCKS5 command: {}", request[1]);
    }

    let target = read_target(&mut stream, request[3]).await?;
    debug!(id, "socks5 connect to {}", target);

    let upstream = match TcpStream::connect(&target).await {
        Ok(s) => s,
        Err(e) => {
            reply(&mut stream, reply_code(&e)).await.ok();
            return Err(e).with_context(|| format!("connect to {}", target));
        }
    };
    reply(&mut stream, REP_SUCCEEDED).await?;

    relay_streams(id, stream, upstream).await;
    Ok(())
}

/// RFC 1929 用户名密码子协商
async fn subnegotiate<S>(id: u64, stream: &mut S, auth: &AuthFn) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != AUTH_VERSION {
        stream.write_all(&[AUTH_VERSION, 0x01]).await?;
        bail!("invalid auth version: {}", header[0]);
    }

    let ulen = header[1] as usize;
    if ulen == 0 {
        stream.write_all(&[AUTH_VERSION, 0x01]).await?;
        bail!("invalid username length");
    }
    let mut user = vec![0u8; ulen];
    stream.read_exact(&mut user).await?;
    let user = String::from_utf8(user).context("username is not utf-8")?;

    let mut plen = [0u8; 1];
    stream.read_exact(&mut plen).await?;
    if plen[0] == 0 {
        stream.write_all(&[AUTH_VERSION, 0x01]).await?;
        bail!("invalid password length");
    }
    let mut passwd = vec![0u8; plen[0] as usize];
    stream.read_exact(&mut passwd).await?;
    let passwd = String::from_utf8(passwd).context("password is not utf-8")?;

    if auth(&user, &passwd) {
        stream.write_all(&[AUTH_VERSION, 0x00]).await?;
        debug!(id, user, "socks5 authentication successful");
        Ok(())
    } else {
        stream.write_all(&[AUTH_VERSION, 0x01]).await?;
        bail!("authentication failed for user {}", user)
    }
}

/// 读取目标地址，返回可拨号的 host:port 字符串
async fn read_target<S>(stream: &mut S, atyp: u8) -> Result<String>
where
    S: AsyncRead + Unpin,
{
    let host = match atyp {
        // IPv4
        0x01 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            Ipv4Addr::from(addr).to_string()
        }
        // 域名
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut domain = vec![0u8; len[0] as usize];
            stream.read_exact(&mut domain).await?;
            String::from_utf8(domain).context("domain is not utf-8")?
        }
        // IPv6
        0x04 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            format!("[{}]", Ipv6Addr::from(addr))
        }
        other => bail!("unsupported address type: {}", other),
    };

    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok(format!("{}:{}", host, u16::from_be_bytes(port)))
}

async fn reply<S: AsyncWrite + Unpin>(stream: &mut S, code: u8) -> std::io::Result<()> {
    stream
        .write_all(&[SOCKS_VERSION, code, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await?;
    stream.flush().await
}

fn reply_code(err: &std::io::Error) -> u8 {
    match err.kind() {
        std::io::ErrorKind::ConnectionRefused => REP_CONNECTION_REFUSED,
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::AddrNotAvailable => {
            REP_HOST_UNREACHABLE
        }
        _ => REP_GENERAL_FAILURE,
    }
}

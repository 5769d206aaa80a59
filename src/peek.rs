/// 带前瞻能力的字节流包装
///
/// 分发器要在不消费任何字节的前提下看到首字节，之后整条流（含被
/// 看过的字节）还要原样交给 TLS 接受器或子处理器。读到的前瞻字节
/// 存在内部缓冲里，后续读取先吐缓冲再透传内部流，写端为纯透传，
/// 因此包装后的对象仍是一条普通字节流。
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// 前瞻读取时每次向内部流请求的字节数
const PEEK_READ_SIZE: usize = 4096;

/// 包装一条字节流，支持 peek 而不消费
pub struct PeekableStream<S> {
    inner: S,
    buf: Vec<u8>,
    pos: usize,
}

impl<S> PeekableStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            pos: 0,
        }
    }

    /// 内部流的引用
    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: AsyncRead + Unpin> PeekableStream<S> {
    /// 返回接下来的 n 个字节但不消费，后续读取仍会看到它们。
    /// 凑不够 n 个字节就遇到流结束时返回 `UnexpectedEof`。
    pub async fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        while self.buf.len() - self.pos < n {
            let mut chunk = [0u8; PEEK_READ_SIZE];
            let m = self.inner.read(&mut chunk).await?;
            if m == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream closed while peeking",
                ));
            }
            self.buf.extend_from_slice(&chunk[..m]);
        }
        Ok(&self.buf[self.pos..self.pos + n])
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekableStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        // 先吐出缓冲中尚未被消费的前瞻字节
        if this.pos < this.buf.len() {
            let n = (this.buf.len() - this.pos).min(buf.remaining());
            buf.put_slice(&this.buf[this.pos..this.pos + n]);
            this.pos += n;
            if this.pos == this.buf.len() {
                this.buf.clear();
                this.pos = 0;
            }
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekableStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, data)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_peek_does_not_consume() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"hello").await.unwrap();

        let mut stream = PeekableStream::new(server);
        assert_eq!(stream.peek(1).await.unwrap(), b"h");
        assert_eq!(stream.peek(3).await.unwrap(), b"hel");

        let mut out = [0u8; 5];
        stream.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"hello");
    }

    #[tokio::test]
    async fn test_read_interleaves_buffer_and_stream() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"abcdef").await.unwrap();

        let mut stream = PeekableStream::new(server);
        assert_eq!(stream.peek(2).await.unwrap(), b"ab");

        // 第一次读只吐缓冲字节
        let mut out = [0u8; 4];
        let n = stream.read(&mut out).await.unwrap();
        assert!(n >= 2);
        let mut collected = out[..n].to_vec();
        while collected.len() < 6 {
            let n = stream.read(&mut out).await.unwrap();
            collected.extend_from_slice(&out[..n]);
        }
        assert_eq!(collected, b"abcdef");
    }

    #[tokio::test]
    async fn test_peek_past_eof_fails() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"ab").await.unwrap();
        client.shutdown().await.unwrap();
        drop(client);

        let mut stream = PeekableStream::new(server);
        let err = stream.peek(3).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_write_passthrough() {
        let (client, server) = tokio::io::duplex(64);
        let mut stream = PeekableStream::new(server);
        stream.write_all(b"ping").await.unwrap();
        stream.flush().await.unwrap();

        let mut other = client;
        let mut out = [0u8; 4];
        other.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"ping");
    }
}

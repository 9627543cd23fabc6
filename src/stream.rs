/// 可预读的字节流
///
/// 在连接之上维护一个预读缓冲区：`peek` 只观察数据而不消费，
/// 被观察过但未丢弃的字节会在后续的 `AsyncRead` 中优先返回，
/// 因此协议探测对最终接手连接的处理器是透明的。
use bytes::{Buf, BytesMut};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::time::{Instant, Sleep};

use crate::tunnel::Transport;

/// 每次从连接读取时预留的缓冲区大小
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// 隧道的一侧：连接加预读缓冲区
pub struct Stream {
    inner: Pin<Box<dyn Transport>>,
    buffer: BytesMut,
    deadline: Option<Pin<Box<Sleep>>>,
    eof: bool,
}

impl Stream {
    pub fn new(inner: Pin<Box<dyn Transport>>) -> Self {
        Self {
            inner,
            buffer: BytesMut::with_capacity(READ_CHUNK_SIZE),
            deadline: None,
            eof: false,
        }
    }

    /// 包装任意传输层，调用方无需自行装箱
    pub fn from_io<T: Transport>(io: T) -> Self {
        Self::new(Box::pin(io))
    }

    /// 返回至多 `n` 个未消费的字节，不移动读位置。
    ///
    /// 凑齐 `n` 字节前超过读超时返回 `TimedOut`，对端先关闭返回 `UnexpectedEof`。
    /// 两种情况下已读到的字节都保留在缓冲区中。
    pub async fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        while self.buffer.len() < n {
            if self.eof {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("peer closed after {} of {} bytes", self.buffer.len(), n),
                ));
            }
            self.read_more().await?;
        }
        Ok(&self.buffer[..n])
    }

    /// 从连接读取一次到预读缓冲区。
    ///
    /// 返回新读到的字节数，0 表示 EOF。
    pub async fn read_more(&mut self) -> io::Result<usize> {
        if self.eof {
            return Ok(0);
        }
        self.buffer.reserve(READ_CHUNK_SIZE);

        let deadline = self.deadline.as_ref().map(|sleep| sleep.deadline());
        let read = self.inner.read_buf(&mut self.buffer);
        let n = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, read)
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read deadline exceeded"))??,
            None => read.await?,
        };

        if n == 0 {
            self.eof = true;
        }
        Ok(n)
    }

    /// 跳过之前预读的 `n` 个字节
    pub fn discard(&mut self, n: usize) {
        let n = n.min(self.buffer.len());
        self.buffer.advance(n);
    }

    /// 取出全部缓冲字节
    pub fn take_buffered(&mut self) -> BytesMut {
        self.buffer.split()
    }

    /// 已从连接读取但尚未消费的字节
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// 对端是否已关闭写方向
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    pub fn set_read_deadline(&mut self, deadline: Instant) {
        match self.deadline.as_mut() {
            Some(sleep) => sleep.as_mut().reset(deadline),
            None => self.deadline = Some(Box::pin(tokio::time::sleep_until(deadline))),
        }
    }

    pub fn clear_deadline(&mut self) {
        self.deadline = None;
    }

    pub fn read_deadline(&self) -> Option<Instant> {
        self.deadline.as_ref().map(|sleep| sleep.deadline())
    }

    /// 清除超时，刷新待写数据并关闭连接
    pub async fn close(&mut self) -> io::Result<()> {
        self.clear_deadline();
        match self.inner.shutdown().await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        // 先返回预读缓冲区中的数据
        if !this.buffer.is_empty() {
            let n = this.buffer.len().min(buf.remaining());
            buf.put_slice(&this.buffer[..n]);
            this.buffer.advance(n);
            return Poll::Ready(Ok(()));
        }

        if let Some(sleep) = this.deadline.as_mut() {
            if sleep.as_mut().poll(cx).is_ready() {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "read deadline exceeded",
                )));
            }
        }

        let before = buf.filled().len();
        let result = this.inner.as_mut().poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = result {
            if buf.filled().len() == before && buf.remaining() > 0 {
                this.eof = true;
            }
        }
        result
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.get_mut().inner.as_mut().poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        self.get_mut().inner.as_mut().poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().inner.as_mut().poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().inner.as_mut().poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_peek_does_not_consume() {
        let (mut client, server) = duplex(64);
        let mut stream = Stream::from_io(server);

        client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();

        assert_eq!(stream.peek(4).await.unwrap(), b"GET ");
        assert_eq!(stream.peek(3).await.unwrap(), b"GET");
        assert!(stream.buffered_len() >= 4);

        let mut out = [0u8; 16];
        stream.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"GET / HTTP/1.1\r\n");
    }

    #[tokio::test]
    async fn test_discard_advances_past_peeked_bytes() {
        let (mut client, server) = duplex(64);
        let mut stream = Stream::from_io(server);

        client.write_all(b"abcdef").await.unwrap();
        stream.peek(6).await.unwrap();
        stream.discard(2);
        assert_eq!(stream.buffered(), b"cdef");

        drop(client);
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"cdef");
    }

    #[tokio::test]
    async fn test_peek_times_out_and_keeps_partial_data() {
        let (mut client, server) = duplex(64);
        let mut stream = Stream::from_io(server);

        client.write_all(b"PRI").await.unwrap();
        stream.set_read_deadline(Instant::now() + Duration::from_millis(50));

        let err = stream.peek(24).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert_eq!(stream.buffered(), b"PRI");

        stream.clear_deadline();
        assert!(stream.read_deadline().is_none());
    }

    #[tokio::test]
    async fn test_peek_reports_eof() {
        let (mut client, server) = duplex(64);
        let mut stream = Stream::from_io(server);

        client.write_all(b"GE").await.unwrap();
        drop(client);

        let err = stream.peek(7).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert!(stream.is_eof());
        assert_eq!(stream.buffered(), b"GE");
    }

    #[tokio::test]
    async fn test_take_buffered_empties_buffer() {
        let (mut client, server) = duplex(64);
        let mut stream = Stream::from_io(server);

        client.write_all(b"hello").await.unwrap();
        stream.peek(5).await.unwrap();

        let taken = stream.take_buffered();
        assert_eq!(&taken[..], b"hello");
        assert_eq!(stream.buffered_len(), 0);
    }

    #[tokio::test]
    async fn test_close_is_repeatable() {
        let (_client, server) = duplex(64);
        let mut stream = Stream::from_io(server);
        stream.set_read_deadline(Instant::now() + Duration::from_secs(1));

        stream.close().await.unwrap();
        assert!(stream.read_deadline().is_none());
        stream.close().await.unwrap();
    }
}

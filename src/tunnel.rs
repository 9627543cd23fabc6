/// 隧道：一条被拦截连接的两侧
///
/// 下游（downstream）面向原始客户端，上游（upstream）面向原始目标。
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{Result, TunnelError};
use crate::stream::Stream;

/// 传输层连接抽象
///
/// 统一封装明文 TCP 和终止后的 TLS 连接
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

// 为所有满足条件的类型自动实现 Transport
impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// 隧道的只读元数据，仅用于关联日志和事件
#[derive(Debug, Clone)]
pub struct TunnelInfo {
    pub id: String,
    pub src: SocketAddr,
    pub dst: SocketAddr,
    /// 两侧承载的是解密后的 TLS 流量
    pub secure: bool,
}

impl TunnelInfo {
    pub fn new(src: SocketAddr, dst: SocketAddr) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            src,
            dst,
            secure: false,
        }
    }

    /// 为 TLS 终止后的隧道分配新的标识
    pub fn decrypted(src: SocketAddr, dst: SocketAddr) -> Self {
        Self {
            secure: true,
            ..Self::new(src, dst)
        }
    }

    /// 隧道内流量对应的 URL scheme
    pub fn scheme(&self) -> &'static str {
        if self.secure {
            "https"
        } else {
            "http"
        }
    }
}

pub struct Tunnel {
    info: TunnelInfo,
    pub downstream: Stream,
    pub upstream: Stream,
    closed: bool,
}

impl Tunnel {
    pub fn new(src: SocketAddr, dst: SocketAddr, downstream: Stream, upstream: Stream) -> Self {
        Self::with_info(TunnelInfo::new(src, dst), downstream, upstream)
    }

    pub fn with_info(info: TunnelInfo, downstream: Stream, upstream: Stream) -> Self {
        Self {
            info,
            downstream,
            upstream,
            closed: false,
        }
    }

    /// 由接受的连接和拨向原始目标的连接组成隧道
    pub fn from_tcp(
        src: SocketAddr,
        dst: SocketAddr,
        downstream: TcpStream,
        upstream: TcpStream,
    ) -> Self {
        Self::new(
            src,
            dst,
            Stream::from_io(downstream),
            Stream::from_io(upstream),
        )
    }

    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn src(&self) -> SocketAddr {
        self.info.src
    }

    pub fn dst(&self) -> SocketAddr {
        self.info.dst
    }

    pub fn scheme(&self) -> &'static str {
        self.info.scheme()
    }

    /// 两侧尚未被处理器消费的缓冲字节数
    pub fn buffered_len(&self) -> usize {
        self.downstream.buffered_len() + self.upstream.buffered_len()
    }

    pub fn set_read_deadline(&mut self, deadline: Instant) {
        self.downstream.set_read_deadline(deadline);
        self.upstream.set_read_deadline(deadline);
    }

    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.set_read_deadline(Instant::now() + timeout);
    }

    pub fn clear_deadline(&mut self) {
        self.downstream.clear_deadline();
        self.upstream.clear_deadline();
    }

    /// 关闭两侧。两侧都会尝试关闭，失败汇总返回。
    ///
    /// 重复调用无副作用。
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.clear_deadline();

        let (downstream, upstream) = tokio::join!(self.downstream.close(), self.upstream.close());
        let errors: Vec<_> = [downstream.err(), upstream.err()]
            .into_iter()
            .flatten()
            .collect();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(TunnelError::Close { errors })
        }
    }

    /// 拆分为元数据和两条流
    pub fn into_parts(self) -> (TunnelInfo, Stream, Stream) {
        (self.info, self.downstream, self.upstream)
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("id", &self.info.id)
            .field("src", &self.info.src)
            .field("dst", &self.info.dst)
            .field("closed", &self.closed)
            .finish()
    }
}

/// 内存隧道：返回客户端端点、源站端点和两者之间的隧道
#[cfg(test)]
pub(crate) fn duplex_tunnel(
    capacity: usize,
) -> (tokio::io::DuplexStream, tokio::io::DuplexStream, Tunnel) {
    let (client, downstream) = tokio::io::duplex(capacity);
    let (upstream, origin) = tokio::io::duplex(capacity);
    let tunnel = Tunnel::new(
        SocketAddr::from(([127, 0, 0, 1], 50000)),
        SocketAddr::from(([93, 184, 216, 34], 443)),
        Stream::from_io(downstream),
        Stream::from_io(upstream),
    );
    (client, origin, tunnel)
}

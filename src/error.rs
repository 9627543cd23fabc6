/// 自定义错误类型
///
/// 每个连接的失败只影响该连接本身：探测阶段的错误从不越过编排器，
/// 其余错误向上传递到连接的顶层处理函数，由其记录日志并关闭隧道。
use std::fmt;
use std::io;
use thiserror::Error;

/// 错误所属的隧道一侧
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Downstream,
    Upstream,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Downstream => write!(f, "downstream"),
            Side::Upstream => write!(f, "upstream"),
        }
    }
}

/// TLS 拦截状态机的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptStage {
    AwaitingClientHello,
    UpstreamHandshaking,
    DownstreamResuming,
    Relaying,
}

impl fmt::Display for InterceptStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InterceptStage::AwaitingClientHello => "awaiting-client-hello",
            InterceptStage::UpstreamHandshaking => "upstream-handshaking",
            InterceptStage::DownstreamResuming => "downstream-resuming",
            InterceptStage::Relaying => "relaying",
        };
        f.write_str(name)
    }
}

/// 拦截代理的主要错误类型
#[derive(Error, Debug)]
pub enum TunnelError {
    /// 探测窗口内数据不足
    #[error("Operation timeout after {duration:?}")]
    Timeout { duration: std::time::Duration },

    /// 字节流不符合某个协议
    #[error("Malformed protocol data: {0}")]
    MalformedProtocol(String),

    /// TLS 握手失败（任一侧）
    #[error("TLS handshake failed on {side} side during {stage}: {source}")]
    HandshakeFailure {
        side: Side,
        stage: InterceptStage,
        #[source]
        source: io::Error,
    },

    /// 上下游协商出的应用层协议不一致
    #[error("Negotiated protocol mismatch: downstream={downstream:?}, upstream={upstream:?}")]
    ProtocolMismatch {
        downstream: Option<String>,
        upstream: Option<String>,
    },

    /// 无法连接原始目标
    #[error("Failed to connect to {addr}: {source}")]
    UpstreamUnavailable {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// 转发过程中的读写错误
    #[error("Relay I/O error: {0}")]
    Relay(#[source] io::Error),

    /// 证书签发失败
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// 配置错误
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// 关闭隧道时两侧的错误汇总
    #[error("Failed to close tunnel: {}", join_errors(.errors))]
    Close { errors: Vec<io::Error> },

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// 其他错误（保留与 anyhow 的兼容性）
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, TunnelError>;

fn join_errors(errors: &[io::Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<rcgen::Error> for TunnelError {
    fn from(value: rcgen::Error) -> Self {
        Self::Certificate(value.to_string())
    }
}

impl From<rustls::Error> for TunnelError {
    fn from(value: rustls::Error) -> Self {
        Self::Certificate(value.to_string())
    }
}

impl TunnelError {
    /// 创建超时错误
    pub fn timeout(duration: std::time::Duration) -> Self {
        Self::Timeout { duration }
    }

    /// 创建协议格式错误
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedProtocol(msg.into())
    }

    /// 创建握手失败错误
    pub fn handshake(side: Side, stage: InterceptStage, source: io::Error) -> Self {
        Self::HandshakeFailure {
            side,
            stage,
            source,
        }
    }

    /// 创建协议不一致错误
    pub fn protocol_mismatch(downstream: Option<&[u8]>, upstream: Option<&[u8]>) -> Self {
        Self::ProtocolMismatch {
            downstream: downstream.map(|p| String::from_utf8_lossy(p).into_owned()),
            upstream: upstream.map(|p| String::from_utf8_lossy(p).into_owned()),
        }
    }

    /// 创建上游不可达错误
    pub fn upstream_unavailable(addr: impl Into<String>, source: io::Error) -> Self {
        Self::UpstreamUnavailable {
            addr: addr.into(),
            source,
        }
    }

    /// 创建证书错误
    pub fn certificate(msg: impl Into<String>) -> Self {
        Self::Certificate(msg.into())
    }

    /// 创建配置错误
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_handshake_failure(&self) -> bool {
        matches!(self, Self::HandshakeFailure { .. })
    }

    pub fn is_protocol_mismatch(&self) -> bool {
        matches!(self, Self::ProtocolMismatch { .. })
    }

    pub fn is_upstream_unavailable(&self) -> bool {
        matches!(self, Self::UpstreamUnavailable { .. })
    }

    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::ConfigError(_))
    }
}

/// 对端正常/异常断开导致的错误不视为转发失败
pub fn is_benign_io_error(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
    )
}

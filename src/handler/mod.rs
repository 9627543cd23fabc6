/// 连接处理器
///
/// 探测结果映射到固定的处理器集合；每个处理器接管整条隧道，结束时负责关闭它。
pub mod bypass;
pub mod http11;
pub mod http2;
pub mod tls;

use futures::future::{BoxFuture, FutureExt};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::engine::Engine;
use crate::error::Result;
use crate::observe::{LogObserver, Observer};
use crate::preview::DEFAULT_PREVIEW_BYTES;
use crate::tunnel::Tunnel;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handler {
    /// 原样透传
    ByPass,
    Http11,
    Http2,
    /// TLS 中间人，携带 ClientHello 中的主机名
    Tls { server_names: Vec<String> },
}

impl Handler {
    pub fn name(&self) -> &'static str {
        match self {
            Handler::ByPass => "bypass",
            Handler::Http11 => "http/1.1",
            Handler::Http2 => "h2",
            Handler::Tls { .. } => "tls",
        }
    }

    /// 移交隧道，返回的 future 持有隧道直到两侧关闭
    pub fn handle(self, tunnel: Tunnel, engine: &Engine) -> BoxFuture<'_, Result<()>> {
        match self {
            Handler::ByPass => bypass::handle(tunnel).boxed(),
            Handler::Http11 => http11::handle(tunnel, engine.relay()).boxed(),
            Handler::Http2 => http2::handle(tunnel, engine.relay()).boxed(),
            Handler::Tls { server_names } => tls::handle(tunnel, server_names, engine).boxed(),
        }
    }
}

impl fmt::Display for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// HTTP 中继共用的设置
#[derive(Clone)]
pub struct RelayContext {
    pub preview_limit: usize,
    pub observer: Arc<dyn Observer>,
}

impl RelayContext {
    pub fn new(preview_limit: usize, observer: Arc<dyn Observer>) -> Self {
        Self {
            preview_limit,
            observer,
        }
    }
}

impl Default for RelayContext {
    fn default() -> Self {
        Self::new(DEFAULT_PREVIEW_BYTES, Arc::new(LogObserver))
    }
}

impl fmt::Debug for RelayContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayContext")
            .field("preview_limit", &self.preview_limit)
            .finish()
    }
}

/// 关闭隧道并返回处理结果；关闭本身的错误只记录日志
pub(crate) async fn finish(mut tunnel: Tunnel, result: Result<()>) -> Result<()> {
    if let Err(e) = tunnel.close().await {
        debug!(tunnel = %tunnel.id(), "close: {}", e);
    }
    result
}

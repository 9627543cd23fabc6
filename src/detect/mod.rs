/// 协议探测
///
/// 嗅探器只观察下游的预读缓冲区，从不丢弃字节；编排器在时间窗口和字节上限内
/// 反复运行嗅探器，第一个 `Matched` 胜出，否则回退到透传。
pub mod http11;
pub mod http2;
pub mod tls;

use std::io;
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::allow_list::AllowList;
use crate::handler::Handler;
use crate::tunnel::Tunnel;

pub use self::tls::{parse_client_hello, ClientHello, TlsSniffer};

/// 默认探测窗口
pub const DEFAULT_DETECT_TIMEOUT: Duration = Duration::from_millis(200);

/// 探测期间两侧合计允许缓冲的字节数
pub const DEFAULT_MAX_BUFFERED_BYTES: usize = 128;

/// 单个嗅探器的三态判定，可作为 [`VerdictSet`] 中的一位
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Never = 0b001,
    Possible = 0b010,
    Matched = 0b100,
}

/// 一轮探测中所有判定的按位并集
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerdictSet(u8);

impl VerdictSet {
    pub fn empty() -> Self {
        Self(0)
    }

    pub fn contains(self, verdict: Verdict) -> bool {
        self.0 & verdict as u8 != 0
    }

    /// 所有嗅探器都排除了自己的协议
    pub fn is_only_never(self) -> bool {
        self.0 == Verdict::Never as u8
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr<Verdict> for VerdictSet {
    type Output = VerdictSet;

    fn bitor(self, rhs: Verdict) -> VerdictSet {
        VerdictSet(self.0 | rhs as u8)
    }
}

impl BitOr for Verdict {
    type Output = VerdictSet;

    fn bitor(self, rhs: Verdict) -> VerdictSet {
        VerdictSet(self as u8 | rhs as u8)
    }
}

impl BitOrAssign<Verdict> for VerdictSet {
    fn bitor_assign(&mut self, rhs: Verdict) {
        self.0 |= rhs as u8;
    }
}

/// 单个嗅探器的结果，匹配时携带应接管连接的处理器
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectResult {
    Never,
    Possible,
    Matched(Handler),
}

impl DetectResult {
    pub fn verdict(&self) -> Verdict {
        match self {
            DetectResult::Never => Verdict::Never,
            DetectResult::Possible => Verdict::Possible,
            DetectResult::Matched(_) => Verdict::Matched,
        }
    }

    /// 预读失败的映射：数据不足为 `Possible`，连接异常为 `Never`
    pub(crate) fn from_peek_error(error: &io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::UnexpectedEof => {
                DetectResult::Possible
            }
            _ => DetectResult::Never,
        }
    }
}

/// 嗅探器集合（封闭的变体集合）
#[derive(Debug, Clone)]
pub enum Sniffer {
    Http11,
    Http2,
    Tls(TlsSniffer),
}

impl Sniffer {
    pub fn name(&self) -> &'static str {
        match self {
            Sniffer::Http11 => "http/1.1",
            Sniffer::Http2 => "h2",
            Sniffer::Tls(_) => "tls",
        }
    }

    pub async fn sniff(&self, tunnel: &mut Tunnel) -> DetectResult {
        match self {
            Sniffer::Http11 => http11::sniff(&mut tunnel.downstream).await,
            Sniffer::Http2 => http2::sniff(&mut tunnel.downstream).await,
            Sniffer::Tls(sniffer) => sniffer.sniff(tunnel).await,
        }
    }
}

/// 探测参数
#[derive(Debug, Clone, Copy)]
pub struct DetectOptions {
    pub timeout: Duration,
    pub max_buffered_bytes: usize,
}

impl Default for DetectOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_DETECT_TIMEOUT,
            max_buffered_bytes: DEFAULT_MAX_BUFFERED_BYTES,
        }
    }
}

/// 按顺序运行一组嗅探器，为隧道选择处理器
#[derive(Debug, Clone)]
pub struct Detector {
    sniffers: Vec<Sniffer>,
    options: DetectOptions,
}

impl Detector {
    pub fn new(sniffers: Vec<Sniffer>, options: DetectOptions) -> Self {
        Self { sniffers, options }
    }

    /// 明文连接：HTTP/1.1、HTTP/2、TLS
    pub fn plaintext(allow_list: Arc<AllowList>, options: DetectOptions) -> Self {
        Self::new(
            vec![
                Sniffer::Http11,
                Sniffer::Http2,
                Sniffer::Tls(TlsSniffer::new(allow_list)),
            ],
            options,
        )
    }

    /// TLS 终止后的连接：只区分 HTTP/1.1 和 HTTP/2
    pub fn decrypted(options: DetectOptions) -> Self {
        Self::new(vec![Sniffer::Http11, Sniffer::Http2], options)
    }

    pub fn sniffers(&self) -> &[Sniffer] {
        &self.sniffers
    }

    /// 为 `tunnel` 选择处理器，不消费任何字节。
    ///
    /// 以下情况回退到 [`Handler::ByPass`]：所有嗅探器都判定 `Never`；
    /// 两侧缓冲字节超过上限；探测时间窗口已过；下游对端已关闭。
    /// 返回前清除读超时。
    pub async fn detect(&self, tunnel: &mut Tunnel) -> Handler {
        let deadline = Instant::now() + self.options.timeout;
        tunnel.set_read_deadline(deadline);

        let handler = loop {
            let mut seen = VerdictSet::empty();
            let mut matched = None;

            for sniffer in &self.sniffers {
                let result = sniffer.sniff(tunnel).await;
                seen |= result.verdict();
                if let DetectResult::Matched(handler) = result {
                    debug!(tunnel = %tunnel.id(), sniffer = sniffer.name(), "protocol matched");
                    matched = Some(handler);
                    break;
                }
            }

            if let Some(handler) = matched {
                break handler;
            }

            if seen.is_only_never() {
                debug!(tunnel = %tunnel.id(), "protocol unrecognized");
                break Handler::ByPass;
            }
            if tunnel.buffered_len() > self.options.max_buffered_bytes {
                debug!(
                    tunnel = %tunnel.id(),
                    buffered = tunnel.buffered_len(),
                    "detection budget exhausted"
                );
                break Handler::ByPass;
            }
            if Instant::now() >= deadline || tunnel.downstream.is_eof() {
                debug!(tunnel = %tunnel.id(), "detection window closed");
                break Handler::ByPass;
            }
        };

        tunnel.clear_deadline();
        handler
    }
}

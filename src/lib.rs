/// tproxy-mitm 库入口
///
/// 透明拦截代理：协议探测、TLS 中间人和 HTTP 中继
pub mod allow_list;
pub mod cert;
pub mod cli;
pub mod config;
pub mod detect;
pub mod engine;
pub mod error;
pub mod handler;
pub mod observe;
pub mod preview;
pub mod server;
pub mod stream;
pub mod tls;
pub mod tunnel;

// 重新导出常用类型
pub use allow_list::AllowList;
pub use cert::CertificateAuthority;
pub use config::AppConfig;
pub use detect::{DetectOptions, DetectResult, Detector, Verdict};
pub use engine::Engine;
pub use error::{Result, TunnelError};
pub use handler::{Handler, RelayContext};
pub use observe::{HttpEvent, LogObserver, Observer};
pub use stream::Stream;
pub use tunnel::{Tunnel, TunnelInfo};

/// 拦截引擎
///
/// 进程级共享上下文：根证书、上游 TLS 配置、两套探测器和中继设置。
/// 每条连接先探测协议，再交给选中的处理器。
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::allow_list::AllowList;
use crate::cert::CertificateAuthority;
use crate::config::AppConfig;
use crate::detect::{DetectOptions, Detector};
use crate::error::Result;
use crate::handler::RelayContext;
use crate::observe::LogObserver;
use crate::tls;
use crate::tunnel::Tunnel;

pub struct Engine {
    ca: Arc<CertificateAuthority>,
    upstream_tls: Arc<rustls::ClientConfig>,
    plaintext: Detector,
    decrypted: Detector,
    relay: RelayContext,
}

impl Engine {
    pub fn new(
        ca: Arc<CertificateAuthority>,
        upstream_tls: Arc<rustls::ClientConfig>,
        allow_list: Arc<AllowList>,
        detect: DetectOptions,
        relay: RelayContext,
    ) -> Self {
        Self {
            ca,
            upstream_tls,
            plaintext: Detector::plaintext(allow_list, detect),
            decrypted: Detector::decrypted(detect),
            relay,
        }
    }

    /// 按配置加载根证书、上游信任库和白名单
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let ca = CertificateAuthority::from_files(&config.ca.cert_path, &config.ca.key_path)
            .context("Failed to load root CA")?
            .with_organization(config.ca.organization.clone())
            .with_leaf_validity_days(config.ca.leaf_validity_days);

        let upstream_tls = tls::load_upstream_client_config(
            config.upstream.ca_cert_path.as_deref(),
            config.upstream.skip_verify,
        )?;

        let allow_list = AllowList::from_entries(
            config.allow_list.ips.iter().map(String::as_str),
            config.allow_list.domains.iter().map(String::as_str),
        )
        .context("Invalid allow-list")?;
        if allow_list.is_empty() {
            info!("Allow-list is empty, every TLS connection will be intercepted");
        }

        let detect = DetectOptions {
            timeout: Duration::from_millis(config.detect.timeout_ms),
            max_buffered_bytes: config.detect.max_buffered_bytes,
        };
        let relay = RelayContext::new(config.relay.body_preview_bytes, Arc::new(LogObserver));

        Ok(Self::new(
            Arc::new(ca),
            upstream_tls,
            Arc::new(allow_list),
            detect,
            relay,
        ))
    }

    pub fn ca(&self) -> &CertificateAuthority {
        &self.ca
    }

    pub fn upstream_tls(&self) -> &rustls::ClientConfig {
        &self.upstream_tls
    }

    pub fn relay(&self) -> &RelayContext {
        &self.relay
    }

    /// 明文连接使用的探测器
    pub fn detector(&self) -> &Detector {
        &self.plaintext
    }

    /// TLS 终止后使用的探测器（不含 TLS 探测）
    pub fn decrypted_detector(&self) -> &Detector {
        &self.decrypted
    }

    /// 探测新隧道的协议，并运行选中的处理器直到结束
    pub async fn handle(&self, mut tunnel: Tunnel) -> Result<()> {
        let handler = self.plaintext.detect(&mut tunnel).await;
        debug!(
            tunnel = %tunnel.id(),
            src = %tunnel.src(),
            dst = %tunnel.dst(),
            handler = %handler,
            "handler selected"
        );
        handler.handle(tunnel, self).await
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("ca", &self.ca)
            .field("plaintext", &self.plaintext)
            .field("relay", &self.relay)
            .finish()
    }
}

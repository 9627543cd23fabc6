use anyhow::{Context, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cert::IssuedLeaf;

/// 从 PEM 文件加载证书
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file =
        File::open(path).with_context(|| format!("Failed to open cert file: {:?}", path))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to parse certificates in {:?}", path))
}

/// 加载访问真实上游时使用的客户端 TLS 配置
///
/// 信任系统根证书，另可追加一个 CA 文件；`skip_verify` 仅用于测试。
/// ALPN 留空，由拦截时按下游客户端的提议逐连接填充。
pub fn load_upstream_client_config(
    ca_cert_path: Option<&Path>,
    skip_verify: bool,
) -> Result<Arc<rustls::ClientConfig>> {
    let mut root_store = rustls::RootCertStore::empty();

    let native_certs = rustls_native_certs::load_native_certs();
    for error in &native_certs.errors {
        warn!("Failed to load a native root certificate: {}", error);
    }
    let (added, ignored) = root_store.add_parsable_certificates(native_certs.certs);
    debug!("Loaded {} native root certificates ({} ignored)", added, ignored);

    if let Some(ca_path) = ca_cert_path {
        for cert in load_certs(ca_path)? {
            root_store
                .add(cert)
                .context("Failed to add CA certificate")?;
        }
    }

    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    if skip_verify {
        warn!("Upstream certificate verification is disabled");
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoCertificateVerification::new()));
    }

    Ok(Arc::new(config))
}

/// 复制基础配置，替换 ALPN 候选列表
pub fn client_config_with_alpn(
    base: &rustls::ClientConfig,
    alpn_protocols: Vec<Vec<u8>>,
) -> Arc<rustls::ClientConfig> {
    let mut config = base.clone();
    config.alpn_protocols = alpn_protocols;
    Arc::new(config)
}

/// 用叶子证书构造下游服务端配置，ALPN 只提供上游已协商的协议（或不提供）
pub fn leaf_server_config(
    leaf: IssuedLeaf,
    negotiated: Option<&[u8]>,
) -> crate::Result<Arc<rustls::ServerConfig>> {
    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(leaf.chain, leaf.key)?;
    config.alpn_protocols = negotiated.map(|p| vec![p.to_vec()]).unwrap_or_default();
    Ok(Arc::new(config))
}

/// 接受任意上游证书链，握手签名仍会校验
#[derive(Debug)]
struct NoCertificateVerification {
    provider: Arc<CryptoProvider>,
}

impl NoCertificateVerification {
    fn new() -> Self {
        Self {
            provider: Arc::new(rustls::crypto::aws_lc_rs::default_provider()),
        }
    }
}

impl ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

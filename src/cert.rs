/// 证书颁发机构
///
/// 持有根证书和签名私钥（只读，跨连接共享），为每次 TLS 拦截签发一张新的叶子证书。
/// 叶子证书不缓存，也不落盘。
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::io::BufReader;
use std::net::IpAddr;
use std::path::Path;
use time::{Duration, OffsetDateTime};
use tracing::debug;

use crate::error::{Result, TunnelError};

/// 叶子证书默认有效期（天）
pub const DEFAULT_LEAF_VALIDITY_DAYS: u32 = 90;

/// 默认组织名
pub const DEFAULT_ORGANIZATION: &str = "tproxy-mitm";

/// notBefore 向前回拨，容忍客户端时钟偏差
const BACKDATE: Duration = Duration::minutes(5);

/// 生成的根证书有效期（天）
const ROOT_VALIDITY_DAYS: i64 = 3650;

/// 新生成的根证书和私钥（PEM 编码）
pub struct RootMaterial {
    pub cert_pem: String,
    pub key_pem: String,
}

/// 为一次拦截签发的叶子证书
pub struct IssuedLeaf {
    /// `[leaf, root]`
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
    pub serial: Vec<u8>,
}

pub struct CertificateAuthority {
    issuer: Issuer<'static, KeyPair>,
    root_der: CertificateDer<'static>,
    organization: String,
    leaf_validity_days: u32,
}

impl CertificateAuthority {
    /// 从 PEM 格式的根证书和 PKCS#8 私钥构造
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let mut reader = BufReader::new(cert_pem.as_bytes());
        let root_der = rustls_pemfile::certs(&mut reader)
            .next()
            .ok_or_else(|| TunnelError::certificate("No certificate found in root CA PEM"))?
            .map_err(|e| TunnelError::certificate(format!("Failed to parse root CA: {}", e)))?;

        let key = KeyPair::from_pem(key_pem)?;
        let issuer = Issuer::from_ca_cert_der(&root_der, key)?;

        Ok(Self {
            issuer,
            root_der,
            organization: DEFAULT_ORGANIZATION.to_string(),
            leaf_validity_days: DEFAULT_LEAF_VALIDITY_DAYS,
        })
    }

    /// 从磁盘加载根证书和私钥
    pub fn from_files(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let cert_pem = std::fs::read_to_string(cert_path).map_err(|e| {
            TunnelError::certificate(format!("Failed to read {:?}: {}", cert_path, e))
        })?;
        let key_pem = std::fs::read_to_string(key_path).map_err(|e| {
            TunnelError::certificate(format!("Failed to read {:?}: {}", key_path, e))
        })?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    pub fn with_organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = organization.into();
        self
    }

    pub fn with_leaf_validity_days(mut self, days: u32) -> Self {
        self.leaf_validity_days = days;
        self
    }

    pub fn root_der(&self) -> &CertificateDer<'static> {
        &self.root_der
    }

    /// 为 `host`（域名或 IP 字面量）签发叶子证书，由根证书签名。
    ///
    /// 每次调用都会生成新的密钥对和随机序列号。
    pub fn issue_leaf(&self, host: &str) -> Result<IssuedLeaf> {
        let host = host.trim_end_matches('.');
        if host.is_empty() {
            return Err(TunnelError::certificate("Cannot issue a leaf without a host name"));
        }

        let serial = random_serial();
        let mut params = CertificateParams::new(Vec::<String>::new())?;
        params.is_ca = IsCa::NoCa;
        params.use_authority_key_identifier_extension = true;
        params.serial_number = Some(SerialNumber::from_slice(&serial));
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let not_before = OffsetDateTime::now_utc() - BACKDATE;
        params.not_before = not_before;
        params.not_after = not_before + Duration::days(i64::from(self.leaf_validity_days));

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host.to_string());
        dn.push(DnType::OrganizationName, self.organization.clone());
        params.distinguished_name = dn;

        match host.parse::<IpAddr>() {
            Ok(ip) => params.subject_alt_names.push(SanType::IpAddress(ip)),
            Err(_) => params
                .subject_alt_names
                .push(SanType::DnsName(host.to_ascii_lowercase().try_into()?)),
        }

        let key = KeyPair::generate()?;
        let cert = params.signed_by(&key, &self.issuer)?;
        debug!("Issued leaf certificate for {}", host);

        Ok(IssuedLeaf {
            chain: vec![cert.der().clone(), self.root_der.clone()],
            key: PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key.serialize_der())),
            serial,
        })
    }
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("organization", &self.organization)
            .field("leaf_validity_days", &self.leaf_validity_days)
            .finish()
    }
}

/// 生成新的自签名根证书
pub fn generate_root(common_name: &str, organization: &str) -> Result<RootMaterial> {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name.to_string());
    dn.push(DnType::OrganizationName, organization.to_string());
    params.distinguished_name = dn;

    let now = OffsetDateTime::now_utc();
    params.not_before = now - BACKDATE;
    params.not_after = now + Duration::days(ROOT_VALIDITY_DAYS);

    let key = KeyPair::generate()?;
    let cert = params.self_signed(&key)?;

    Ok(RootMaterial {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
    })
}

/// 生成根证书并写入指定路径
pub fn write_root(
    common_name: &str,
    organization: &str,
    cert_out: &Path,
    key_out: &Path,
) -> anyhow::Result<()> {
    use anyhow::Context;

    let root = generate_root(common_name, organization)?;
    std::fs::write(cert_out, &root.cert_pem)
        .with_context(|| format!("Failed to write certificate to {:?}", cert_out))?;
    write_private_key(key_out, &root.key_pem)
        .with_context(|| format!("Failed to write private key to {:?}", key_out))?;
    Ok(())
}

#[cfg(unix)]
fn write_private_key(path: &Path, pem: &str) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(pem.as_bytes())
}

#[cfg(not(unix))]
fn write_private_key(path: &Path, pem: &str) -> std::io::Result<()> {
    std::fs::write(path, pem)
}

/// 128 位随机序列号（最高位清零保证为正数）
fn random_serial() -> Vec<u8> {
    let mut serial: [u8; 16] = rand::random();
    serial[0] &= 0x7f;
    if serial[0] == 0 {
        serial[0] = 0x01;
    }
    serial.to_vec()
}

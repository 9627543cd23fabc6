use anyhow::{bail, Context};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::allow_list::AllowList;
use crate::cert::{DEFAULT_LEAF_VALIDITY_DAYS, DEFAULT_ORGANIZATION};
use crate::detect::{DEFAULT_DETECT_TIMEOUT, DEFAULT_MAX_BUFFERED_BYTES};
use crate::preview::DEFAULT_PREVIEW_BYTES;

/// 监听配置
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// 透明代理监听地址
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    /// 是否在监听套接字上设置 IP_TRANSPARENT（仅 Linux）
    #[serde(default = "default_true")]
    pub transparent: bool,
    /// 连接上游的超时（秒）
    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,
    /// 单条连接的最长存活时间（秒）
    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,
    /// 调试用：忽略原始目标，固定连接到该地址
    #[serde(default)]
    pub upstream_override: Option<SocketAddr>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            transparent: true,
            dial_timeout_secs: default_dial_timeout_secs(),
            connection_timeout_secs: default_connection_timeout_secs(),
            upstream_override: None,
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 3129))
}

fn default_true() -> bool {
    true
}

fn default_dial_timeout_secs() -> u64 {
    10
}

fn default_connection_timeout_secs() -> u64 {
    300
}

/// 根证书配置
#[derive(Debug, Clone, Deserialize)]
pub struct CaConfig {
    /// 根证书路径（PEM）
    pub cert_path: PathBuf,
    /// 根私钥路径（PKCS#8 PEM）
    pub key_path: PathBuf,
    /// 叶子证书有效期（天）
    #[serde(default = "default_leaf_validity_days")]
    pub leaf_validity_days: u32,
    /// 叶子证书中的组织名
    #[serde(default = "default_organization")]
    pub organization: String,
}

fn default_leaf_validity_days() -> u32 {
    DEFAULT_LEAF_VALIDITY_DAYS
}

fn default_organization() -> String {
    DEFAULT_ORGANIZATION.to_string()
}

/// 访问真实上游时的 TLS 配置
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpstreamConfig {
    /// 额外信任的 CA 证书（可选）
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,
    /// 是否跳过证书验证（仅用于测试）
    #[serde(default)]
    pub skip_verify: bool,
}

/// 协议探测配置
#[derive(Debug, Clone, Deserialize)]
pub struct DetectConfig {
    #[serde(default = "default_detect_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_buffered_bytes")]
    pub max_buffered_bytes: usize,
}

impl Default for DetectConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_detect_timeout_ms(),
            max_buffered_bytes: default_max_buffered_bytes(),
        }
    }
}

fn default_detect_timeout_ms() -> u64 {
    DEFAULT_DETECT_TIMEOUT.as_millis() as u64
}

fn default_max_buffered_bytes() -> usize {
    DEFAULT_MAX_BUFFERED_BYTES
}

/// 中继配置
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// 消息体预览的最大字节数
    #[serde(default = "default_body_preview_bytes")]
    pub body_preview_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            body_preview_bytes: default_body_preview_bytes(),
        }
    }
}

fn default_body_preview_bytes() -> usize {
    DEFAULT_PREVIEW_BYTES
}

/// 白名单：命中的 TLS 连接直接透传
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AllowListConfig {
    /// IP 或 CIDR
    #[serde(default)]
    pub ips: Vec<String>,
    /// 域名，支持 `*.` 前缀
    #[serde(default)]
    pub domains: Vec<String>,
}

/// 应用配置
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub proxy: ProxyConfig,
    pub ca: CaConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub detect: DetectConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub allow_list: AllowListConfig,
}

impl AppConfig {
    /// 从文件加载并验证配置
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {:?}", path))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("Invalid configuration in {:?}", path))?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: AppConfig = toml::from_str(content).context("Failed to parse configuration")?;
        config
            .validate()
            .context("Configuration validation failed")?;
        Ok(config)
    }

    /// 验证配置的有效性
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.proxy.dial_timeout_secs == 0 {
            bail!("proxy.dial_timeout_secs cannot be 0");
        }
        if self.proxy.connection_timeout_secs == 0 {
            bail!("proxy.connection_timeout_secs cannot be 0");
        }
        if self.ca.cert_path.as_os_str().is_empty() || self.ca.key_path.as_os_str().is_empty() {
            bail!("ca.cert_path and ca.key_path must both be set");
        }
        if self.ca.leaf_validity_days == 0 {
            bail!("ca.leaf_validity_days cannot be 0");
        }
        if self.detect.timeout_ms == 0 {
            bail!("detect.timeout_ms cannot be 0");
        }
        if self.detect.max_buffered_bytes == 0 {
            bail!("detect.max_buffered_bytes cannot be 0");
        }

        AllowList::from_entries(&self.allow_list.ips, &self.allow_list.domains)
            .context("Invalid allow_list entry")?;
        Ok(())
    }
}

/// 拦截白名单
///
/// 命中白名单的 TLS 连接不做中间人解密，直接透传。
use ipnetwork::IpNetwork;
use std::collections::HashSet;
use std::net::IpAddr;

use crate::error::{Result, TunnelError};

/// 不允许拦截的目标
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    networks: Vec<IpNetwork>,
    domains: HashSet<String>,
    wildcard_suffixes: Vec<String>,
}

impl AllowList {
    pub fn new() -> Self {
        Self::default()
    }

    /// 解析 IP/CIDR 条目和域名条目（允许 `*.` 前缀）
    pub fn from_entries<I, D>(ips: I, domains: D) -> Result<Self>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
        D: IntoIterator,
        D::Item: AsRef<str>,
    {
        let mut list = Self::new();
        for ip in ips {
            list.add_ip(ip.as_ref())?;
        }
        for domain in domains {
            list.add_domain(domain.as_ref())?;
        }
        Ok(list)
    }

    /// 添加单个 IP 或 CIDR 网段
    pub fn add_ip(&mut self, entry: &str) -> Result<()> {
        let entry = entry.trim();
        let network = match entry.parse::<IpAddr>() {
            Ok(addr) => IpNetwork::from(addr),
            Err(_) => entry.parse::<IpNetwork>().map_err(|e| {
                TunnelError::config_error(format!("Invalid allow-list address '{}': {}", entry, e))
            })?,
        };
        self.networks.push(network);
        Ok(())
    }

    /// 添加域名，`*.example.com` 匹配所有子域名
    pub fn add_domain(&mut self, entry: &str) -> Result<()> {
        let name = normalize(entry);
        let invalid = || {
            TunnelError::config_error(format!("Invalid allow-list domain '{}'", entry))
        };
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(invalid());
        }

        if name.starts_with('*') {
            match name.strip_prefix("*.") {
                Some(suffix) if !suffix.is_empty() && !suffix.contains('*') => {
                    self.wildcard_suffixes.push(format!(".{}", suffix));
                }
                _ => return Err(invalid()),
            }
        } else {
            self.domains.insert(name);
        }
        Ok(())
    }

    pub fn contains_ip(&self, addr: IpAddr) -> bool {
        let addr = match addr {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(addr),
            v4 => v4,
        };
        self.networks.iter().any(|net| net.contains(addr))
    }

    pub fn contains_domain(&self, host: &str) -> bool {
        let host = normalize(host);
        if host.is_empty() {
            return false;
        }
        self.domains.contains(&host)
            || self
                .wildcard_suffixes
                .iter()
                .any(|suffix| host.ends_with(suffix.as_str()))
    }

    /// 目标为 `addr`、主机名为 `server_names` 的连接是否跳过拦截
    pub fn permits(&self, addr: IpAddr, server_names: &[String]) -> bool {
        self.contains_ip(addr) || server_names.iter().any(|name| self.contains_domain(name))
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty() && self.domains.is_empty() && self.wildcard_suffixes.is_empty()
    }
}

fn normalize(name: &str) -> String {
    name.trim().trim_end_matches('.').to_ascii_lowercase()
}

//! fleetgated.toml configuration.
//!
//! Every field has a default, so an empty file is a valid configuration.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use fleetgate_api::ProxySettings;
use fleetgate_api::host::HostPatterns;
use fleetgate_health::{ProbeConfig, TierTable};
use fleetgate_proxy::BalancerConfig;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub workload_proxy: WorkloadProxyConfig,
    pub balancer: BalancerSection,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    /// Directory of the state database. In-memory when unset.
    pub data_dir: Option<PathBuf>,
    pub log_format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            data_dir: None,
            log_format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadProxyConfig {
    pub main_url: String,
    pub main_domain: String,
    pub proxy_prefix: String,
    pub proxy_subdomain: String,
    /// Defaults to `main_domain` when empty.
    pub cookie_domain: String,
}

impl Default for WorkloadProxyConfig {
    fn default() -> Self {
        Self {
            main_url: "https://localhost".into(),
            main_domain: "localhost".into(),
            proxy_prefix: "p".into(),
            proxy_subdomain: "proxy-us".into(),
            cookie_domain: String::new(),
        }
    }
}

impl WorkloadProxyConfig {
    pub fn settings(&self) -> ProxySettings {
        let cookie_domain = if self.cookie_domain.is_empty() {
            self.main_domain.clone()
        } else {
            self.cookie_domain.clone()
        };
        ProxySettings {
            main_url: self.main_url.trim_end_matches('/').to_string(),
            hosts: HostPatterns {
                main_domain: self.main_domain.clone(),
                proxy_prefix: self.proxy_prefix.clone(),
                proxy_subdomain: self.proxy_subdomain.clone(),
            },
            cookie_domain,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerSection {
    pub dial_timeout_ms: u64,
    pub idle_timeout_secs: u64,
    pub probe_interval_ms: u64,
    pub probe_timeout_ms: u64,
    pub linger_ms: u64,
    pub unhealthy_threshold: u32,
    /// Upper bounds of the latency tiers, in microseconds.
    pub tier_boundaries_us: Vec<u64>,
}

impl Default for BalancerSection {
    fn default() -> Self {
        Self {
            dial_timeout_ms: 1000,
            idle_timeout_secs: 3600,
            probe_interval_ms: 20_000,
            probe_timeout_ms: 1000,
            linger_ms: 0,
            unhealthy_threshold: 3,
            tier_boundaries_us: vec![100, 1_000, 10_000, 100_000, 1_000_000],
        }
    }
}

impl BalancerSection {
    pub fn balancer_config(&self) -> BalancerConfig {
        BalancerConfig {
            dial_timeout: Duration::from_millis(self.dial_timeout_ms),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            probe_interval: Duration::from_millis(self.probe_interval_ms),
            unhealthy_threshold: self.unhealthy_threshold.max(1),
            probe: ProbeConfig {
                timeout: Duration::from_millis(self.probe_timeout_ms),
                linger: Duration::from_millis(self.linger_ms),
                tiers: TierTable::from_micros(&self.tier_boundaries_us),
            },
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        if config.balancer.tier_boundaries_us.is_empty() {
            anyhow::bail!("balancer.tier_boundaries_us must not be empty");
        }
        Ok(config)
    }
}

use anyhow::{Context, Result};
use serde::Deserialize;
use std::{fs, path::Path, time::Duration};

#[derive(Debug, Deserialize)]
pub struct Config {
    pub listen: ListenConfig,
    pub target: TargetConfig,
}

#[derive(Debug, Deserialize)]
pub struct ListenConfig {
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub proxy_protocol: ProxyProtocolConfig,
}

/// PROXY protocol settings for a listener
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyProtocolConfig {
    /// `"*"` or comma-separated IPs/CIDR blocks allowed to send a header
    pub allowed_proxy_ips: String,

    /// Seconds a trusted peer gets to send its complete header
    pub header_timeout: u64,

    /// Reject trusted peers that send no header
    pub require_header: bool,
}

impl Default for ProxyProtocolConfig {
    fn default() -> Self {
        Self {
            allowed_proxy_ips: "*".to_string(),
            header_timeout: 5,
            require_header: false,
        }
    }
}

impl ProxyProtocolConfig {
    #[must_use]
    pub const fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.header_timeout)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    pub host: String,
    pub port: u16,
    /// Prepend a PROXY header when connecting to the target
    pub send_proxy: Option<SendProxy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendProxy {
    V1,
    V2,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse {} as valid TOML", path.display()))
}

use ipnet::IpNet;
use std::{net::IpAddr, str::FromStr};

use crate::error::ConfigError;

const WILDCARD: &str = "*";

/// Set of peer networks trusted to send a PROXY protocol header.
///
/// Built once from a specification string and shared read-only between
/// connections, usually behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowList {
    /// Every peer is trusted
    Any,
    Networks(Vec<IpNet>),
}

impl AllowList {
    /// Parses `"*"` or a comma-separated list of IPs and CIDR blocks.
    /// Plain IPs become `/32` or `/128` networks.
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(ConfigError::Empty);
        }

        let mut any = false;
        let mut networks = Vec::new();
        for entry in spec.split(',').map(str::trim) {
            if entry == WILDCARD {
                any = true;
            } else {
                networks.push(parse_entry(entry)?);
            }
        }
        Ok(if any { Self::Any } else { Self::Networks(networks) })
    }

    #[must_use]
    pub fn is_allowed(&self, addr: IpAddr) -> bool {
        match self {
            Self::Any => true,
            Self::Networks(networks) => {
                let addr = addr.to_canonical();
                networks.iter().any(|net| net.contains(&addr))
            }
        }
    }
}

impl FromStr for AllowList {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn parse_entry(entry: &str) -> Result<IpNet, ConfigError> {
    // Try parsing as individual IP address first
    let net = if let Ok(ip) = entry.parse::<IpAddr>() {
        let prefix_len = if ip.is_ipv4() { 32 } else { 128 };
        IpNet::new(ip, prefix_len).ok()
    } else {
        entry.parse::<IpNet>().ok()
    };
    net.and_then(canonical_net)
        .ok_or_else(|| ConfigError::InvalidEntry(entry.to_string()))
}

/// Rewrites blocks inside `::ffff:0:0/96` as IPv4 blocks, since peers are
/// canonicalised before matching.
fn canonical_net(net: IpNet) -> Option<IpNet> {
    let IpNet::V6(v6) = net else {
        return Some(net);
    };
    match v6.addr().to_ipv4_mapped() {
        Some(v4) if v6.prefix_len() >= 96 => IpNet::new(IpAddr::V4(v4), v6.prefix_len() - 96).ok(),
        _ => Some(net),
    }
}

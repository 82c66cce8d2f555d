//! Proxy bypass rules
//!
//! Hostname patterns that exempt a destination from proxying. Supported rule
//! forms:
//!
//! - `<local>`: any hostname without a dot
//! - `host.example.com`: exact hostname
//! - `*.example.com`: suffix match
//! - `10.0.0.*`: prefix match
//! - `10.0.0.0/24`, `192.168/16`: IPv4 network match (missing octets are zero)

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

/// Bypass list as it appears in configuration: either one delimited string or a list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BypassRules {
    Delimited(String),
    List(Vec<String>),
}

impl Default for BypassRules {
    fn default() -> Self {
        BypassRules::List(Vec::new())
    }
}

/// Normalized bypass rule list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BypassList {
    rules: Vec<String>,
}

impl BypassList {
    pub fn new<I, S>(rules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            rules: rules
                .into_iter()
                .map(|r| r.as_ref().trim().to_lowercase())
                .filter(|r| !r.is_empty())
                .collect(),
        }
    }

    /// Split a `;`/whitespace separated rule string
    pub fn parse(raw: &str) -> Self {
        Self::new(raw.split(|c: char| c == ';' || c.is_whitespace()))
    }

    pub fn from_rules(rules: &BypassRules) -> Self {
        match rules {
            BypassRules::Delimited(raw) => Self::parse(raw),
            BypassRules::List(rules) => Self::new(rules),
        }
    }

    pub fn rules(&self) -> &[String] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Check whether requests to `target_url` should skip the proxy.
    ///
    /// Unparsable URLs never bypass.
    pub fn is_bypass(&self, target_url: &str) -> bool {
        if self.rules.is_empty() {
            return false;
        }
        let Ok(url) = Url::parse(target_url) else {
            return false;
        };
        let Some(host) = url.host_str() else {
            return false;
        };
        self.matches_host(host)
    }

    /// Check a bare hostname against the rules; first match wins
    pub fn matches_host(&self, hostname: &str) -> bool {
        let hostname = hostname
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(hostname)
            .to_lowercase();

        let matched = self.rules.iter().find(|rule| rule_matches(rule, &hostname));
        if let Some(rule) = matched {
            debug!(hostname = %hostname, rule = %rule, "proxy bypass");
            return true;
        }
        false
    }
}

fn rule_matches(rule: &str, hostname: &str) -> bool {
    if rule == "<local>" {
        return !hostname.contains('.');
    }
    if rule == hostname {
        return true;
    }
    if let Some(suffix) = rule.strip_prefix('*') {
        return hostname.ends_with(suffix);
    }
    if let Some(prefix) = rule.strip_suffix('*') {
        return hostname.starts_with(prefix);
    }
    if let Some((network, bits)) = rule.split_once('/') {
        return network_matches(network, bits, hostname);
    }
    false
}

fn network_matches(network: &str, bits: &str, hostname: &str) -> bool {
    let Ok(bits) = bits.parse::<u32>() else {
        return false;
    };
    if bits > 32 {
        return false;
    }
    let Some(network) = parse_partial_ipv4(network) else {
        return false;
    };
    let Ok(addr) = hostname.parse::<Ipv4Addr>() else {
        return false;
    };

    let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
    u32::from(addr) & mask == u32::from(network) & mask
}

/// Parse `a`, `a.b`, `a.b.c` or `a.b.c.d`, zero-filling missing octets
fn parse_partial_ipv4(s: &str) -> Option<Ipv4Addr> {
    let mut octets = [0u8; 4];
    let parts: Vec<&str> = s.split('.').collect();
    if parts.is_empty() || parts.len() > 4 {
        return None;
    }
    for (i, part) in parts.iter().enumerate() {
        octets[i] = part.parse().ok()?;
    }
    Some(Ipv4Addr::from(octets))
}

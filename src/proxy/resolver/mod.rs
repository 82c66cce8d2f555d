//! Proxy resolvers
//!
//! Turn proxy configuration into an ordered list of candidates for a URL.
//! Every resolver honours its bypass list first: a bypassed URL yields no
//! candidates and is connected directly.

mod pac;

pub use pac::{
    load_pac, parse_directives, HyperPacFetcher, PacEvaluator, PacFetcher, PacResolver, PacSource,
};

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::config::{ProxyConfig, ProxyMode};
use crate::error::{AgentError, Result};
use crate::models::{ProxyDescriptor, ProxyProtocol};
use crate::proxy::bypass::BypassList;

/// One fixed proxy
#[derive(Debug, Clone)]
pub struct ManualResolver {
    proxy: ProxyDescriptor,
    bypass: BypassList,
}

impl ManualResolver {
    /// Build from `[scheme://][user[:pass]@]host[:port]`.
    ///
    /// `protocol` applies when `host` carries no scheme, and `port`
    /// overrides whatever port `host` carries.
    pub fn new(
        host: &str,
        port: Option<u16>,
        protocol: Option<ProxyProtocol>,
        bypass: BypassList,
    ) -> Result<Self> {
        let input = match protocol {
            Some(protocol) if !host.contains("://") => format!("{}://{}", protocol, host),
            _ => host.to_string(),
        };
        let mut proxy = ProxyDescriptor::parse(&input)
            .filter(|p| !p.is_direct())
            .ok_or_else(|| AgentError::InvalidProxyAddress(host.to_string()))?;
        if let Some(port) = port {
            proxy.port = port;
        }
        Ok(Self { proxy, bypass })
    }

    pub fn proxy(&self) -> &ProxyDescriptor {
        &self.proxy
    }
}

/// Per-scheme proxies as reported by platforms that configure HTTP, HTTPS and
/// SOCKS separately
#[derive(Debug, Clone, Default)]
pub struct ProtocolResolver {
    pub http: Option<ProxyDescriptor>,
    pub https: Option<ProxyDescriptor>,
    pub socks: Option<ProxyDescriptor>,
    pub bypass: BypassList,
}

impl ProtocolResolver {
    fn select(&self, target_url: &str) -> Option<&ProxyDescriptor> {
        if self.socks.is_some() {
            return self.socks.as_ref();
        }
        if target_url.starts_with("http://") {
            return self.http.as_ref();
        }
        if target_url.starts_with("https://") {
            return self.https.as_ref();
        }
        self.https.as_ref().or(self.http.as_ref())
    }
}

/// Windows-style `scheme=host:port;scheme=host:port` list
#[derive(Debug, Clone, Default)]
pub struct ListResolver {
    proxies: Vec<ProxyDescriptor>,
    bypass: BypassList,
}

impl ListResolver {
    /// Parse the delimited list; unlabeled tokens are HTTP proxies, tokens with
    /// an unrecognized scheme are dropped.
    pub fn parse(proxies: &str, bypass: BypassList) -> Self {
        let proxies = proxies
            .split(|c: char| c == ';' || c.is_whitespace())
            .filter(|token| !token.is_empty())
            .filter_map(parse_list_token)
            .collect();
        Self { proxies, bypass }
    }

    pub fn proxies(&self) -> &[ProxyDescriptor] {
        &self.proxies
    }
}

fn parse_list_token(token: &str) -> Option<ProxyDescriptor> {
    let (scheme, rest) = match token.split_once('=') {
        Some((scheme, rest)) => (scheme, rest),
        None => ("http", token),
    };
    let input = if rest.contains("://") {
        rest.to_string()
    } else {
        format!("{}://{}", scheme, rest)
    };
    ProxyDescriptor::parse(&input).filter(|p| !p.is_direct())
}

/// The resolver family
#[derive(Debug, Clone)]
pub enum ProxyResolver {
    Manual(ManualResolver),
    PlatformProtocol(ProtocolResolver),
    PlatformList(ListResolver),
    PacScript(PacResolver),
}

impl ProxyResolver {
    pub fn bypass(&self) -> &BypassList {
        match self {
            ProxyResolver::Manual(r) => &r.bypass,
            ProxyResolver::PlatformProtocol(r) => &r.bypass,
            ProxyResolver::PlatformList(r) => &r.bypass,
            ProxyResolver::PacScript(r) => &r.bypass,
        }
    }

    pub fn is_bypass(&self, target_url: &str) -> bool {
        self.bypass().is_bypass(target_url)
    }

    /// Ordered proxy candidates for `target_url`; empty means connect directly
    #[instrument(skip(self))]
    pub async fn resolve(&self, target_url: &str) -> Result<Vec<ProxyDescriptor>> {
        if self.is_bypass(target_url) {
            return Ok(Vec::new());
        }

        let candidates = match self {
            ProxyResolver::Manual(r) => vec![r.proxy.clone()],
            ProxyResolver::PlatformProtocol(r) => r.select(target_url).cloned().into_iter().collect(),
            ProxyResolver::PlatformList(r) => r.proxies.clone(),
            ProxyResolver::PacScript(r) => r.candidates(target_url).await,
        };

        debug!(count = candidates.len(), "resolved proxy candidates");
        Ok(candidates)
    }
}

/// Build the resolver described by `config`.
///
/// Returns `Ok(None)` when no proxy is configured, and also when a PAC script
/// cannot be loaded or evaluated, so that requests connect directly.
pub async fn discover_proxy(
    config: &ProxyConfig,
    fetcher: &dyn PacFetcher,
    evaluator: Option<Arc<dyn PacEvaluator>>,
) -> Result<Option<ProxyResolver>> {
    let Some(mode) = config.effective_mode() else {
        return Ok(None);
    };
    debug!(mode = ?mode, "proxy system settings");

    let bypass = BypassList::from_rules(&config.bypass);

    let resolver = match mode {
        ProxyMode::Manual => {
            let host = config.host.as_deref().ok_or_else(|| {
                AgentError::InvalidConfig("manual proxy mode requires a host".into())
            })?;
            let protocol = match config.protocol.as_deref() {
                Some(p) => Some(
                    ProxyProtocol::from_str(p)
                        .ok_or_else(|| AgentError::UnsupportedProtocol(p.to_string()))?,
                ),
                None => None,
            };
            ProxyResolver::Manual(ManualResolver::new(host, config.port, protocol, bypass)?)
        }
        ProxyMode::PlatformProtocol => ProxyResolver::PlatformProtocol(ProtocolResolver {
            http: parse_platform_entry(config.http.as_deref(), ProxyProtocol::Http)?,
            https: parse_platform_entry(config.https.as_deref(), ProxyProtocol::Https)?,
            socks: parse_platform_entry(config.socks.as_deref(), ProxyProtocol::Socks)?,
            bypass,
        }),
        ProxyMode::PlatformList => {
            let proxies = config.proxies.as_deref().ok_or_else(|| {
                AgentError::InvalidConfig("platform list mode requires a proxy list".into())
            })?;
            ProxyResolver::PlatformList(ListResolver::parse(proxies, bypass))
        }
        ProxyMode::PacUrl | ProxyMode::PacInline => {
            let pac = config.pac.as_deref().ok_or_else(|| {
                AgentError::InvalidConfig("PAC mode requires a PAC source".into())
            })?;
            let Some(evaluator) = evaluator else {
                warn!("PAC configured but no evaluator available, connecting directly");
                return Ok(None);
            };
            let source = if mode == ProxyMode::PacInline {
                PacSource::Inline(pac.to_string())
            } else {
                PacSource::from_location(pac)
            };
            let Some(script) = load_pac(&source, fetcher).await else {
                return Ok(None);
            };
            ProxyResolver::PacScript(PacResolver::new(script, evaluator, bypass))
        }
    };

    Ok(Some(resolver))
}

fn parse_platform_entry(
    entry: Option<&str>,
    protocol: ProxyProtocol,
) -> Result<Option<ProxyDescriptor>> {
    let Some(entry) = entry.map(str::trim).filter(|e| !e.is_empty()) else {
        return Ok(None);
    };
    let input = if entry.contains("://") {
        entry.to_string()
    } else {
        format!("{}://{}", protocol, entry)
    };
    ProxyDescriptor::parse(&input)
        .filter(|p| !p.is_direct())
        .map(Some)
        .ok_or_else(|| AgentError::InvalidProxyAddress(entry.to_string()))
}

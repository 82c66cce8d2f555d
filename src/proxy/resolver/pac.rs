//! Proxy auto-config (PAC) support
//!
//! Script evaluation is delegated to a [`PacEvaluator`]; this module only
//! loads scripts and turns `FindProxyForURL` results into proxy candidates.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::{debug, instrument, warn};

use crate::proxy::bypass::BypassList;
use crate::error::{AgentError, Result};
use crate::models::{ProxyDescriptor, ProxyProtocol};

/// Evaluates a PAC script for one URL, returning its directive string
/// (for example `"PROXY 10.0.0.1:3128; DIRECT"`).
#[async_trait]
pub trait PacEvaluator: Send + Sync {
    async fn find_proxy(&self, script: &str, url: &str, host: &str) -> Result<String>;
}

/// Retrieves a PAC script over the network
#[async_trait]
pub trait PacFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String>;
}

/// Plain-HTTP PAC fetcher built on the hyper client
#[derive(Clone)]
pub struct HyperPacFetcher {
    client: Client<HttpConnector, Empty<Bytes>>,
}

impl HyperPacFetcher {
    pub fn new() -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }
}

impl Default for HyperPacFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PacFetcher for HyperPacFetcher {
    #[instrument(skip(self))]
    async fn fetch(&self, url: &str) -> Result<String> {
        let uri: hyper::Uri = url
            .parse()
            .map_err(|e: http::uri::InvalidUri| AgentError::InvalidUrl(e.to_string()))?;

        let response = self.client.get(uri).await?;
        if !response.status().is_success() {
            return Err(AgentError::Pac(format!(
                "PAC fetch returned {}",
                response.status()
            )));
        }

        let body = response.into_body().collect().await?.to_bytes();
        String::from_utf8(body.to_vec()).map_err(|e| AgentError::Pac(e.to_string()))
    }
}

/// Where a PAC script comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacSource {
    File(PathBuf),
    Url(String),
    Inline(String),
}

impl PacSource {
    /// Classify a PAC location: `file://` paths and `http(s)://` URLs;
    /// anything else is taken as a local path.
    pub fn from_location(location: &str) -> Self {
        if let Some(path) = location.strip_prefix("file://") {
            PacSource::File(PathBuf::from(path))
        } else if location.starts_with("http://") || location.starts_with("https://") {
            PacSource::Url(location.to_string())
        } else {
            PacSource::File(PathBuf::from(location))
        }
    }
}

/// Load a PAC script; any failure yields `None` so the caller connects directly
pub async fn load_pac(source: &PacSource, fetcher: &dyn PacFetcher) -> Option<String> {
    match source {
        PacSource::Inline(script) => Some(script.clone()),
        PacSource::File(path) => match tokio::fs::read_to_string(path).await {
            Ok(script) => Some(script),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read PAC file");
                None
            }
        },
        PacSource::Url(url) => match fetcher.fetch(url).await {
            Ok(script) => Some(script),
            Err(e) => {
                warn!(url = %url, error = %e, "failed to fetch PAC script");
                None
            }
        },
    }
}

/// Resolver backed by a PAC script
#[derive(Clone)]
pub struct PacResolver {
    pub(crate) script: Arc<str>,
    pub(crate) evaluator: Arc<dyn PacEvaluator>,
    pub(crate) bypass: BypassList,
}

impl PacResolver {
    pub fn new(script: impl Into<Arc<str>>, evaluator: Arc<dyn PacEvaluator>, bypass: BypassList) -> Self {
        Self {
            script: script.into(),
            evaluator,
            bypass,
        }
    }

    pub(crate) async fn candidates(&self, target_url: &str) -> Vec<ProxyDescriptor> {
        let host = url::Url::parse(target_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default();

        match self.evaluator.find_proxy(&self.script, target_url, &host).await {
            Ok(directives) => {
                debug!(url = %target_url, directives = %directives, "PAC result");
                parse_directives(&directives)
            }
            Err(e) => {
                debug!(url = %target_url, error = %e, "PAC evaluation failed");
                Vec::new()
            }
        }
    }
}

impl std::fmt::Debug for PacResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacResolver")
            .field("script_len", &self.script.len())
            .field("bypass", &self.bypass)
            .finish()
    }
}

/// Parse a `;`-separated PAC result into ordered candidates.
///
/// `DIRECT` becomes the direct candidate; unknown directives are skipped.
pub fn parse_directives(directives: &str) -> Vec<ProxyDescriptor> {
    directives
        .split(';')
        .filter_map(parse_directive)
        .collect()
}

fn parse_directive(directive: &str) -> Option<ProxyDescriptor> {
    let mut parts = directive.split_whitespace();
    let keyword = parts.next()?.to_uppercase();
    if keyword == "DIRECT" {
        return Some(ProxyDescriptor::direct());
    }

    let address = parts.next()?;
    let protocol = match keyword.as_str() {
        "PROXY" => ProxyProtocol::Http,
        "HTTPS" => ProxyProtocol::Https,
        "SOCKS" => ProxyProtocol::Socks,
        "SOCKS4" => ProxyProtocol::Socks4,
        "SOCKS5" => ProxyProtocol::Socks5,
        _ => return None,
    };
    ProxyDescriptor::parse(&format!("{}://{}", protocol, address))
}

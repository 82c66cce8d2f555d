//! Tunnelagent - Entry Point
//!
//! Resolves the proxy for a URL from the environment's proxy settings, then
//! opens a connection to it through the agent and reports the outcome.

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use url::Url;

use tunnelagent::config::LogConfig;
use tunnelagent::models::Destination;
use tunnelagent::proxy::resolver::HyperPacFetcher;
use tunnelagent::proxy::{discover_proxy, ProxyDecision, ProxySession};
use tunnelagent::{Config, ConnectionAgent};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config.log);

    let target = std::env::args()
        .nth(1)
        .context("usage: tunnelagent <url>")?;
    let url = Url::parse(&target).with_context(|| format!("invalid URL: {}", target))?;
    let destination = Destination::from_url(&url).context("URL has no host")?;

    info!(mode = ?config.proxy.effective_mode(), "Configuration loaded");

    // No script engine is bundled, so PAC settings fall back to direct.
    let resolver = discover_proxy(&config.proxy, &HyperPacFetcher::new(), None).await?;
    let session = Arc::new(ProxySession::new(resolver, None));

    session.on_proxy_authenticate(|challenge| {
        warn!(
            host = %challenge.host,
            realm = %challenge.realm,
            "Proxy requires credentials; put them in the proxy URL"
        );
        false
    });
    session.on_proxy_error(|host, err| {
        warn!(host = %host, error = %err, "Proxy failed");
    });

    match session.proxy_for_url(url.as_str()).await {
        ProxyDecision::Direct => println!("DIRECT"),
        ProxyDecision::Proxy(proxy) => {
            println!("PROXY {} ({})", proxy.address(), proxy.protocol)
        }
        ProxyDecision::Unavailable => println!("UNAVAILABLE"),
    }

    let agent = ConnectionAgent::new(config.agent.clone(), Some(session));
    match agent.connect(destination).await {
        Ok(connection) => {
            info!(slot = %connection.slot(), "Connection established");
            println!("connected to {}", connection.destination().authority());
            Ok(())
        }
        Err(e) => {
            error!(code = e.code(), error = %e, "Connection failed");
            Err(e.into())
        }
    }
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("tunnelagent={}", log.level).into());
    let registry = tracing_subscriber::registry().with(filter);

    if log.format == "pretty" {
        registry.with(tracing_subscriber::fmt::layer().pretty()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    }
}

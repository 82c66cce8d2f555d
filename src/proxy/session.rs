//! Proxy session
//!
//! Chooses the proxy for each URL from the active resolver, attaches cached
//! credentials, and remembers which proxy hosts have failed so a broken or
//! unauthenticated proxy is not retried in a loop.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::error::AgentError;
use crate::models::{Credentials, ProxyDescriptor};
use crate::proxy::credentials::CredentialStore;
use crate::proxy::resolver::ProxyResolver;

/// Outcome of proxy selection for one URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyDecision {
    /// Connect without a proxy
    Direct,
    /// Connect through this proxy
    Proxy(ProxyDescriptor),
    /// Proxies are configured but none is usable
    Unavailable,
}

/// How long a failed proxy host stays excluded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InvalidationPolicy {
    /// Until the credential cache is replaced
    #[default]
    Permanent,
    /// Until the given time has passed, or the credential cache is replaced
    Cooldown(Duration),
}

/// One-shot continuation that re-runs a connection attempt.
///
/// Clones share the same action; only the first `retry` runs it.
#[derive(Clone)]
pub struct RetryToken {
    action: Arc<Mutex<Option<Box<dyn FnOnce() + Send>>>>,
}

impl RetryToken {
    pub fn new(action: impl FnOnce() + Send + 'static) -> Self {
        Self {
            action: Arc::new(Mutex::new(Some(Box::new(action)))),
        }
    }

    /// Run the retry; returns `false` if it already ran
    pub fn retry(&self) -> bool {
        let action = self.action.lock().take();
        match action {
            Some(action) => {
                action();
                true
            }
            None => false,
        }
    }

    pub fn is_spent(&self) -> bool {
        self.action.lock().is_none()
    }
}

impl std::fmt::Debug for RetryToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryToken")
            .field("spent", &self.is_spent())
            .finish()
    }
}

/// A proxy asked for authentication
#[derive(Debug, Clone)]
pub struct ProxyChallenge {
    pub host: String,
    pub realm: String,
    pub retry: RetryToken,
}

/// A proxy failed in a way another proxy might not
#[derive(Debug)]
pub struct ProxyFailure {
    pub host: String,
    pub error: AgentError,
    pub retry: RetryToken,
}

/// Returns `true` to take over the challenge; the handler must then call
/// `challenge.retry.retry()` once credentials are available.
pub type ChallengeHandler = Arc<dyn Fn(&ProxyChallenge) -> bool + Send + Sync>;

/// Observes proxy failures before the failed host is invalidated
pub type FailureHandler = Arc<dyn Fn(&str, &AgentError) + Send + Sync>;

/// Proxy selection state shared by every connection of one agent
pub struct ProxySession {
    resolver: RwLock<Option<Arc<ProxyResolver>>>,
    credentials: RwLock<Arc<CredentialStore>>,
    invalid: DashMap<String, Instant>,
    policy: InvalidationPolicy,
    challenge_handlers: RwLock<Vec<ChallengeHandler>>,
    failure_handlers: RwLock<Vec<FailureHandler>>,
}

impl ProxySession {
    pub fn new(resolver: Option<ProxyResolver>, credentials: Option<Arc<CredentialStore>>) -> Self {
        Self {
            resolver: RwLock::new(resolver.map(Arc::new)),
            credentials: RwLock::new(credentials.unwrap_or_default()),
            invalid: DashMap::new(),
            policy: InvalidationPolicy::default(),
            challenge_handlers: RwLock::new(Vec::new()),
            failure_handlers: RwLock::new(Vec::new()),
        }
    }

    pub fn with_policy(mut self, policy: InvalidationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.resolver.read().is_some()
    }

    pub fn resolver(&self) -> Option<Arc<ProxyResolver>> {
        self.resolver.read().clone()
    }

    pub fn set_resolver(&self, resolver: Option<ProxyResolver>) {
        *self.resolver.write() = resolver.map(Arc::new);
    }

    /// Seed credentials for a proxy host in the current cache
    pub fn set_credentials(&self, host: &str, credentials: Credentials) {
        self.credentials().set_credentials(host, credentials);
    }

    /// Replace the credential cache; every proxy host becomes valid again
    pub fn set_credentials_cache(&self, cache: Arc<CredentialStore>) {
        *self.credentials.write() = cache;
        self.invalid.clear();
        info!("credential cache replaced, proxy validity reset");
    }

    pub async fn find_credentials(&self, host: &str) -> Credentials {
        self.credentials().find_credentials(host).await
    }

    fn credentials(&self) -> Arc<CredentialStore> {
        self.credentials.read().clone()
    }

    pub fn mark_invalid(&self, host: &str) {
        warn!(host = %host, "marking proxy invalid");
        self.invalid.insert(host.to_string(), Instant::now());
    }

    pub fn is_valid(&self, host: &str) -> bool {
        let Some(since) = self.invalid.get(host).map(|entry| *entry.value()) else {
            return true;
        };
        match self.policy {
            InvalidationPolicy::Permanent => false,
            InvalidationPolicy::Cooldown(cooldown) => {
                if since.elapsed() >= cooldown {
                    self.invalid.remove(host);
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn on_proxy_authenticate<F>(&self, handler: F)
    where
        F: Fn(&ProxyChallenge) -> bool + Send + Sync + 'static,
    {
        self.challenge_handlers.write().push(Arc::new(handler));
    }

    pub fn on_proxy_error<F>(&self, handler: F)
    where
        F: Fn(&str, &AgentError) + Send + Sync + 'static,
    {
        self.failure_handlers.write().push(Arc::new(handler));
    }

    /// Offer an authentication challenge to the registered handlers.
    ///
    /// Returns `true` when at least one handler took it over; the attempt must
    /// then wait for that handler to resume it.
    pub fn offer_challenge(&self, challenge: &ProxyChallenge) -> bool {
        let handlers = self.challenge_handlers.read().clone();
        let mut consumed = false;
        for handler in handlers {
            consumed |= handler(challenge);
        }
        if consumed {
            debug!(host = %challenge.host, realm = %challenge.realm, "proxy authentication pending");
        }
        consumed
    }

    /// Handle a failure of one proxy: invalidate its host and retry at once.
    ///
    /// Always handled, so the caller must not report the error itself.
    pub fn on_error(&self, failure: ProxyFailure) -> bool {
        let handlers = self.failure_handlers.read().clone();
        for handler in handlers {
            handler(&failure.host, &failure.error);
        }
        self.mark_invalid(&failure.host);
        failure.retry.retry();
        true
    }

    /// Choose how to reach `url`
    #[instrument(skip(self))]
    pub async fn proxy_for_url(&self, url: &str) -> ProxyDecision {
        let Some(resolver) = self.resolver() else {
            return ProxyDecision::Direct;
        };

        let candidates = match resolver.resolve(url).await {
            Ok(candidates) => candidates,
            Err(e) => {
                debug!(error = %e, "proxy resolution failed, connecting directly");
                return ProxyDecision::Direct;
            }
        };

        self.search_proxies(candidates).await
    }

    async fn search_proxies(&self, candidates: Vec<ProxyDescriptor>) -> ProxyDecision {
        if candidates.is_empty() {
            return ProxyDecision::Direct;
        }

        for candidate in candidates {
            if candidate.is_direct() {
                return ProxyDecision::Direct;
            }
            if !self.is_valid(&candidate.host) {
                debug!(host = %candidate.host, "skipping invalid proxy");
                continue;
            }

            let credentials = self.find_credentials(&candidate.host).await;
            let proxy = if credentials.is_empty() {
                candidate
            } else {
                candidate.with_credentials(credentials)
            };
            return ProxyDecision::Proxy(proxy);
        }

        debug!("no valid proxies found");
        ProxyDecision::Unavailable
    }
}

impl Default for ProxySession {
    fn default() -> Self {
        Self::new(None, None)
    }
}

impl std::fmt::Debug for ProxySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxySession")
            .field("resolver", &self.resolver.read())
            .field("invalid_hosts", &self.invalid.len())
            .field("policy", &self.policy)
            .finish()
    }
}

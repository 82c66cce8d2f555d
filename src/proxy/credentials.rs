//! Proxy credential cache
//!
//! Memoizes a pluggable host → credentials lookup. Concurrent lookups for the
//! same host share one in-flight fetch, and a failed fetch yields empty
//! credentials instead of an error.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::Result;
use crate::models::Credentials;

/// Source of proxy credentials (keychain, prompt, configuration file, ...)
#[async_trait]
pub trait CredentialLookup: Send + Sync {
    async fn lookup(&self, host: &str) -> Result<Credentials>;
}

/// Lookup that never knows any credentials
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCredentials;

#[async_trait]
impl CredentialLookup for NoCredentials {
    async fn lookup(&self, _host: &str) -> Result<Credentials> {
        Ok(Credentials::default())
    }
}

type CredentialFuture = Shared<BoxFuture<'static, Credentials>>;

/// Memoized credential cache keyed by proxy host
pub struct CredentialStore {
    lookup: Arc<dyn CredentialLookup>,
    cache: Mutex<HashMap<String, CredentialFuture>>,
}

impl CredentialStore {
    pub fn new(lookup: Arc<dyn CredentialLookup>) -> Self {
        Self {
            lookup,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Seed the cache, replacing any pending or resolved entry for `host`
    pub fn set_credentials(&self, host: &str, credentials: Credentials) {
        let ready = futures::future::ready(credentials).boxed().shared();
        self.cache.lock().insert(host.to_string(), ready);
    }

    /// Find credentials for `host`, running the lookup at most once
    pub async fn find_credentials(&self, host: &str) -> Credentials {
        let pending = {
            let mut cache = self.cache.lock();
            cache
                .entry(host.to_string())
                .or_insert_with(|| self.fetch(host))
                .clone()
        };
        pending.await
    }

    fn fetch(&self, host: &str) -> CredentialFuture {
        let lookup = self.lookup.clone();
        let host = host.to_string();
        async move {
            match lookup.lookup(&host).await {
                Ok(credentials) => {
                    debug!(host = %host, "proxy authenticated");
                    credentials
                }
                Err(e) => {
                    debug!(host = %host, error = %e, "proxy unauthenticated");
                    Credentials::default()
                }
            }
        }
        .boxed()
        .shared()
    }
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new(Arc::new(NoCredentials))
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("hosts", &self.cache.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AgentError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Duration;

    struct CountingLookup {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl CredentialLookup for CountingLookup {
        async fn lookup(&self, host: &str) -> Result<Credentials> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail {
                return Err(AgentError::Internal("keychain locked".to_string()));
            }
            Ok(Credentials::new(format!("user@{}", host), "secret"))
        }
    }

    #[tokio::test]
    async fn test_concurrent_lookups_fetch_once() {
        let lookup = Arc::new(CountingLookup {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let store = CredentialStore::new(lookup.clone());

        let (a, b) = tokio::join!(
            store.find_credentials("proxy.local"),
            store.find_credentials("proxy.local")
        );

        assert_eq!(a, b);
        assert_eq!(a.username, "user@proxy.local");
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);

        store.find_credentials("proxy.local").await;
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);

        store.find_credentials("other.local").await;
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_lookup_degrades_to_empty() {
        let lookup = Arc::new(CountingLookup {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let store = CredentialStore::new(lookup.clone());

        let creds = store.find_credentials("proxy.local").await;
        assert!(creds.is_empty());

        // The failure is memoized too.
        store.find_credentials("proxy.local").await;
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_set_credentials_overrides_lookup() {
        let lookup = Arc::new(CountingLookup {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let store = CredentialStore::new(lookup.clone());

        store.set_credentials("proxy.local", Credentials::new("alice", "pw"));
        let creds = store.find_credentials("proxy.local").await;
        assert_eq!(creds, Credentials::new("alice", "pw"));
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 0);
    }
}

//! Connection agent
//!
//! Hands out connections to requests, bounded by `max_sockets`. Each admitted
//! request gets a reserved pool slot while its connection is created in a
//! spawned task: the proxy is chosen by the session, the tunnel is opened,
//! TLS is layered on for secure destinations, and the slot turns live.
//! Proxy failures are retried as fresh admissions after the session has
//! invalidated the failing proxy.

pub mod pool;
pub mod request;

pub use pool::SlotId;
pub use request::{ConnectRequest, PooledConnection, RequestHandle};

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, instrument, warn};

use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::models::Destination;
use crate::proxy::session::{ProxyChallenge, ProxyDecision, ProxyFailure, ProxySession, RetryToken};
use crate::proxy::transport::{
    BoxedConnection, DnsResolver, SystemDnsResolver, TokioTransport, Transport,
};
use crate::proxy::tunnel::{RetryReason, TunnelEstablisher, TunnelOutcome};
use pool::{PendingRequest, SocketPool};

/// Pooled connection agent; clones share one pool
#[derive(Clone)]
pub struct ConnectionAgent {
    inner: Arc<AgentInner>,
}

pub(crate) struct AgentInner {
    config: AgentConfig,
    session: Option<Arc<ProxySession>>,
    tunnels: TunnelEstablisher,
    pool: Mutex<SocketPool>,
    runtime: Handle,
}

impl ConnectionAgent {
    /// Agent over real TCP/TLS and the system resolver.
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: AgentConfig, session: Option<Arc<ProxySession>>) -> Self {
        let transport = Arc::new(TokioTransport::new(config.connect_timeout));
        Self::with_transport(config, session, transport, Arc::new(SystemDnsResolver))
    }

    /// # Panics
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_transport(
        config: AgentConfig,
        session: Option<Arc<ProxySession>>,
        transport: Arc<dyn Transport>,
        dns: Arc<dyn DnsResolver>,
    ) -> Self {
        let pool = SocketPool::new(config.max_sockets);
        Self {
            inner: Arc::new(AgentInner {
                config,
                session,
                tunnels: TunnelEstablisher::new(transport, dns),
                pool: Mutex::new(pool),
                runtime: Handle::current(),
            }),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    pub fn session(&self) -> Option<&Arc<ProxySession>> {
        self.inner.session.as_ref()
    }

    fn is_secure_endpoint(&self) -> bool {
        self.inner.config.secure_endpoint == Some(true)
    }

    pub fn default_port(&self) -> u16 {
        if self.is_secure_endpoint() {
            443
        } else {
            80
        }
    }

    pub fn protocol(&self) -> &'static str {
        if self.is_secure_endpoint() {
            "https:"
        } else {
            "http:"
        }
    }

    /// Admit a request: start creating its connection, or queue it while the
    /// pool is full. The outcome reaches `request` through its callbacks.
    pub fn add_request(&self, request: Arc<dyn RequestHandle>, destination: Destination) {
        self.inner.admit(request, destination);
    }

    /// Admit a request and wait for its connection
    pub async fn connect(&self, destination: Destination) -> Result<PooledConnection> {
        let (request, reply) = ConnectRequest::new(Some(destination.authority()));
        self.add_request(request, destination);
        reply
            .await
            .map_err(|_| AgentError::ConnectionReset("request abandoned".to_string()))?
    }

    /// Forcibly drop a slot from the pool, admitting the oldest waiting request
    pub fn remove_socket(&self, slot: SlotId) {
        self.inner.release_slot(slot);
    }

    /// Reserved plus live connections
    pub fn pool_size(&self) -> usize {
        self.inner.pool.lock().len()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pool.lock().pending_len()
    }
}

impl std::fmt::Debug for ConnectionAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionAgent")
            .field("config", &self.inner.config)
            .field("pool", &*self.inner.pool.lock())
            .finish()
    }
}

impl AgentInner {
    fn admit(self: &Arc<Self>, request: Arc<dyn RequestHandle>, destination: Destination) {
        let admitted = self.pool.lock().admit(PendingRequest {
            request,
            destination,
        });
        match admitted {
            Some((slot, pending)) => self.spawn_create(slot, pending),
            None => debug!("socket pool full, request queued"),
        }
    }

    fn spawn_create(self: &Arc<Self>, slot: SlotId, pending: PendingRequest) {
        let agent = self.clone();
        self.runtime
            .spawn(agent.create_socket(slot, pending.request, pending.destination));
    }

    /// Remove `slot` and hand any freed capacity to the oldest waiting request
    pub(crate) fn release_slot(self: &Arc<Self>, slot: SlotId) {
        let promoted = self.pool.lock().release(slot);
        if let Some((next, pending)) = promoted {
            debug!(slot = %next, "admitting queued request");
            self.spawn_create(next, pending);
        }
    }

    /// A released connection goes to the first waiting request for the same
    /// origin; without one it is closed and its slot freed.
    pub(crate) fn free_socket(
        self: &Arc<Self>,
        slot: SlotId,
        destination: Destination,
        stream: BoxedConnection,
    ) {
        loop {
            let matched = {
                let mut pool = self.pool.lock();
                if !pool.contains(slot) {
                    return;
                }
                pool.take_matching(&destination)
            };

            match matched {
                Some(pending) if pending.request.is_aborted() => {
                    pending.request.emit_error(AgentError::Aborted);
                }
                Some(pending) => {
                    debug!(slot = %slot, "reusing free socket");
                    let connection =
                        PooledConnection::new(slot, destination, stream, Arc::downgrade(self));
                    pending.request.on_socket(connection);
                    return;
                }
                None => {
                    drop(stream);
                    self.release_slot(slot);
                    return;
                }
            }
        }
    }

    #[instrument(skip_all, fields(slot = %slot, target = %destination.authority()))]
    async fn create_socket(
        self: Arc<Self>,
        slot: SlotId,
        request: Arc<dyn RequestHandle>,
        destination: Destination,
    ) {
        if request.is_aborted() {
            debug!("request aborted before connecting");
            self.release_slot(slot);
            request.emit_error(AgentError::Aborted);
            return;
        }

        let secure = self.config.secure_endpoint.unwrap_or(destination.secure);
        let decision = match &self.session {
            Some(session) => session.proxy_for_url(&destination.url(secure)).await,
            None => ProxyDecision::Direct,
        };

        let outcome = match decision {
            ProxyDecision::Direct => self.tunnels.connect_direct(&destination).await,
            ProxyDecision::Proxy(proxy) => {
                debug!(proxy = %proxy.address(), protocol = %proxy.protocol, "connecting via proxy");
                self.tunnels.establish(&proxy, &destination).await
            }
            ProxyDecision::Unavailable => TunnelOutcome::Failed(AgentError::NoProxy),
        };

        match outcome {
            TunnelOutcome::Connected(stream) => {
                self.install(slot, request, destination, stream, secure).await
            }
            TunnelOutcome::RetryNeeded(reason) => self.retry(slot, request, destination, reason),
            TunnelOutcome::Failed(error) => {
                warn!(error = %error, "connection failed");
                self.release_slot(slot);
                request.emit_error(error);
            }
        }
    }

    async fn install(
        self: &Arc<Self>,
        slot: SlotId,
        request: Arc<dyn RequestHandle>,
        destination: Destination,
        stream: BoxedConnection,
        secure: bool,
    ) {
        let stream = if secure {
            let server_name = self.server_name(request.as_ref(), &destination);
            match self.tunnels.transport().tls_wrap(stream, &server_name).await {
                Ok(stream) => stream,
                Err(error) => {
                    warn!(server_name = %server_name, error = %error, "TLS handshake failed");
                    self.release_slot(slot);
                    request.emit_error(error);
                    return;
                }
            }
        } else {
            stream
        };

        if !self.pool.lock().activate(slot) {
            debug!("slot removed while connecting");
            request.emit_error(AgentError::Aborted);
            return;
        }

        let connection = PooledConnection::new(slot, destination, stream, Arc::downgrade(self));
        request.on_socket(connection);
    }

    /// Free the slot, then let the session decide: an auth challenge may be
    /// taken over by a handler, anything else invalidates the proxy and
    /// re-admits the request.
    fn retry(
        self: &Arc<Self>,
        slot: SlotId,
        request: Arc<dyn RequestHandle>,
        destination: Destination,
        reason: RetryReason,
    ) {
        self.release_slot(slot);
        debug!(proxy = %reason.host(), "tunnel attempt needs a retry");

        let Some(session) = self.session.clone() else {
            request.emit_error(reason.into_error());
            return;
        };

        let retry = self.retry_token(request, destination);
        let (host, error) = match reason {
            RetryReason::AuthRequired { host, realm, error } => {
                let challenge = ProxyChallenge {
                    host: host.clone(),
                    realm,
                    retry: retry.clone(),
                };
                if session.offer_challenge(&challenge) {
                    return;
                }
                (host, error)
            }
            RetryReason::ProxyError { host, error } => (host, error),
        };

        warn!(proxy = %host, error = %error, "proxy failed, retrying");
        session.on_error(ProxyFailure { host, error, retry });
    }

    fn retry_token(
        self: &Arc<Self>,
        request: Arc<dyn RequestHandle>,
        destination: Destination,
    ) -> RetryToken {
        let agent = Arc::downgrade(self);
        RetryToken::new(move || {
            if let Some(agent) = agent.upgrade() {
                agent.admit(request, destination);
            }
        })
    }

    fn server_name(&self, request: &dyn RequestHandle, destination: &Destination) -> String {
        if let Some(name) = &self.config.tls_server_name {
            return name.clone();
        }
        request
            .header("host")
            .map(|host| strip_port(&host).to_string())
            .filter(|host| !host.is_empty())
            .unwrap_or_else(|| destination.host.clone())
    }
}

/// `example.com:443` → `example.com`, `[::1]:443` → `::1`
fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    host.split(':').next().unwrap_or(host)
}

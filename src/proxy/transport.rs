//! Network transport for the agent
//!
//! Raw TCP connects, TLS wrapping and hostname lookup sit behind traits so the
//! tunnel logic can run over in-memory streams in tests.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, instrument};

use crate::error::{AgentError, Result};
use crate::models::proxy::format_host_port;

/// Any bidirectional byte stream the agent can hand out
pub trait ProxyConnection: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> ProxyConnection for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub type BoxedConnection = Box<dyn ProxyConnection>;

/// Opens connections and upgrades them to TLS
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, host: &str, port: u16) -> Result<BoxedConnection>;

    async fn tls_wrap(&self, stream: BoxedConnection, server_name: &str) -> Result<BoxedConnection>;
}

/// TCP via tokio, TLS via rustls with the webpki root store
#[derive(Clone)]
pub struct TokioTransport {
    tls: TlsConnector,
    connect_timeout: Option<Duration>,
}

impl TokioTransport {
    pub fn new(connect_timeout: Option<Duration>) -> Self {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Self::with_tls_config(Arc::new(config), connect_timeout)
    }

    pub fn with_tls_config(config: Arc<ClientConfig>, connect_timeout: Option<Duration>) -> Self {
        Self {
            tls: TlsConnector::from(config),
            connect_timeout,
        }
    }
}

impl Default for TokioTransport {
    fn default() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl Transport for TokioTransport {
    #[instrument(skip(self))]
    async fn connect(&self, host: &str, port: u16) -> Result<BoxedConnection> {
        let addr = format_host_port(host, port);
        let connecting = TcpStream::connect(addr);
        let stream = match self.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, connecting)
                .await
                .map_err(|_| AgentError::Timeout)??,
            None => connecting.await?,
        };
        stream.set_nodelay(true)?;
        debug!("TCP connection established");
        Ok(Box::new(stream))
    }

    #[instrument(skip(self, stream))]
    async fn tls_wrap(&self, stream: BoxedConnection, server_name: &str) -> Result<BoxedConnection> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|e| AgentError::Tls(format!("invalid server name {}: {}", server_name, e)))?;
        let stream = self
            .tls
            .connect(name, stream)
            .await
            .map_err(|e| AgentError::Tls(e.to_string()))?;
        debug!("TLS handshake complete");
        Ok(Box::new(stream))
    }
}

/// Hostname lookup used for client-side SOCKS resolution
#[async_trait]
pub trait DnsResolver: Send + Sync {
    async fn lookup(&self, host: &str) -> Result<IpAddr>;
}

/// Resolver backed by the system resolver (`getaddrinfo`)
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDnsResolver;

#[async_trait]
impl DnsResolver for SystemDnsResolver {
    async fn lookup(&self, host: &str) -> Result<IpAddr> {
        let bare = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if let Ok(ip) = bare.parse::<IpAddr>() {
            return Ok(ip);
        }

        let dns_error = |reason: String| AgentError::Dns {
            host: host.to_string(),
            reason,
        };
        tokio::net::lookup_host((bare, 0))
            .await
            .map_err(|e| dns_error(e.to_string()))?
            .map(|addr| addr.ip())
            .next()
            .ok_or_else(|| dns_error("no addresses".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tokio_transport_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"hello").await.unwrap();
        });

        let transport = TokioTransport::new(Some(Duration::from_secs(2)));
        let mut stream = transport.connect("127.0.0.1", addr.port()).await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_tokio_transport_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = TokioTransport::default()
            .connect("127.0.0.1", port)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AgentError::Io(_)));
    }

    #[tokio::test]
    async fn test_tls_wrap_rejects_bad_server_name() {
        let (client, _server) = tokio::io::duplex(64);
        let err = TokioTransport::default()
            .tls_wrap(Box::new(client), "not a hostname")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AgentError::Tls(_)));
    }

    #[tokio::test]
    async fn test_system_dns_literals() {
        let resolver = SystemDnsResolver;
        assert_eq!(
            resolver.lookup("10.1.2.3").await.unwrap(),
            "10.1.2.3".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            resolver.lookup("[::1]").await.unwrap(),
            "::1".parse::<IpAddr>().unwrap()
        );
        assert!(resolver.lookup("localhost").await.is_ok());
    }
}

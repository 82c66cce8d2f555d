//! Tunnel establishment through a chosen proxy
//!
//! Produces a byte stream to the destination, either directly, through an
//! HTTP CONNECT proxy, or through a SOCKS4/4a/5 proxy. Failures that another
//! proxy might not share are reported as [`TunnelOutcome::RetryNeeded`] so the
//! caller can invalidate the proxy and try again.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, LazyLock};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_socks::tcp::{Socks4Stream, Socks5Stream};
use tracing::{debug, instrument, warn};

use crate::error::{AgentError, Result};
use crate::models::{Destination, ProxyDescriptor, ProxyProtocol, SocksVersion};
use crate::proxy::transport::{BoxedConnection, DnsResolver, Transport};

/// Upper bound on a CONNECT response head
const MAX_RESPONSE_HEAD: usize = 8192;

static REALM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"realm="([^"]*)""#).expect("realm pattern"));

/// Why an attempt should be retried with fresh proxy resolution
#[derive(Debug)]
pub enum RetryReason {
    /// The proxy wants credentials; `error` is reported if nobody supplies them
    AuthRequired {
        host: String,
        realm: String,
        error: AgentError,
    },
    /// The proxy failed; another candidate may work
    ProxyError { host: String, error: AgentError },
}

impl RetryReason {
    pub fn host(&self) -> &str {
        match self {
            RetryReason::AuthRequired { host, .. } | RetryReason::ProxyError { host, .. } => host,
        }
    }

    pub fn into_error(self) -> AgentError {
        match self {
            RetryReason::AuthRequired { error, .. } | RetryReason::ProxyError { error, .. } => error,
        }
    }
}

pub enum TunnelOutcome {
    Connected(BoxedConnection),
    RetryNeeded(RetryReason),
    Failed(AgentError),
}

impl std::fmt::Debug for TunnelOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelOutcome::Connected(_) => f.write_str("Connected"),
            TunnelOutcome::RetryNeeded(reason) => f.debug_tuple("RetryNeeded").field(reason).finish(),
            TunnelOutcome::Failed(e) => f.debug_tuple("Failed").field(e).finish(),
        }
    }
}

/// Parsed CONNECT response head
#[derive(Debug)]
struct ResponseHead {
    status: u16,
    headers: Vec<(String, String)>,
    /// Bytes received after the blank line
    trailing: usize,
}

impl ResponseHead {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Opens tunnels over a [`Transport`]
#[derive(Clone)]
pub struct TunnelEstablisher {
    transport: Arc<dyn Transport>,
    dns: Arc<dyn DnsResolver>,
}

impl TunnelEstablisher {
    pub fn new(transport: Arc<dyn Transport>, dns: Arc<dyn DnsResolver>) -> Self {
        Self { transport, dns }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Reach `destination` through `proxy`, dispatching on its protocol
    pub async fn establish(&self, proxy: &ProxyDescriptor, destination: &Destination) -> TunnelOutcome {
        match proxy.protocol {
            ProxyProtocol::Direct => self.connect_direct(destination).await,
            protocol if protocol.is_http() => self.connect_http(proxy, destination).await,
            _ => self.connect_socks(proxy, destination).await,
        }
    }

    #[instrument(skip(self), fields(target = %destination.authority()))]
    pub async fn connect_direct(&self, destination: &Destination) -> TunnelOutcome {
        match self.transport.connect(&destination.host, destination.port).await {
            Ok(stream) => TunnelOutcome::Connected(stream),
            Err(e) => TunnelOutcome::Failed(e),
        }
    }

    /// Open an HTTP CONNECT tunnel
    #[instrument(skip(self, proxy), fields(proxy = %proxy.address(), target = %destination.authority()))]
    pub async fn connect_http(&self, proxy: &ProxyDescriptor, destination: &Destination) -> TunnelOutcome {
        // An HTTP proxy that cannot be reached fails the request without
        // invalidation. Only a proxy that answered badly is failed over.
        // SOCKS proxies differ: an unreachable one is retried on the next
        // candidate.
        let mut stream = match self.transport.connect(&proxy.host, proxy.port).await {
            Ok(stream) => stream,
            Err(e) => return TunnelOutcome::Failed(AgentError::ConnectionReset(e.to_string())),
        };

        if proxy.protocol == ProxyProtocol::Https {
            stream = match self.transport.tls_wrap(stream, &proxy.host).await {
                Ok(stream) => stream,
                Err(e) => return TunnelOutcome::Failed(AgentError::ConnectionReset(e.to_string())),
            };
        }

        let request = build_connect_request(proxy, destination);
        if let Err(e) = stream.write_all(request.as_bytes()).await {
            return TunnelOutcome::Failed(AgentError::ConnectionReset(e.to_string()));
        }

        let raw = match read_response_head(&mut stream).await {
            Ok(raw) => raw,
            Err(e) => return TunnelOutcome::Failed(e),
        };

        let head = match parse_response_head(&raw) {
            Ok(head) => head,
            Err(e) => {
                return TunnelOutcome::RetryNeeded(RetryReason::ProxyError {
                    host: proxy.host.clone(),
                    error: e,
                })
            }
        };

        match head.status {
            200 if head.trailing == 0 => {
                debug!("HTTP CONNECT tunnel established");
                TunnelOutcome::Connected(stream)
            }
            200 => {
                warn!(trailing = head.trailing, "proxy sent data after CONNECT response");
                TunnelOutcome::RetryNeeded(RetryReason::ProxyError {
                    host: proxy.host.clone(),
                    error: AgentError::IllegalResponseBody,
                })
            }
            407 => {
                let realm = head
                    .header("proxy-authenticate")
                    .and_then(extract_realm)
                    .unwrap_or_else(|| proxy.host.clone());
                debug!(realm = %realm, "proxy requires authentication");
                TunnelOutcome::RetryNeeded(RetryReason::AuthRequired {
                    host: proxy.host.clone(),
                    realm,
                    error: AgentError::TunnelStatus { status: 407 },
                })
            }
            status => {
                debug!(status, "CONNECT rejected");
                TunnelOutcome::RetryNeeded(RetryReason::ProxyError {
                    host: proxy.host.clone(),
                    error: AgentError::TunnelStatus { status },
                })
            }
        }
    }

    /// Open a SOCKS tunnel, resolving the destination locally when the protocol requires it
    #[instrument(skip(self, proxy), fields(proxy = %proxy.address(), target = %destination.authority()))]
    pub async fn connect_socks(&self, proxy: &ProxyDescriptor, destination: &Destination) -> TunnelOutcome {
        let Some(params) = proxy.protocol.socks_params() else {
            return TunnelOutcome::Failed(AgentError::UnsupportedProtocol(
                proxy.protocol.to_string(),
            ));
        };

        let target_ip = if params.client_dns {
            match self.dns.lookup(&destination.host).await {
                Ok(ip) => Some(ip),
                Err(e) => return TunnelOutcome::Failed(e),
            }
        } else {
            None
        };

        let socket = match self.transport.connect(&proxy.host, proxy.port).await {
            Ok(socket) => socket,
            Err(e) => {
                return TunnelOutcome::RetryNeeded(RetryReason::ProxyError {
                    host: proxy.host.clone(),
                    error: AgentError::ConnectionReset(e.to_string()),
                })
            }
        };

        let result = match params.version {
            SocksVersion::V4 => socks4_handshake(socket, proxy, destination, target_ip).await,
            SocksVersion::V5 => socks5_handshake(socket, proxy, destination, target_ip).await,
        };

        match result {
            Ok(stream) => {
                debug!("SOCKS connection established");
                TunnelOutcome::Connected(stream)
            }
            Err(e) if is_socks_auth_failure(&e) => {
                TunnelOutcome::RetryNeeded(RetryReason::AuthRequired {
                    host: proxy.host.clone(),
                    realm: proxy.host.clone(),
                    error: AgentError::Socks(e),
                })
            }
            Err(e) => TunnelOutcome::RetryNeeded(RetryReason::ProxyError {
                host: proxy.host.clone(),
                error: AgentError::Socks(e),
            }),
        }
    }
}

impl std::fmt::Debug for TunnelEstablisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelEstablisher").finish_non_exhaustive()
    }
}

async fn socks4_handshake(
    socket: BoxedConnection,
    proxy: &ProxyDescriptor,
    destination: &Destination,
    target_ip: Option<IpAddr>,
) -> std::result::Result<BoxedConnection, tokio_socks::Error> {
    let user_id = proxy
        .credentials
        .as_ref()
        .map(|c| c.username.as_str())
        .filter(|u| !u.is_empty());

    let stream = match (target_ip, user_id) {
        (Some(ip), Some(user)) => {
            let target = SocketAddr::new(ip, destination.port);
            Socks4Stream::connect_with_userid_and_socket(socket, target, user).await?
        }
        (Some(ip), None) => {
            Socks4Stream::connect_with_socket(socket, SocketAddr::new(ip, destination.port)).await?
        }
        (None, Some(user)) => {
            Socks4Stream::connect_with_userid_and_socket(
                socket,
                (destination.host.as_str(), destination.port),
                user,
            )
            .await?
        }
        (None, None) => {
            Socks4Stream::connect_with_socket(socket, (destination.host.as_str(), destination.port))
                .await?
        }
    };
    Ok(Box::new(stream.into_inner()))
}

async fn socks5_handshake(
    socket: BoxedConnection,
    proxy: &ProxyDescriptor,
    destination: &Destination,
    target_ip: Option<IpAddr>,
) -> std::result::Result<BoxedConnection, tokio_socks::Error> {
    let auth = proxy
        .credentials
        .as_ref()
        .filter(|c| !c.username.is_empty() && !c.password.is_empty());

    let stream = match (target_ip, auth) {
        (Some(ip), Some(creds)) => {
            Socks5Stream::connect_with_password_and_socket(
                socket,
                SocketAddr::new(ip, destination.port),
                &creds.username,
                &creds.password,
            )
            .await?
        }
        (Some(ip), None) => {
            Socks5Stream::connect_with_socket(socket, SocketAddr::new(ip, destination.port)).await?
        }
        (None, Some(creds)) => {
            Socks5Stream::connect_with_password_and_socket(
                socket,
                (destination.host.as_str(), destination.port),
                &creds.username,
                &creds.password,
            )
            .await?
        }
        (None, None) => {
            Socks5Stream::connect_with_socket(socket, (destination.host.as_str(), destination.port))
                .await?
        }
    };
    Ok(Box::new(stream.into_inner()))
}

fn is_socks_auth_failure(error: &tokio_socks::Error) -> bool {
    matches!(
        error,
        tokio_socks::Error::PasswordAuthFailure(_) | tokio_socks::Error::NoAcceptableAuthMethods
    )
}

/// Build the CONNECT request head, with Basic proxy auth when credentials are known
fn build_connect_request(proxy: &ProxyDescriptor, destination: &Destination) -> String {
    let authority = destination.authority();
    let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", authority, authority);

    if let Some(auth) = proxy.credentials.as_ref().and_then(|c| c.auth_string()) {
        request.push_str(&format!(
            "Proxy-Authorization: Basic {}\r\n",
            BASE64.encode(auth.as_bytes())
        ));
    }

    request.push_str("\r\n");
    request
}

/// Read until the blank line ending the response head
async fn read_response_head(stream: &mut BoxedConnection) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; MAX_RESPONSE_HEAD];
    let mut pos = 0;

    loop {
        let n = stream
            .read(&mut buf[pos..])
            .await
            .map_err(|e| AgentError::ConnectionReset(e.to_string()))?;
        if n == 0 {
            return Err(AgentError::ConnectionReset("socket hang up".to_string()));
        }
        pos += n;

        if find_head_end(&buf[..pos]).is_some() {
            buf.truncate(pos);
            return Ok(buf);
        }
        if pos == buf.len() {
            return Err(AgentError::ConnectionReset(
                "proxy response head too long".to_string(),
            ));
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

fn parse_response_head(raw: &[u8]) -> Result<ResponseHead> {
    let end = find_head_end(raw)
        .ok_or_else(|| AgentError::Http("incomplete response head".to_string()))?;
    let text = String::from_utf8_lossy(&raw[..end]);
    let mut lines = text.split("\r\n");

    let status_line = lines.next().unwrap_or_default();
    let mut parts = status_line.split_whitespace();
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(AgentError::Http(format!("malformed status line: {}", status_line)));
    }
    let status = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| AgentError::Http(format!("malformed status line: {}", status_line)))?;

    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect();

    Ok(ResponseHead {
        status,
        headers,
        trailing: raw.len() - end,
    })
}

fn extract_realm(challenge: &str) -> Option<String> {
    REALM_RE
        .captures(challenge)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Credentials;
    use crate::proxy::transport::SystemDnsResolver;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::io::{duplex, DuplexStream};

    /// Hands out the client half of a prepared duplex pipe
    struct PipeTransport {
        client: Mutex<Option<DuplexStream>>,
    }

    impl PipeTransport {
        fn new() -> (Arc<Self>, DuplexStream) {
            let (client, server) = duplex(16 * 1024);
            let transport = Arc::new(Self {
                client: Mutex::new(Some(client)),
            });
            (transport, server)
        }
    }

    #[async_trait]
    impl Transport for PipeTransport {
        async fn connect(&self, _host: &str, _port: u16) -> Result<BoxedConnection> {
            match self.client.lock().take() {
                Some(stream) => Ok(Box::new(stream)),
                None => Err(AgentError::Io(std::io::ErrorKind::ConnectionRefused.into())),
            }
        }

        async fn tls_wrap(&self, stream: BoxedConnection, _server_name: &str) -> Result<BoxedConnection> {
            Ok(stream)
        }
    }

    fn establisher(transport: Arc<PipeTransport>) -> TunnelEstablisher {
        TunnelEstablisher::new(transport, Arc::new(SystemDnsResolver))
    }

    /// Answer one CONNECT request with `response`, returning the request text
    fn serve_connect(
        mut server: DuplexStream,
        response: &'static [u8],
    ) -> tokio::task::JoinHandle<(String, DuplexStream)> {
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let mut pos = 0;
            while find_head_end(&buf[..pos]).is_none() {
                let n = server.read(&mut buf[pos..]).await.unwrap();
                assert!(n > 0);
                pos += n;
            }
            server.write_all(response).await.unwrap();
            (String::from_utf8_lossy(&buf[..pos]).to_string(), server)
        })
    }

    fn http_proxy() -> ProxyDescriptor {
        ProxyDescriptor::new(ProxyProtocol::Http, "proxy.local", 3128)
    }

    fn destination() -> Destination {
        Destination::new("example.com", 443, true)
    }

    #[test]
    fn test_build_connect_request() {
        let request = build_connect_request(&http_proxy(), &destination());
        assert_eq!(
            request,
            "CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n"
        );

        let proxy = http_proxy().with_credentials(Credentials::new("user", "pass"));
        let request = build_connect_request(&proxy, &Destination::new("::1", 8443, true));
        assert!(request.starts_with("CONNECT [::1]:8443 HTTP/1.1\r\n"));
        assert!(request.contains("Proxy-Authorization: Basic dXNlcjpwYXNz\r\n"));

        let proxy = http_proxy().with_credentials(Credentials::new("user", ""));
        let request = build_connect_request(&proxy, &destination());
        assert!(request.contains("Proxy-Authorization: Basic dXNlcg==\r\n"));
    }

    #[test]
    fn test_parse_response_head() {
        let head = parse_response_head(
            b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"corp\"\r\n\r\n",
        )
        .unwrap();
        assert_eq!(head.status, 407);
        assert_eq!(head.trailing, 0);
        assert_eq!(
            head.header("proxy-authenticate").and_then(extract_realm),
            Some("corp".to_string())
        );

        let head = parse_response_head(b"HTTP/1.0 200 OK\r\n\r\nextra").unwrap();
        assert_eq!(head.status, 200);
        assert_eq!(head.trailing, 5);

        assert!(parse_response_head(b"SSH-2.0-OpenSSH\r\n\r\n").is_err());
    }

    #[test]
    fn test_extract_realm() {
        assert_eq!(extract_realm(r#"Basic realm="""#), Some(String::new()));
        assert_eq!(extract_realm("Negotiate"), None);
    }

    #[tokio::test]
    async fn test_connect_http_established() {
        let (transport, server) = PipeTransport::new();
        let proxy_task = serve_connect(server, b"HTTP/1.1 200 Connection Established\r\n\r\n");

        let proxy = http_proxy().with_credentials(Credentials::new("user", "pass"));
        let outcome = establisher(transport).connect_http(&proxy, &destination()).await;
        let TunnelOutcome::Connected(mut stream) = outcome else {
            panic!("expected a tunnel, got {:?}", outcome);
        };

        let (request, mut server) = proxy_task.await.unwrap();
        assert!(request.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
        assert!(request.contains("Proxy-Authorization: Basic "));

        stream.write_all(b"ping").await.unwrap();
        let mut out = [0u8; 4];
        server.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"ping");
    }

    #[tokio::test]
    async fn test_connect_http_auth_required() {
        let (transport, server) = PipeTransport::new();
        let _proxy_task = serve_connect(
            server,
            b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"corp proxy\"\r\n\r\n",
        );

        let outcome = establisher(transport).connect_http(&http_proxy(), &destination()).await;
        match outcome {
            TunnelOutcome::RetryNeeded(RetryReason::AuthRequired { host, realm, error }) => {
                assert_eq!(host, "proxy.local");
                assert_eq!(realm, "corp proxy");
                assert!(matches!(error, AgentError::TunnelStatus { status: 407 }));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_http_auth_realm_defaults_to_host() {
        let (transport, server) = PipeTransport::new();
        let _proxy_task = serve_connect(server, b"HTTP/1.1 407 Denied\r\n\r\n");

        let outcome = establisher(transport).connect_http(&http_proxy(), &destination()).await;
        match outcome {
            TunnelOutcome::RetryNeeded(RetryReason::AuthRequired { realm, .. }) => {
                assert_eq!(realm, "proxy.local");
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_http_rejected_status() {
        let (transport, server) = PipeTransport::new();
        let _proxy_task = serve_connect(server, b"HTTP/1.1 502 Bad Gateway\r\n\r\n");

        let outcome = establisher(transport).connect_http(&http_proxy(), &destination()).await;
        match outcome {
            TunnelOutcome::RetryNeeded(reason) => {
                assert_eq!(reason.host(), "proxy.local");
                let error = reason.into_error();
                assert!(matches!(error, AgentError::TunnelStatus { status: 502 }));
                assert_eq!(
                    error.to_string(),
                    "tunneling socket could not be established, statusCode=502"
                );
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_http_illegal_body() {
        let (transport, server) = PipeTransport::new();
        let _proxy_task = serve_connect(server, b"HTTP/1.1 200 OK\r\n\r\nsurprise");

        let outcome = establisher(transport).connect_http(&http_proxy(), &destination()).await;
        match outcome {
            TunnelOutcome::RetryNeeded(RetryReason::ProxyError { error, .. }) => {
                assert!(matches!(error, AgentError::IllegalResponseBody));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_http_eof_fails() {
        let (transport, server) = PipeTransport::new();
        drop(server);

        let outcome = establisher(transport).connect_http(&http_proxy(), &destination()).await;
        match outcome {
            TunnelOutcome::Failed(error) => assert!(error.is_connection_reset()),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_http_proxy_unreachable_fails() {
        let (transport, _server) = PipeTransport::new();
        transport.client.lock().take();

        let outcome = establisher(transport).connect_http(&http_proxy(), &destination()).await;
        assert!(matches!(
            outcome,
            TunnelOutcome::Failed(AgentError::ConnectionReset(_))
        ));
    }

    #[tokio::test]
    async fn test_socks5_auth_rejection_is_challenge() {
        let (transport, mut server) = PipeTransport::new();
        let proxy_task = tokio::spawn(async move {
            let mut header = [0u8; 2];
            server.read_exact(&mut header).await.unwrap();
            let mut methods = vec![0u8; header[1] as usize];
            server.read_exact(&mut methods).await.unwrap();
            assert!(methods.contains(&0x02));
            server.write_all(&[0x05, 0x02]).await.unwrap();

            let mut auth_head = [0u8; 2];
            server.read_exact(&mut auth_head).await.unwrap();
            let mut uname = vec![0u8; auth_head[1] as usize];
            server.read_exact(&mut uname).await.unwrap();
            let mut plen = [0u8; 1];
            server.read_exact(&mut plen).await.unwrap();
            let mut passwd = vec![0u8; plen[0] as usize];
            server.read_exact(&mut passwd).await.unwrap();

            // Reject.
            server.write_all(&[0x01, 0x01]).await.unwrap();
        });

        let proxy = ProxyDescriptor::new(ProxyProtocol::Socks5h, "socks.local", 1080)
            .with_credentials(Credentials::new("user", "wrong"));
        let outcome = establisher(transport).connect_socks(&proxy, &destination()).await;
        match outcome {
            TunnelOutcome::RetryNeeded(RetryReason::AuthRequired { host, realm, .. }) => {
                assert_eq!(host, "socks.local");
                assert_eq!(realm, "socks.local");
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        proxy_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_socks_dns_failure_fails() {
        struct NoDns;

        #[async_trait]
        impl DnsResolver for NoDns {
            async fn lookup(&self, host: &str) -> Result<IpAddr> {
                Err(AgentError::Dns {
                    host: host.to_string(),
                    reason: "NXDOMAIN".to_string(),
                })
            }
        }

        let (transport, _server) = PipeTransport::new();
        let establisher = TunnelEstablisher::new(transport, Arc::new(NoDns));
        let proxy = ProxyDescriptor::new(ProxyProtocol::Socks5, "socks.local", 1080);
        let outcome = establisher.connect_socks(&proxy, &destination()).await;
        assert!(matches!(outcome, TunnelOutcome::Failed(AgentError::Dns { .. })));
    }

    #[tokio::test]
    async fn test_socks4_sends_resolved_address() {
        let (transport, mut server) = PipeTransport::new();
        let proxy_task = tokio::spawn(async move {
            // VN, CD, DSTPORT, DSTIP, USERID, NUL
            let mut head = [0u8; 8];
            server.read_exact(&mut head).await.unwrap();
            assert_eq!(head[0], 0x04);
            assert_eq!(head[1], 0x01);
            assert_eq!(u16::from_be_bytes([head[2], head[3]]), 443);
            assert_eq!(&head[4..8], &[127, 0, 0, 1]);

            let mut user = Vec::new();
            loop {
                let b = server.read_u8().await.unwrap();
                if b == 0 {
                    break;
                }
                user.push(b);
            }
            assert_eq!(user, b"alice");

            server
                .write_all(&[0x00, 0x5a, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
            server
        });

        let proxy = ProxyDescriptor::new(ProxyProtocol::Socks4, "socks.local", 1080)
            .with_credentials(Credentials::new("alice", ""));
        let outcome = establisher(transport)
            .connect_socks(&proxy, &Destination::new("127.0.0.1", 443, true))
            .await;
        assert!(matches!(outcome, TunnelOutcome::Connected(_)), "{:?}", outcome);
        proxy_task.await.unwrap();
    }
}

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Proxy protocol type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    /// PAC `DIRECT` candidate
    Direct,
    Http,
    Https,
    /// Bare `socks`, treated as SOCKS5 with proxy-side DNS
    Socks,
    Socks4,
    Socks4a,
    Socks5,
    Socks5h,
}

impl ProxyProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyProtocol::Direct => "direct",
            ProxyProtocol::Http => "http",
            ProxyProtocol::Https => "https",
            ProxyProtocol::Socks => "socks",
            ProxyProtocol::Socks4 => "socks4",
            ProxyProtocol::Socks4a => "socks4a",
            ProxyProtocol::Socks5 => "socks5",
            ProxyProtocol::Socks5h => "socks5h",
        }
    }

    /// Parse a protocol name; a trailing `:` (URL scheme form) is accepted
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim_end_matches(':').to_lowercase().as_str() {
            "direct" => Some(ProxyProtocol::Direct),
            "http" => Some(ProxyProtocol::Http),
            "https" => Some(ProxyProtocol::Https),
            "socks" => Some(ProxyProtocol::Socks),
            "socks4" => Some(ProxyProtocol::Socks4),
            "socks4a" => Some(ProxyProtocol::Socks4a),
            "socks5" => Some(ProxyProtocol::Socks5),
            "socks5h" => Some(ProxyProtocol::Socks5h),
            _ => None,
        }
    }

    pub fn is_socks(&self) -> bool {
        matches!(
            self,
            ProxyProtocol::Socks
                | ProxyProtocol::Socks4
                | ProxyProtocol::Socks4a
                | ProxyProtocol::Socks5
                | ProxyProtocol::Socks5h
        )
    }

    pub fn is_http(&self) -> bool {
        matches!(self, ProxyProtocol::Http | ProxyProtocol::Https)
    }

    /// Port used when a proxy address does not carry one
    pub fn default_port(&self) -> u16 {
        if self.is_socks() {
            1080
        } else {
            8080
        }
    }

    /// SOCKS wire parameters: whether the client must resolve the destination
    /// itself, and the protocol version spoken to the proxy.
    pub fn socks_params(&self) -> Option<SocksParams> {
        let (client_dns, version) = match self {
            ProxyProtocol::Socks4 => (true, SocksVersion::V4),
            ProxyProtocol::Socks4a => (false, SocksVersion::V4),
            ProxyProtocol::Socks5 => (true, SocksVersion::V5),
            ProxyProtocol::Socks5h | ProxyProtocol::Socks => (false, SocksVersion::V5),
            _ => return None,
        };
        Some(SocksParams {
            client_dns,
            version,
        })
    }
}

impl std::fmt::Display for ProxyProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksVersion {
    V4,
    V5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocksParams {
    pub client_dns: bool,
    pub version: SocksVersion,
}

/// Username/password pair for a proxy host
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.username.is_empty()
    }

    /// `user:pass`, or just `user` when there is no password
    pub fn auth_string(&self) -> Option<String> {
        if self.username.is_empty() {
            return None;
        }
        if self.password.is_empty() {
            Some(self.username.clone())
        } else {
            Some(format!("{}:{}", self.username, self.password))
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &if self.password.is_empty() { "" } else { "***" })
            .finish()
    }
}

static PROXY_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^((?P<protocol>\w+)://)?((?P<username>[^:@/\s]+)(:(?P<password>[^@\s]+))?@)?(\[(?P<host6>[^\]\s/@]+)\]|(?P<host>[^:/\s@\[\]]+))(:(?P<port>\d+))?",
    )
    .expect("proxy url pattern")
});

/// A proxy chosen for a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyDescriptor {
    pub protocol: ProxyProtocol,
    pub host: String,
    pub port: u16,
    pub credentials: Option<Credentials>,
}

impl ProxyDescriptor {
    pub fn new(protocol: ProxyProtocol, host: impl Into<String>, port: u16) -> Self {
        Self {
            protocol,
            host: host.into(),
            port,
            credentials: None,
        }
    }

    /// The `DIRECT` candidate
    pub fn direct() -> Self {
        Self::new(ProxyProtocol::Direct, "", 0)
    }

    pub fn is_direct(&self) -> bool {
        self.protocol == ProxyProtocol::Direct
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = if credentials.is_empty() {
            None
        } else {
            Some(credentials)
        };
        self
    }

    /// Parse `[scheme://][user[:pass]@]host[:port]`.
    ///
    /// A missing scheme means `http`, a missing port means the protocol's
    /// default port. IPv6 hosts must be bracketed and are stored without the
    /// brackets. Returns `None` for unknown schemes or unparsable input.
    pub fn parse(input: &str) -> Option<Self> {
        let caps = PROXY_URL_RE.captures(input.trim())?;

        let protocol = match caps.name("protocol") {
            Some(p) => ProxyProtocol::from_str(p.as_str())?,
            None => ProxyProtocol::Http,
        };
        let host = caps
            .name("host6")
            .or_else(|| caps.name("host"))?
            .as_str()
            .to_string();
        let port = match caps.name("port") {
            Some(p) => p.as_str().parse().ok()?,
            None => protocol.default_port(),
        };

        let credentials = caps.name("username").map(|u| {
            Credentials::new(
                u.as_str(),
                caps.name("password").map(|p| p.as_str()).unwrap_or(""),
            )
        });

        Some(Self {
            protocol,
            host,
            port,
            credentials,
        })
    }

    /// `host:port`, bracketing IPv6 literals
    pub fn address(&self) -> String {
        format_host_port(&self.host, self.port)
    }
}

/// Where a request wants to go
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub host: String,
    pub port: u16,
    pub secure: bool,
}

impl Destination {
    pub fn new(host: impl Into<String>, port: u16, secure: bool) -> Self {
        Self {
            host: host.into(),
            port,
            secure,
        }
    }

    /// Build a destination from an absolute URL, defaulting the port from the scheme
    pub fn from_url(url: &url::Url) -> Option<Self> {
        let secure = url.scheme() == "https";
        let host = url.host_str()?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        let port = url.port_or_known_default()?;
        Some(Self::new(host, port, secure))
    }

    /// `host:port` as used for the CONNECT request line and `Host` header
    pub fn authority(&self) -> String {
        format_host_port(&self.host, self.port)
    }

    /// URL handed to the proxy resolver for this destination
    pub fn url(&self, secure: bool) -> String {
        let scheme = if secure { "https" } else { "http" };
        format!("{}://{}", scheme, self.authority())
    }

    pub fn same_origin(&self, other: &Destination) -> bool {
        self.host == other.host && self.port == other.port
    }
}

pub(crate) fn format_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

use thiserror::Error;

/// Unified error type for the tunnel agent
#[derive(Error, Debug)]
pub enum AgentError {
    // Connection errors
    #[error("socket hang up")]
    Aborted,

    #[error("tunneling socket could not be established, cause={0}")]
    ConnectionReset(String),

    #[error("tunneling socket could not be established, cause=No proxy")]
    NoProxy,

    #[error("tunneling socket could not be established, statusCode={status}")]
    TunnelStatus { status: u16 },

    #[error("got illegal response body from proxy")]
    IllegalResponseBody,

    // Proxy protocol errors
    #[error("SOCKS error: {0}")]
    Socks(#[from] tokio_socks::Error),

    #[error("Invalid proxy address: {0}")]
    InvalidProxyAddress(String),

    #[error("Unsupported proxy protocol: {0}")]
    UnsupportedProtocol(String),

    // Resolution errors
    #[error("DNS lookup failed for {host}: {reason}")]
    Dns { host: String, reason: String },

    #[error("PAC unavailable: {0}")]
    Pac(String),

    #[error("TLS error: {0}")]
    Tls(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Operation timed out")]
    Timeout,

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

impl AgentError {
    /// Error code reported to the HTTP client, in the style of socket errno names
    pub fn code(&self) -> &'static str {
        match self {
            AgentError::Aborted
            | AgentError::ConnectionReset(_)
            | AgentError::NoProxy
            | AgentError::TunnelStatus { .. }
            | AgentError::IllegalResponseBody
            | AgentError::Socks(_) => "ECONNRESET",

            AgentError::Dns { .. } => "ENOTFOUND",

            AgentError::Timeout => "ETIMEDOUT",

            AgentError::Io(e) => match e.kind() {
                std::io::ErrorKind::ConnectionRefused => "ECONNREFUSED",
                std::io::ErrorKind::TimedOut => "ETIMEDOUT",
                _ => "ECONNRESET",
            },

            AgentError::InvalidProxyAddress(_)
            | AgentError::UnsupportedProtocol(_)
            | AgentError::InvalidConfig(_)
            | AgentError::InvalidUrl(_) => "EINVAL",

            AgentError::Pac(_)
            | AgentError::Tls(_)
            | AgentError::Http(_)
            | AgentError::Internal(_) => "EPROTO",
        }
    }

    /// Check if the request should see this as a reset connection
    pub fn is_connection_reset(&self) -> bool {
        self.code() == "ECONNRESET"
    }
}

// Convert from hyper errors
impl From<hyper::Error> for AgentError {
    fn from(err: hyper::Error) -> Self {
        AgentError::Http(err.to_string())
    }
}

impl From<hyper_util::client::legacy::Error> for AgentError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        AgentError::Http(err.to_string())
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for AgentError {
    fn from(err: url::ParseError) -> Self {
        AgentError::InvalidUrl(err.to_string())
    }
}

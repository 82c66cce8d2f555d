//! Proxy selection and tunneling
//!
//! This module provides everything between "a request wants host:port" and
//! "here is a byte stream to it":
//! - Proxy discovery (manual, per-protocol, list, PAC)
//! - Bypass rules
//! - Credential caching and proxy validity tracking
//! - HTTP CONNECT and SOCKS tunnel establishment

pub mod bypass;
pub mod credentials;
pub mod resolver;
pub mod session;
pub mod transport;
pub mod tunnel;

pub use bypass::{BypassList, BypassRules};
pub use credentials::{CredentialLookup, CredentialStore, NoCredentials};
pub use resolver::{discover_proxy, ProxyResolver};
pub use session::{
    InvalidationPolicy, ProxyChallenge, ProxyDecision, ProxyFailure, ProxySession, RetryToken,
};
pub use transport::{
    BoxedConnection, DnsResolver, ProxyConnection, SystemDnsResolver, TokioTransport, Transport,
};
pub use tunnel::{RetryReason, TunnelEstablisher, TunnelOutcome};

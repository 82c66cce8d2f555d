//! Tunnelagent - proxy-aware connection agent
//!
//! Opens outbound connections for HTTP clients, choosing per request whether
//! to go direct or through a proxy.
//!
//! ## Features
//!
//! - Manual, per-protocol, list and PAC proxy configuration with bypass rules
//! - HTTP CONNECT tunnels (with Basic proxy auth) and SOCKS4, SOCKS4a, SOCKS5
//! - TLS to the destination with SNI taken from the request's `Host` header
//! - Bounded connection pool with FIFO admission and same-origin reuse
//! - Failed proxies are invalidated and the request retried on the next one
//! - Proxy authentication challenges handed to registered handlers

pub mod agent;
pub mod config;
pub mod error;
pub mod models;
pub mod proxy;

pub use agent::{ConnectRequest, ConnectionAgent, PooledConnection, RequestHandle, SlotId};
pub use config::{AgentConfig, Config, ProxyConfig, ProxyMode};
pub use error::{AgentError, Result};
pub use proxy::{ProxyDecision, ProxySession};

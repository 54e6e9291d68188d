//! Tunnel client exposing a local HTTP server through the tunnel server.
//!
//! Provides a persistent WebSocket connection with automatic reconnection,
//! keepalive pings, subdomain takeover and request proxying, with
//! optional shadow traffic to a second local server.

pub mod client;
pub mod config;
pub mod error;
mod handler;
mod heartbeat;
pub mod hooks;
pub mod proxy;
mod session;
pub mod shadow;
pub mod transport;

#[cfg(test)]
mod test_helpers;

pub use client::TunnelClient;
pub use config::{KeepAliveConfig, ReconnectPolicy, ShadowConfig, TunnelConfig};
pub use error::TunnelClientError;
pub use hooks::{NoopHooks, RequestInfo, TunnelHooks};
pub use proxy::{ProxyOutcome, RequestProxy};
pub use session::{SessionState, extract_subdomain};
pub use shadow::{Differences, ResponseSummary, ShadowDiff};

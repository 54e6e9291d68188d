//! Outray Client Library
//!
//! Keeps a local HTTP server reachable on a public URL:
//! - Persistent WebSocket connection to the tunnel server
//! - Reconnection with exponential backoff and subdomain takeover
//! - Keepalive pings to detect silently dead connections
//! - Proxying of tunneled requests to the local server
//! - Optional shadow traffic to a second local server

pub mod tunnel;

pub use tunnel::{
    NoopHooks, RequestInfo, SessionState, ShadowConfig, ShadowDiff, TunnelClient,
    TunnelClientError, TunnelConfig, TunnelHooks,
};

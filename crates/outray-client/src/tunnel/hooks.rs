//! Observer hooks for the embedding application.
//!
//! Every hook is a best-effort notification invoked from whichever task
//! detects the event. The session lock is never held while a hook runs, but
//! a slow hook still delays that task, so implementations should return
//! quickly.

use std::time::Duration;

use super::shadow::ShadowDiff;

/// Outcome of one proxied request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    pub method: String,
    pub path: String,
    pub status_code: u16,
    pub duration: Duration,
    /// Set when the local server could not be reached.
    pub error: Option<String>,
}

/// Tunnel lifecycle notifications. All methods default to no-ops.
pub trait TunnelHooks: Send + Sync {
    /// The server confirmed the tunnel. `port` is set for TCP/UDP tunnels.
    fn on_tunnel_ready(&self, _url: &str, _port: Option<u16>) {}

    /// A tunneled request completed (or failed to reach the local server).
    fn on_request(&self, _info: &RequestInfo) {}

    /// The server reported an error that was not handled internally.
    fn on_error(&self, _message: &str, _code: &str) {}

    /// A reconnect attempt (1-based) will start after `delay`.
    fn on_reconnecting(&self, _attempt: u32, _delay: Duration) {}

    /// A mirrored request got a different answer from the shadow server.
    fn on_shadow_diff(&self, _diff: &ShadowDiff) {}

    /// The session reached its terminal state.
    fn on_close(&self, _reason: &str) {}
}

/// Hooks that ignore every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl TunnelHooks for NoopHooks {}

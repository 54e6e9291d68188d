//! Tunnel client configuration.

use std::time::Duration;

use outray_proto::TunnelProtocol;

/// Public tunnel endpoint used when no server URL is configured.
pub const DEFAULT_SERVER_URL: &str = "wss://api.outray.dev/";

/// Resolved configuration for one tunnel. Read-only once handed to the client.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Port of the local HTTP server. `0` means unset and is rejected by `start`.
    pub local_port: u16,

    /// Host the local server is reached on.
    pub local_host: String,

    /// Tunnel server WebSocket URL (e.g., "wss://api.outray.dev/").
    pub server_url: String,

    /// API key sent in the handshake.
    pub api_key: Option<String>,

    /// Requested subdomain.
    pub subdomain: Option<String>,

    /// Custom domain to serve instead of a subdomain.
    pub custom_domain: Option<String>,

    pub protocol: TunnelProtocol,

    /// Port to expose on the server (TCP/UDP tunnels).
    pub remote_port: Option<u16>,

    /// IPs or CIDR ranges allowed to reach the tunnel. Empty = everyone.
    pub ip_allowlist: Vec<String>,

    /// Reconnection policy.
    pub reconnect: ReconnectPolicy,

    /// Keepalive pings.
    pub keepalive: KeepAliveConfig,

    /// Bound on the WebSocket opening handshake.
    pub handshake_timeout: Duration,

    /// Bound on each proxied call to the local server.
    pub request_timeout: Duration,

    /// Mirror sampled requests to a second local server and report
    /// differing responses. HTTP tunnels only.
    pub shadow: Option<ShadowConfig>,
}

/// Exponential backoff reconnection policy.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Initial delay before first reconnect attempt.
    pub initial_delay: Duration,
    /// Maximum delay between reconnect attempts.
    pub max_delay: Duration,
    /// Multiplier applied to delay after each failed attempt.
    pub multiplier: f64,
    /// Maximum number of reconnect attempts (None = unlimited).
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Calculate the delay for a given attempt number (0-indexed).
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap
    )]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_ms * self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    /// Whether another attempt should be made.
    pub const fn should_retry(&self, attempt: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempt < max,
            None => true,
        }
    }
}

/// Keepalive timing. A connection is declared dead when nothing has been
/// heard for `ping_interval + pong_grace`.
#[derive(Debug, Clone)]
pub struct KeepAliveConfig {
    pub ping_interval: Duration,
    pub pong_grace: Duration,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(25),
            pong_grace: Duration::from_secs(10),
        }
    }
}

impl KeepAliveConfig {
    /// Longest tolerated silence before the connection is considered dead.
    pub fn liveness_deadline(&self) -> Duration {
        self.ping_interval + self.pong_grace
    }
}

/// Second local server that receives copies of tunneled requests.
#[derive(Debug, Clone, PartialEq)]
pub struct ShadowConfig {
    pub host: String,
    pub port: u16,
    /// Use `https` instead of `http`.
    pub secure: bool,
    /// Fraction of requests mirrored, from 0.0 to 1.0.
    pub sample_rate: f64,
    /// Bound on the whole shadow exchange, body included.
    pub timeout: Duration,
    /// Body prefix length that is hashed for comparison.
    pub max_body_bytes: usize,
    /// Response headers compared besides status and body.
    pub compare_headers: Vec<String>,
}

impl ShadowConfig {
    /// Mirror every request to `localhost:port`.
    pub fn new(port: u16) -> Self {
        Self {
            host: "localhost".to_string(),
            port,
            secure: false,
            sample_rate: 1.0,
            timeout: Duration::from_secs(4),
            max_body_bytes: 256 * 1024,
            compare_headers: Vec::new(),
        }
    }

    /// Base URL of the shadow server, without a trailing slash.
    pub fn base_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

impl TunnelConfig {
    /// Create a config for `local_port` with every other field defaulted.
    pub fn new(local_port: u16) -> Self {
        Self {
            local_port,
            local_host: "localhost".to_string(),
            server_url: DEFAULT_SERVER_URL.to_string(),
            api_key: None,
            subdomain: None,
            custom_domain: None,
            protocol: TunnelProtocol::Http,
            remote_port: None,
            ip_allowlist: Vec::new(),
            reconnect: ReconnectPolicy::default(),
            keepalive: KeepAliveConfig::default(),
            handshake_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(60),
            shadow: None,
        }
    }

    /// Base URL of the local server, without a trailing slash.
    pub fn local_base_url(&self) -> String {
        format!("http://{}:{}", self.local_host, self.local_port)
    }
}

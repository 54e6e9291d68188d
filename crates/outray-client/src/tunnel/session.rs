//! Session state shared by the read loop, the keepalive task and the public
//! accessors.
//!
//! All mutable fields live behind one lock that is only ever held for the
//! duration of a field access, never across an `.await`. The lifecycle
//! state is published on a watch channel so callers can wait for the
//! session to close; it only changes while the write lock is held.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use outray_proto::OpenTunnel;

use super::config::TunnelConfig;
use super::transport::Transport;

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Handshaking,
    Open,
    Reconnecting,
    Closed,
}

#[derive(Debug)]
struct Session {
    transport: Option<Arc<Transport>>,
    /// Bumped for every installed transport.
    generation: u64,
    assigned_url: Option<String>,
    subdomain: Option<String>,
    force_takeover: bool,
    reconnect_attempts: u32,
    last_liveness: Instant,
    should_reconnect: bool,
    close_reason: Option<String>,
    stop: Option<watch::Sender<bool>>,
    done: Option<JoinHandle<()>>,
}

/// Lock-guarded session with accessor methods.
#[derive(Debug)]
pub(crate) struct SharedSession {
    inner: RwLock<Session>,
    state: watch::Sender<SessionState>,
}

/// What `halt` tore down.
pub(crate) struct Halted {
    pub transport: Option<Arc<Transport>>,
    pub stop: Option<watch::Sender<bool>>,
    /// The state before halting.
    pub previous: SessionState,
}

impl SharedSession {
    pub fn new(requested_subdomain: Option<String>) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            inner: RwLock::new(Session {
                transport: None,
                generation: 0,
                assigned_url: None,
                subdomain: requested_subdomain,
                force_takeover: false,
                reconnect_attempts: 0,
                last_liveness: Instant::now(),
                should_reconnect: false,
                close_reason: None,
                stop: None,
                done: None,
            }),
            state,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Session> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Session> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    // -- accessors -----------------------------------------------------------

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn current_url(&self) -> Option<String> {
        self.read().assigned_url.clone()
    }

    pub fn subdomain(&self) -> Option<String> {
        self.read().subdomain.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.read().transport.is_some()
    }

    pub fn force_takeover(&self) -> bool {
        self.read().force_takeover
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.read().reconnect_attempts
    }

    pub fn should_reconnect(&self) -> bool {
        self.read().should_reconnect
    }

    pub fn close_reason(&self) -> Option<String> {
        self.read().close_reason.clone()
    }

    /// Whether `generation` still names the installed transport.
    pub fn is_current(&self, generation: u64) -> bool {
        let s = self.read();
        s.transport.is_some() && s.generation == generation
    }

    // -- liveness ------------------------------------------------------------

    pub fn touch_liveness(&self) {
        self.write().last_liveness = Instant::now();
    }

    pub fn liveness_elapsed(&self) -> Duration {
        self.read().last_liveness.elapsed()
    }

    // -- lifecycle -----------------------------------------------------------

    /// Prepare for a new run: reconnects enabled, fresh stop signal.
    pub fn arm(&self, stop: watch::Sender<bool>) {
        let mut s = self.write();
        s.should_reconnect = true;
        s.close_reason = None;
        s.stop = Some(stop);
        self.state.send_replace(SessionState::Connecting);
    }

    /// Move to `state` unless the session was halted. State changes happen
    /// under the write lock so a concurrent `halt` always wins.
    pub fn enter(&self, state: SessionState) -> bool {
        let s = self.write();
        if !s.should_reconnect {
            return false;
        }
        self.state.send_replace(state);
        true
    }

    pub fn set_done(&self, done: JoinHandle<()>) {
        self.write().done = Some(done);
    }

    pub fn take_done(&self) -> Option<JoinHandle<()>> {
        self.write().done.take()
    }

    /// Disable reconnects and detach the transport and stop signal so the
    /// caller can close them outside the lock.
    pub fn halt(&self, reason: &str) -> Halted {
        let mut s = self.write();
        let previous = self.state();
        s.should_reconnect = false;
        if !matches!(previous, SessionState::Closed | SessionState::Idle) {
            s.close_reason = Some(reason.to_string());
            self.state.send_replace(SessionState::Closed);
        }
        Halted {
            transport: s.transport.take(),
            stop: s.stop.take(),
            previous,
        }
    }

    // -- connection ----------------------------------------------------------

    /// Install a freshly opened transport and reset the liveness clock.
    /// Returns the new generation, or `None` if the session was halted in
    /// the meantime (the caller must then close the transport).
    pub fn install_transport(&self, transport: Arc<Transport>) -> Option<u64> {
        let mut s = self.write();
        if !s.should_reconnect {
            return None;
        }
        s.generation += 1;
        s.transport = Some(transport);
        s.last_liveness = Instant::now();
        self.state.send_replace(SessionState::Handshaking);
        Some(s.generation)
    }

    /// Drop the transport if it is still `generation`.
    pub fn clear_transport(&self, generation: u64) {
        let mut s = self.write();
        if s.generation == generation {
            s.transport = None;
        }
    }

    /// Handshake for the next connection: configuration plus the current
    /// subdomain and takeover flag.
    pub fn handshake(&self, config: &TunnelConfig) -> OpenTunnel {
        let s = self.read();
        OpenTunnel {
            api_key: config.api_key.clone(),
            subdomain: s.subdomain.clone(),
            custom_domain: config.custom_domain.clone(),
            force_takeover: s.force_takeover,
            protocol: Some(config.protocol),
            remote_port: config.remote_port,
            ip_allowlist: config.ip_allowlist.clone(),
        }
    }

    /// Record a `tunnel_opened` confirmation.
    pub fn record_tunnel_opened(&self, url: &str) {
        let mut s = self.write();
        s.assigned_url = Some(url.to_string());
        s.force_takeover = false;
        s.reconnect_attempts = 0;
        if let Some(subdomain) = extract_subdomain(url) {
            s.subdomain = Some(subdomain);
        }
    }

    /// React to `SUBDOMAIN_IN_USE`: if a URL was assigned before and no
    /// takeover is pending, arm one. `false` means the error is not handled
    /// here.
    pub fn request_takeover(&self) -> bool {
        let mut s = self.write();
        if s.assigned_url.is_none() || s.force_takeover {
            return false;
        }
        s.force_takeover = true;
        true
    }

    /// Enter the reconnect path after a transport failure. Returns the
    /// attempt count before this failure, or `None` when reconnecting is
    /// disabled.
    pub fn begin_reconnect(&self) -> Option<u32> {
        let mut s = self.write();
        s.transport = None;
        if !s.should_reconnect {
            return None;
        }
        if s.assigned_url.is_some() {
            s.force_takeover = true;
        }
        let attempts = s.reconnect_attempts;
        s.reconnect_attempts = s.reconnect_attempts.saturating_add(1);
        self.state.send_replace(SessionState::Reconnecting);
        Some(attempts)
    }
}

/// First hostname label of `url`, e.g. `myapp` for `https://myapp.outray.dev`.
pub fn extract_subdomain(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let label = parsed.host_str()?.split('.').next()?;
    (!label.is_empty()).then(|| label.to_string())
}

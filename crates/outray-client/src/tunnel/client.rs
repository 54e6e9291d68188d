//! Tunnel client that keeps a local server exposed through the tunnel server.

use std::sync::Arc;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use outray_proto::ClientMessage;

use super::config::TunnelConfig;
use super::error::TunnelClientError;
use super::handler::{Dispatcher, Flow};
use super::heartbeat::spawn_keepalive_task;
use super::hooks::TunnelHooks;
use super::proxy::RequestProxy;
use super::session::{SessionState, SharedSession};
use super::transport::{self, Inbound, Transport, TransportReader};

/// Reason reported to `on_close` after [`TunnelClient::stop`].
pub const STOPPED: &str = "stopped";

/// Reason reported when the reconnect policy runs out of attempts.
pub const RECONNECT_EXHAUSTED: &str = "reconnect attempts exhausted";

/// Tunnel client that maintains a persistent connection to the tunnel
/// server, reconnecting with backoff until stopped.
pub struct TunnelClient {
    inner: Arc<Inner>,
}

struct Inner {
    config: TunnelConfig,
    hooks: Arc<dyn TunnelHooks>,
    session: Arc<SharedSession>,
    dispatcher: Dispatcher,
    /// Serializes `start` and `stop`.
    lifecycle: Mutex<()>,
}

/// One live connection and the keepalive task watching it.
struct Connection {
    transport: Arc<Transport>,
    reader: TransportReader,
    generation: u64,
    keepalive: JoinHandle<()>,
}

/// Why the read loop returned.
enum ReadExit {
    Failed(TunnelClientError),
    Fatal(String),
}

impl TunnelClient {
    pub fn new(
        config: TunnelConfig,
        hooks: Arc<dyn TunnelHooks>,
    ) -> Result<Self, TunnelClientError> {
        let session = Arc::new(SharedSession::new(config.subdomain.clone()));
        let proxy = RequestProxy::new(&config)?;
        let dispatcher = Dispatcher::new(Arc::clone(&session), Arc::clone(&hooks), proxy);

        info!(
            server_url = %config.server_url,
            local = %config.local_base_url(),
            protocol = %config.protocol,
            "Tunnel client created"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                hooks,
                session,
                dispatcher,
                lifecycle: Mutex::new(()),
            }),
        })
    }

    /// Connect and keep the tunnel up in the background.
    ///
    /// Fails without touching the network when no local port is configured.
    /// The first connection attempt is made inline and its error returned;
    /// later failures are retried. A running session is stopped first.
    pub async fn start(&self) -> Result<(), TunnelClientError> {
        if self.inner.config.local_port == 0 {
            return Err(TunnelClientError::Config(
                "local port must be set before starting".into(),
            ));
        }

        let _guard = self.inner.lifecycle.lock().await;
        self.inner.stop_run(STOPPED).await;

        let (stop_tx, stop_rx) = watch::channel(false);
        self.inner.session.arm(stop_tx);

        let conn = match self.inner.connect(&stop_rx).await {
            Ok(conn) => conn,
            Err(e) => {
                error!(error = %e, "Initial connection failed");
                self.inner.session.halt(&e.to_string());
                return Err(e);
            }
        };

        let done = tokio::spawn(Arc::clone(&self.inner).supervise(conn, stop_rx));
        self.inner.session.set_done(done);
        Ok(())
    }

    /// Stop reconnecting, close the connection and wait for the background
    /// task to exit. Safe to call repeatedly or before `start`.
    pub async fn stop(&self) {
        let _guard = self.inner.lifecycle.lock().await;
        self.inner.stop_run(STOPPED).await;
    }

    /// Resolves once the session is closed, by `stop` or a fatal error.
    pub async fn wait_closed(&self) {
        let mut state = self.inner.session.subscribe_state();
        let _ = state.wait_for(|s| *s == SessionState::Closed).await;
    }

    /// URL assigned by the server, once the tunnel has been confirmed.
    pub fn current_url(&self) -> Option<String> {
        self.inner.session.current_url()
    }

    /// Effective subdomain: the requested one, replaced by the assigned one.
    pub fn subdomain(&self) -> Option<String> {
        self.inner.session.subdomain()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.session.is_connected()
    }

    pub fn state(&self) -> SessionState {
        self.inner.session.state()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.session.reconnect_attempts()
    }

    /// Why the session closed, if it has.
    pub fn close_reason(&self) -> Option<String> {
        self.inner.session.close_reason()
    }
}

impl Inner {
    /// Halt the session and release its resources. Fires `on_close` when a
    /// live session is closed.
    fn shutdown(&self, reason: &str) {
        let halted = self.session.halt(reason);
        if let Some(stop) = halted.stop {
            stop.send_replace(true);
        }
        if let Some(transport) = halted.transport {
            transport.close();
        }
        if !matches!(
            halted.previous,
            SessionState::Idle | SessionState::Closed
        ) {
            info!(reason, "Tunnel session ended");
            self.hooks.on_close(reason);
        }
    }

    /// `shutdown`, then wait for the supervisor.
    async fn stop_run(&self, reason: &str) {
        self.shutdown(reason);
        if let Some(done) = self.session.take_done()
            && let Err(e) = done.await
        {
            error!(error = %e, "Tunnel supervisor task failed");
        }
    }

    /// Open a transport, send the handshake and start the keepalive task.
    async fn connect(
        &self,
        stop: &watch::Receiver<bool>,
    ) -> Result<Connection, TunnelClientError> {
        if !self.session.enter(SessionState::Connecting) {
            return Err(TunnelClientError::NotConnected);
        }
        debug!(server_url = %self.config.server_url, "Connecting to tunnel server");

        let mut stopped = stop.clone();
        let open = transport::open(&self.config.server_url, self.config.handshake_timeout);
        let (transport, reader) = tokio::select! {
            opened = open => opened?,
            () = async { let _ = stopped.wait_for(|stopped| *stopped).await; } => {
                debug!("Connect abandoned after stop");
                return Err(TunnelClientError::NotConnected);
            }
        };

        let Some(generation) = self.session.install_transport(Arc::clone(&transport)) else {
            transport.close();
            return Err(TunnelClientError::NotConnected);
        };

        let hello = ClientMessage::OpenTunnel(self.session.handshake(&self.config));
        if let Err(e) = transport.send(&hello).await {
            transport.close();
            self.session.clear_transport(generation);
            return Err(TunnelClientError::Handshake(format!(
                "Failed to send open_tunnel: {e}"
            )));
        }
        self.session.enter(SessionState::Open);

        let keepalive = spawn_keepalive_task(
            Arc::clone(&self.session),
            Arc::clone(&transport),
            generation,
            self.config.keepalive.clone(),
            stop.clone(),
        );

        info!(
            server_url = %self.config.server_url,
            generation,
            force_takeover = self.session.force_takeover(),
            "Connected to tunnel server"
        );
        Ok(Connection {
            transport,
            reader,
            generation,
            keepalive,
        })
    }

    /// Background task: read frames, reconnect on failure, exit on stop or
    /// fatal error.
    async fn supervise(self: Arc<Self>, mut conn: Connection, mut stop: watch::Receiver<bool>) {
        loop {
            let exit = self.read_loop(&mut conn).await;
            conn.keepalive.abort();
            conn.transport.close();
            self.session.clear_transport(conn.generation);

            match exit {
                ReadExit::Fatal(reason) => {
                    self.shutdown(&reason);
                    return;
                }
                ReadExit::Failed(e) => {
                    if !self.session.should_reconnect() {
                        debug!(error = %e, "Read loop ended after stop");
                        return;
                    }
                    warn!(error = %e, "Tunnel connection lost");
                }
            }

            match self.reconnect(&mut stop).await {
                Some(next) => conn = next,
                None => return,
            }
        }
    }

    async fn read_loop(&self, conn: &mut Connection) -> ReadExit {
        loop {
            match conn.reader.next_event().await {
                Ok(event) => {
                    self.session.touch_liveness();
                    if let Inbound::Text(text) = event
                        && let Flow::Halt(reason) =
                            self.dispatcher.dispatch(&text, &conn.transport).await
                    {
                        return ReadExit::Fatal(reason);
                    }
                }
                Err(TunnelClientError::StoppedByServer(reason)) => {
                    info!(reason = %reason, "Tunnel stopped by the server");
                    return ReadExit::Fatal(reason);
                }
                Err(e) => return ReadExit::Failed(e),
            }
        }
    }

    /// Back off and retry until a connection is made, the session is
    /// stopped, or the policy gives up.
    async fn reconnect(&self, stop: &mut watch::Receiver<bool>) -> Option<Connection> {
        loop {
            let attempt = self.session.begin_reconnect()?;
            let policy = &self.config.reconnect;
            if !policy.should_retry(attempt) {
                warn!(attempts = attempt, "Giving up on reconnecting");
                self.shutdown(RECONNECT_EXHAUSTED);
                return None;
            }

            let delay = policy.delay_for_attempt(attempt);
            warn!(
                attempt = attempt + 1,
                delay_ms = delay.as_millis(),
                "Reconnecting"
            );
            self.hooks.on_reconnecting(attempt + 1, delay);

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = async { let _ = stop.wait_for(|stopped| *stopped).await; } => {
                    info!("Tunnel client stopped during reconnect wait");
                    return None;
                }
            }
            if !self.session.should_reconnect() {
                return None;
            }

            match self.connect(stop).await {
                Ok(conn) => return Some(conn),
                Err(e) => warn!(error = %e, "Reconnect attempt failed"),
            }
        }
    }
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;

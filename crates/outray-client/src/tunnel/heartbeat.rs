//! Keepalive task that detects a silently dead connection.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::config::KeepAliveConfig;
use super::session::SharedSession;
use super::transport::Transport;

/// Spawn the keepalive task for the transport installed as `generation`.
///
/// On every tick it first checks how long ago anything was heard from the
/// server; past [`KeepAliveConfig::liveness_deadline`] the transport is
/// closed, which the read loop observes as a failure. Otherwise a ping
/// control frame is sent. The task ends on shutdown, once the transport is
/// no longer current, or after closing it.
pub(crate) fn spawn_keepalive_task(
    session: Arc<SharedSession>,
    transport: Arc<Transport>,
    generation: u64,
    config: KeepAliveConfig,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(config.ping_interval);
        timer.tick().await; // Skip first immediate tick

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    if !session.is_current(generation) || transport.is_closed() {
                        debug!(generation, "Keepalive task retiring with its transport");
                        return;
                    }

                    let silent_for = session.liveness_elapsed();
                    if silent_for > config.liveness_deadline() {
                        warn!(
                            silent_ms = silent_for.as_millis(),
                            "Pong timeout - connection may be dead"
                        );
                        transport.close();
                        return;
                    }

                    if let Err(e) = transport.ping().await {
                        warn!(error = %e, "Failed to send ping");
                    }
                }
                () = async { let _ = shutdown.wait_for(|stopped| *stopped).await; } => {
                    info!("Keepalive task shutting down");
                    return;
                }
            }
        }
    })
}

//! Routes decoded server messages to their effects.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use outray_proto::{
    ClientMessage, ErrorCode, ErrorMessage, RequestMessage, ServerMessage, TunnelOpened,
    decode_server_message,
};

use super::hooks::TunnelHooks;
use super::proxy::{ProxyOutcome, RequestProxy};
use super::session::SharedSession;
use super::transport::Transport;

/// What the read loop should do after a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    /// A fatal server error; stop the session with this reason.
    Halt(String),
}

/// Handles inbound frames for one session.
pub(crate) struct Dispatcher {
    session: Arc<SharedSession>,
    hooks: Arc<dyn TunnelHooks>,
    proxy: RequestProxy,
}

impl Dispatcher {
    pub fn new(
        session: Arc<SharedSession>,
        hooks: Arc<dyn TunnelHooks>,
        proxy: RequestProxy,
    ) -> Self {
        Self {
            session,
            hooks,
            proxy,
        }
    }

    /// Process one text frame received on `transport`.
    ///
    /// Undecodable and unknown frames are dropped. Requests are proxied on
    /// their own task so the read loop keeps draining frames; the response
    /// goes back on the transport the request arrived on.
    pub async fn dispatch(&self, text: &str, transport: &Arc<Transport>) -> Flow {
        let msg = match decode_server_message(text) {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                debug!("Ignoring unknown message type");
                return Flow::Continue;
            }
            Err(e) => {
                warn!(error = %e, "Dropping malformed frame");
                return Flow::Continue;
            }
        };

        match msg {
            ServerMessage::TunnelOpened(opened) => {
                self.on_tunnel_opened(&opened);
                Flow::Continue
            }
            ServerMessage::Error(err) => self.on_error(err, transport),
            ServerMessage::Request(req) => {
                self.spawn_request(req, Arc::clone(transport));
                Flow::Continue
            }
            ServerMessage::Ping => {
                if let Err(e) = transport.send(&ClientMessage::Pong).await {
                    debug!(error = %e, "Failed to answer ping");
                }
                Flow::Continue
            }
            ServerMessage::Pong => Flow::Continue,
        }
    }

    fn on_tunnel_opened(&self, opened: &TunnelOpened) {
        self.session.record_tunnel_opened(&opened.url);
        info!(
            url = %opened.url,
            tunnel_id = %opened.tunnel_id,
            plan = opened.plan.as_deref().unwrap_or(""),
            "Tunnel ready"
        );
        self.hooks.on_tunnel_ready(&opened.url, opened.port);
    }

    fn on_error(&self, err: ErrorMessage, transport: &Transport) -> Flow {
        let code = ErrorCode::from_code(&err.code);

        if code == ErrorCode::SubdomainInUse && self.session.request_takeover() {
            warn!("Subdomain held by a stale session, reconnecting with takeover");
            transport.close();
            return Flow::Continue;
        }

        error!(code = %err.code, message = %err.message, "Server reported an error");
        self.hooks.on_error(&err.message, &err.code);

        if code.is_fatal() {
            Flow::Halt(err.message)
        } else {
            Flow::Continue
        }
    }

    fn spawn_request(&self, req: RequestMessage, transport: Arc<Transport>) {
        let proxy = self.proxy.clone();
        let hooks = Arc::clone(&self.hooks);
        tokio::spawn(async move {
            let request_id = req.request_id.clone();
            let ProxyOutcome {
                response,
                info,
                shadow,
            } = proxy.handle(req).await;
            if let Some(info) = &info {
                hooks.on_request(info);
            }
            if let Err(e) = transport.send(&ClientMessage::Response(response)).await {
                warn!(request_id = %request_id, error = %e, "Failed to send response");
            }
            if let Some(pending) = shadow
                && let Some(diff) = pending.run().await
            {
                hooks.on_shadow_diff(&diff);
            }
        });
    }
}

#[cfg(test)]
#[path = "handler_tests.rs"]
mod tests;

//! Shared fixtures for tunnel tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;

use super::hooks::{RequestInfo, TunnelHooks};
use super::shadow::ShadowDiff;
use super::session::SharedSession;

/// One recorded hook invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookEvent {
    Ready { url: String, port: Option<u16> },
    Request(RequestInfo),
    Error { message: String, code: String },
    Reconnecting { attempt: u32, delay: Duration },
    ShadowDiff(ShadowDiff),
    Close(String),
}

/// Hooks that remember every call.
#[derive(Debug, Default)]
pub struct RecordingHooks {
    events: Mutex<Vec<HookEvent>>,
}

impl RecordingHooks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, event: HookEvent) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<HookEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&HookEvent) -> bool) -> usize {
        self.events().iter().filter(|e| pred(e)).count()
    }

    /// Poll until an event matching `pred` is recorded.
    pub async fn wait_for(&self, pred: impl Fn(&HookEvent) -> bool) -> HookEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(e) = self.events().into_iter().find(|e| pred(e)) {
                    return e;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("hook event not seen; got {:?}", self.events()))
    }
}

impl TunnelHooks for RecordingHooks {
    fn on_tunnel_ready(&self, url: &str, port: Option<u16>) {
        self.push(HookEvent::Ready {
            url: url.to_string(),
            port,
        });
    }

    fn on_request(&self, info: &RequestInfo) {
        self.push(HookEvent::Request(info.clone()));
    }

    fn on_error(&self, message: &str, code: &str) {
        self.push(HookEvent::Error {
            message: message.to_string(),
            code: code.to_string(),
        });
    }

    fn on_reconnecting(&self, attempt: u32, delay: Duration) {
        self.push(HookEvent::Reconnecting { attempt, delay });
    }

    fn on_shadow_diff(&self, diff: &ShadowDiff) {
        self.push(HookEvent::ShadowDiff(diff.clone()));
    }

    fn on_close(&self, reason: &str) {
        self.push(HookEvent::Close(reason.to_string()));
    }
}

/// A session as `start` leaves it.
pub fn armed_session() -> Arc<SharedSession> {
    let session = Arc::new(SharedSession::new(None));
    let (stop, _) = watch::channel(false);
    session.arm(stop);
    session
}

/// Next text frame from a detached transport, parsed as JSON.
pub async fn next_json(rx: &mut mpsc::Receiver<Message>) -> serde_json::Value {
    let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for frame")
        .expect("transport dropped");
    match frame {
        Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
        other => panic!("expected text frame, got {other:?}"),
    }
}

/// A port nothing listens on.
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

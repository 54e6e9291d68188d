use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::*;
use crate::tunnel::config::{KeepAliveConfig, ReconnectPolicy};
use crate::tunnel::test_helpers::{HookEvent, RecordingHooks, free_port};
use crate::tunnel::transport::SERVER_STOP_REASON;

const WAIT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Fake tunnel server
// ---------------------------------------------------------------------------

struct FakeServer {
    url: String,
    conns: mpsc::UnboundedReceiver<WebSocketStream<TcpStream>>,
}

impl FakeServer {
    /// Accept at most `limit` connections, then stop listening.
    async fn start(limit: usize) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, conns) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            for _ in 0..limit {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                if let Ok(ws) = tokio_tungstenite::accept_async(stream).await
                    && tx.send(ws).is_err()
                {
                    return;
                }
            }
        });
        Self {
            url: format!("ws://{addr}/"),
            conns,
        }
    }

    async fn accept(&mut self) -> ServerConn {
        let ws = tokio::time::timeout(WAIT, self.conns.recv())
            .await
            .expect("no connection from client")
            .unwrap();
        ServerConn { ws }
    }

    /// Accept and consume the handshake.
    async fn accept_handshake(&mut self) -> (ServerConn, Value) {
        let mut conn = self.accept().await;
        let hello = conn.recv_json().await;
        assert_eq!(hello["type"], "open_tunnel");
        (conn, hello)
    }

    async fn assert_no_connection(&mut self, within: Duration) {
        tokio::time::sleep(within).await;
        assert!(self.conns.try_recv().is_err(), "unexpected connection");
    }
}

struct ServerConn {
    ws: WebSocketStream<TcpStream>,
}

impl ServerConn {
    async fn recv_json(&mut self) -> Value {
        tokio::time::timeout(WAIT, async {
            loop {
                match self.ws.next().await {
                    Some(Ok(Message::Text(text))) => {
                        return serde_json::from_str(text.as_str()).unwrap();
                    }
                    Some(Ok(_)) => continue,
                    other => panic!("connection ended: {other:?}"),
                }
            }
        })
        .await
        .expect("no frame from client")
    }

    async fn send_json(&mut self, value: Value) {
        self.ws
            .send(Message::Text(value.to_string().into()))
            .await
            .unwrap();
    }

    async fn send_opened(&mut self, url: &str) {
        self.send_json(json!({"type": "tunnel_opened", "tunnelId": "t1", "url": url}))
            .await;
    }

    async fn send_error(&mut self, code: &str, message: &str) {
        self.send_json(json!({"type": "error", "code": code, "message": message}))
            .await;
    }

    async fn send_close(&mut self, code: CloseCode, reason: &str) {
        self.ws
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: reason.into(),
            })))
            .await
            .unwrap();
    }

    async fn expect_closed(&mut self) {
        tokio::time::timeout(WAIT, async {
            loop {
                match self.ws.next().await {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                    Some(Ok(_)) => {}
                }
            }
        })
        .await
        .expect("client did not close the connection");
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn test_config(server_url: &str, local_port: u16) -> TunnelConfig {
    let mut config = TunnelConfig::new(local_port);
    config.server_url = server_url.to_string();
    config.local_host = "127.0.0.1".into();
    config.api_key = Some("key".into());
    config.subdomain = Some("wanted".into());
    config.handshake_timeout = Duration::from_secs(2);
    config.reconnect = ReconnectPolicy {
        initial_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(100),
        multiplier: 2.0,
        max_attempts: None,
    };
    config
}

fn client(config: TunnelConfig) -> (TunnelClient, Arc<RecordingHooks>) {
    let hooks = RecordingHooks::new();
    let client = TunnelClient::new(config, hooks.clone()).unwrap();
    (client, hooks)
}

fn is_reconnecting(e: &HookEvent) -> bool {
    matches!(e, HookEvent::Reconnecting { .. })
}

fn is_error(e: &HookEvent) -> bool {
    matches!(e, HookEvent::Error { .. })
}

// ---------------------------------------------------------------------------
// Start / stop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn start_without_local_port_fails_before_connecting() {
    let mut server = FakeServer::start(usize::MAX).await;
    let (client, hooks) = client(test_config(&server.url, 0));

    let err = client.start().await.unwrap_err();
    assert!(matches!(err, TunnelClientError::Config(_)), "{err}");
    assert_eq!(client.state(), SessionState::Idle);
    server.assert_no_connection(Duration::from_millis(100)).await;
    assert!(hooks.events().is_empty());
}

#[tokio::test]
async fn start_returns_first_connection_error() {
    let url = format!("ws://127.0.0.1:{}/", free_port());
    let (client, hooks) = client(test_config(&url, 3000));

    let err = client.start().await.unwrap_err();
    assert!(matches!(err, TunnelClientError::Connection(_)), "{err}");
    assert_eq!(client.state(), SessionState::Closed);
    assert!(!client.is_connected());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(hooks.events().is_empty(), "{:?}", hooks.events());
}

#[tokio::test]
async fn handshake_then_tunnel_ready_then_stop() {
    let mut server = FakeServer::start(usize::MAX).await;
    let (client, hooks) = client(test_config(&server.url, 3000));

    client.start().await.unwrap();
    assert!(client.is_connected());
    assert_eq!(client.state(), SessionState::Open);

    let (mut conn, hello) = server.accept_handshake().await;
    assert_eq!(hello["apiKey"], "key");
    assert_eq!(hello["subdomain"], "wanted");
    assert_eq!(hello["protocol"], "http");
    assert!(hello.get("forceTakeover").is_none());

    conn.send_opened("https://assigned.outray.dev").await;
    hooks
        .wait_for(|e| matches!(e, HookEvent::Ready { url, .. } if url == "https://assigned.outray.dev"))
        .await;
    assert_eq!(
        client.current_url().as_deref(),
        Some("https://assigned.outray.dev")
    );
    assert_eq!(client.subdomain().as_deref(), Some("assigned"));

    client.stop().await;
    assert_eq!(client.state(), SessionState::Closed);
    assert!(!client.is_connected());
    assert_eq!(client.close_reason().as_deref(), Some(STOPPED));
    assert_eq!(hooks.count(|e| *e == HookEvent::Close(STOPPED.into())), 1);
    conn.expect_closed().await;

    tokio::time::timeout(WAIT, client.wait_closed()).await.unwrap();
    server.assert_no_connection(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn stop_is_idempotent_and_safe_before_start() {
    let mut server = FakeServer::start(usize::MAX).await;
    let (client, hooks) = client(test_config(&server.url, 3000));

    client.stop().await;
    assert_eq!(client.state(), SessionState::Idle);

    client.start().await.unwrap();
    let _conn = server.accept_handshake().await;
    client.stop().await;
    client.stop().await;

    assert_eq!(hooks.count(|e| matches!(e, HookEvent::Close(_))), 1);
}

#[tokio::test]
async fn restart_after_stop_opens_a_single_new_connection() {
    let mut server = FakeServer::start(usize::MAX).await;
    let (client, _hooks) = client(test_config(&server.url, 3000));

    client.start().await.unwrap();
    let (mut first, _) = server.accept_handshake().await;
    client.stop().await;
    first.expect_closed().await;

    client.start().await.unwrap();
    let (_second, hello) = server.accept_handshake().await;
    assert_eq!(hello["apiKey"], "key");
    assert_eq!(client.state(), SessionState::Open);
    server.assert_no_connection(Duration::from_millis(100)).await;

    client.stop().await;
}

// ---------------------------------------------------------------------------
// Traffic
// ---------------------------------------------------------------------------

#[tokio::test]
async fn requests_are_proxied_to_the_local_server() {
    let local = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/ping"))
        .respond_with(ResponseTemplate::new(200).set_body_string("pong"))
        .mount(&local)
        .await;

    let mut server = FakeServer::start(usize::MAX).await;
    let (client, hooks) = client(test_config(&server.url, local.address().port()));
    client.start().await.unwrap();
    let (mut conn, _) = server.accept_handshake().await;
    conn.send_opened("https://assigned.outray.dev").await;

    conn.send_json(json!({
        "type": "request",
        "requestId": "abc",
        "method": "GET",
        "path": "/api/ping",
        "headers": {"accept": "text/plain"}
    }))
    .await;

    let resp = conn.recv_json().await;
    assert_eq!(resp["type"], "response");
    assert_eq!(resp["requestId"], "abc");
    assert_eq!(resp["statusCode"], 200);
    assert_eq!(resp["body"], "cG9uZw==");

    hooks
        .wait_for(|e| matches!(e, HookEvent::Request(info) if info.path == "/api/ping"))
        .await;
    client.stop().await;
}

#[tokio::test]
async fn application_ping_gets_pong() {
    let mut server = FakeServer::start(usize::MAX).await;
    let (client, _hooks) = client(test_config(&server.url, 3000));
    client.start().await.unwrap();
    let (mut conn, _) = server.accept_handshake().await;

    conn.send_json(json!({"type": "ping"})).await;
    assert_eq!(conn.recv_json().await, json!({"type": "pong"}));
    client.stop().await;
}

// ---------------------------------------------------------------------------
// Reconnection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn server_drop_reconnects_with_takeover() {
    let mut server = FakeServer::start(usize::MAX).await;
    let (client, hooks) = client(test_config(&server.url, 3000));
    client.start().await.unwrap();

    let (mut first, _) = server.accept_handshake().await;
    first.send_opened("https://assigned.outray.dev").await;
    hooks.wait_for(|e| matches!(e, HookEvent::Ready { .. })).await;
    drop(first);

    let event = hooks.wait_for(is_reconnecting).await;
    assert_eq!(
        event,
        HookEvent::Reconnecting {
            attempt: 1,
            delay: Duration::from_millis(20)
        }
    );

    let (mut second, hello) = server.accept_handshake().await;
    assert_eq!(hello["forceTakeover"], true);
    assert_eq!(hello["subdomain"], "assigned");
    assert_eq!(client.reconnect_attempts(), 1);

    second.send_opened("https://assigned.outray.dev").await;
    tokio::time::timeout(WAIT, async {
        while client.reconnect_attempts() != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(hooks.events().iter().all(|e| !is_error(e)));
    client.stop().await;
}

#[tokio::test]
async fn subdomain_in_use_is_retried_with_takeover_once() {
    let mut server = FakeServer::start(usize::MAX).await;
    let (client, hooks) = client(test_config(&server.url, 3000));
    client.start().await.unwrap();

    let (mut first, _) = server.accept_handshake().await;
    first.send_opened("https://assigned.outray.dev").await;
    hooks.wait_for(|e| matches!(e, HookEvent::Ready { .. })).await;

    first.send_error("SUBDOMAIN_IN_USE", "taken").await;
    first.expect_closed().await;

    let (mut second, hello) = server.accept_handshake().await;
    assert_eq!(hello["forceTakeover"], true);
    assert_eq!(hooks.count(is_error), 0);

    // Takeover already pending: surfaced this time.
    second.send_error("SUBDOMAIN_IN_USE", "still taken").await;
    let event = hooks.wait_for(is_error).await;
    assert_eq!(
        event,
        HookEvent::Error {
            message: "still taken".into(),
            code: "SUBDOMAIN_IN_USE".into()
        }
    );
    assert_eq!(client.state(), SessionState::Open);
    client.stop().await;
}

#[tokio::test]
async fn fatal_error_closes_without_reconnecting() {
    let mut server = FakeServer::start(usize::MAX).await;
    let (client, hooks) = client(test_config(&server.url, 3000));
    client.start().await.unwrap();

    let (mut conn, _) = server.accept_handshake().await;
    conn.send_error("AUTH_FAILED", "invalid api key").await;

    tokio::time::timeout(WAIT, client.wait_closed()).await.unwrap();
    hooks
        .wait_for(|e| *e == HookEvent::Close("invalid api key".into()))
        .await;
    assert_eq!(
        hooks.events()[0],
        HookEvent::Error {
            message: "invalid api key".into(),
            code: "AUTH_FAILED".into()
        }
    );
    assert_eq!(client.close_reason().as_deref(), Some("invalid api key"));
    assert!(!client.is_connected());
    conn.expect_closed().await;

    server.assert_no_connection(Duration::from_millis(200)).await;
    assert_eq!(hooks.count(is_reconnecting), 0);

    client.stop().await;
    assert_eq!(hooks.count(|e| matches!(e, HookEvent::Close(_))), 1);
}

#[tokio::test]
async fn silent_server_trips_keepalive_and_reconnects() {
    let mut server = FakeServer::start(usize::MAX).await;
    let mut config = test_config(&server.url, 3000);
    config.keepalive = KeepAliveConfig {
        ping_interval: Duration::from_millis(50),
        pong_grace: Duration::from_millis(50),
    };
    let (client, hooks) = client(config);
    client.start().await.unwrap();

    // Not reading means pings are never answered.
    let (_silent, _) = server.accept_handshake().await;

    let event = hooks.wait_for(is_reconnecting).await;
    assert_eq!(
        event,
        HookEvent::Reconnecting {
            attempt: 1,
            delay: Duration::from_millis(20)
        }
    );
    let (_second, hello) = server.accept_handshake().await;
    assert_eq!(hello["type"], "open_tunnel");
    assert_eq!(client.reconnect_attempts(), 1);
    client.stop().await;
}

#[tokio::test]
async fn remote_stop_close_frame_ends_the_session() {
    let mut server = FakeServer::start(usize::MAX).await;
    let (client, hooks) = client(test_config(&server.url, 3000));
    client.start().await.unwrap();

    let (mut conn, _) = server.accept_handshake().await;
    conn.send_opened("https://assigned.outray.dev").await;
    hooks.wait_for(|e| matches!(e, HookEvent::Ready { .. })).await;
    conn.send_close(CloseCode::Normal, SERVER_STOP_REASON).await;

    tokio::time::timeout(WAIT, client.wait_closed()).await.unwrap();
    assert_eq!(client.state(), SessionState::Closed);
    assert_eq!(client.close_reason().as_deref(), Some(SERVER_STOP_REASON));
    assert!(!client.is_connected());

    server.assert_no_connection(Duration::from_millis(200)).await;
    assert_eq!(hooks.count(is_reconnecting), 0);
    assert_eq!(
        hooks.count(|e| *e == HookEvent::Close(SERVER_STOP_REASON.into())),
        1
    );

    client.stop().await;
    assert_eq!(hooks.count(|e| matches!(e, HookEvent::Close(_))), 1);
}

#[tokio::test]
async fn other_normal_close_is_retried() {
    let mut server = FakeServer::start(usize::MAX).await;
    let (client, hooks) = client(test_config(&server.url, 3000));
    client.start().await.unwrap();

    let (mut conn, _) = server.accept_handshake().await;
    conn.send_close(CloseCode::Normal, "server restarting").await;

    hooks.wait_for(is_reconnecting).await;
    let (_second, _) = server.accept_handshake().await;
    assert_eq!(hooks.count(|e| matches!(e, HookEvent::Close(_))), 0);
    client.stop().await;
}

#[tokio::test]
async fn stop_interrupts_a_stalled_connect() {
    // First connection completes the WebSocket upgrade; later ones are
    // accepted at TCP level and never answered.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/", listener.local_addr().unwrap());
    let (first_tx, mut first_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut stalled = Vec::new();
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
            let _ = first_tx.send(ws);
        }
        while let Ok((stream, _)) = listener.accept().await {
            stalled.push(stream);
        }
    });

    let mut config = test_config(&url, 3000);
    config.handshake_timeout = Duration::from_secs(10);
    let (client, hooks) = client(config);
    client.start().await.unwrap();

    let ws = tokio::time::timeout(WAIT, first_rx.recv())
        .await
        .unwrap()
        .unwrap();
    drop(ws);
    hooks.wait_for(is_reconnecting).await;
    // Past the 20ms backoff: the reconnect is now stuck in the upgrade.
    tokio::time::sleep(Duration::from_millis(200)).await;

    tokio::time::timeout(Duration::from_secs(1), client.stop())
        .await
        .expect("stop blocked on a stalled connect");
    assert_eq!(client.state(), SessionState::Closed);
    assert_eq!(hooks.count(|e| *e == HookEvent::Close(STOPPED.into())), 1);
}

#[tokio::test]
async fn stop_during_backoff_returns_promptly() {
    let mut server = FakeServer::start(usize::MAX).await;
    let mut config = test_config(&server.url, 3000);
    config.reconnect.initial_delay = Duration::from_secs(30);
    config.reconnect.max_delay = Duration::from_secs(30);
    let (client, hooks) = client(config);
    client.start().await.unwrap();

    let (first, _) = server.accept_handshake().await;
    drop(first);
    hooks.wait_for(is_reconnecting).await;
    assert_eq!(client.state(), SessionState::Reconnecting);

    tokio::time::timeout(Duration::from_secs(1), client.stop())
        .await
        .expect("stop blocked on backoff");
    assert_eq!(client.state(), SessionState::Closed);
    assert_eq!(hooks.count(|e| *e == HookEvent::Close(STOPPED.into())), 1);
    server.assert_no_connection(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn backoff_grows_and_gives_up_at_max_attempts() {
    // One connection, then the server stops listening.
    let mut server = FakeServer::start(1).await;
    let mut config = test_config(&server.url, 3000);
    config.reconnect.max_attempts = Some(3);
    let (client, hooks) = client(config);
    client.start().await.unwrap();

    let (first, _) = server.accept_handshake().await;
    drop(first);

    hooks
        .wait_for(|e| *e == HookEvent::Close(RECONNECT_EXHAUSTED.into()))
        .await;
    let delays: Vec<_> = hooks
        .events()
        .into_iter()
        .filter_map(|e| match e {
            HookEvent::Reconnecting { attempt, delay } => Some((attempt, delay)),
            _ => None,
        })
        .collect();
    assert_eq!(
        delays,
        vec![
            (1, Duration::from_millis(20)),
            (2, Duration::from_millis(40)),
            (3, Duration::from_millis(80)),
        ]
    );
    assert_eq!(client.state(), SessionState::Closed);
    client.stop().await;
}

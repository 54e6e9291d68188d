//! WebSocket transport to the tunnel server.
//!
//! A connection is split in two: a [`Transport`] handle that any task can use
//! to queue outbound frames or close the connection, and a
//! [`TransportReader`] owned by the read loop. Outbound frames are written by
//! a dedicated writer task so that senders never contend on the socket.

use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use outray_proto::{ClientMessage, encode_client_message};

use super::error::TunnelClientError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Outbound frames buffered per connection.
const OUTBOUND_CAPACITY: usize = 128;

/// How long the writer waits for a close frame to go out.
const CLOSE_FRAME_TIMEOUT: Duration = Duration::from_secs(1);

/// Close reason the server sends when the tunnel is stopped remotely.
pub const SERVER_STOP_REASON: &str = "Tunnel stopped by user";

/// Inbound event seen by the read loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A text frame to hand to the dispatcher.
    Text(String),
    /// A control or binary frame: proof of life, nothing to dispatch.
    Liveness,
}

/// Shared handle to one open connection.
#[derive(Debug)]
pub struct Transport {
    outbound: mpsc::Sender<Message>,
    closed: watch::Sender<bool>,
}

impl Transport {
    fn new() -> (Self, mpsc::Receiver<Message>) {
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (closed, _) = watch::channel(false);
        (Self { outbound, closed }, outbound_rx)
    }

    /// A transport with no socket behind it; frames land on the returned
    /// receiver.
    #[cfg(test)]
    pub(crate) fn detached() -> (std::sync::Arc<Self>, mpsc::Receiver<Message>) {
        let (transport, rx) = Self::new();
        (std::sync::Arc::new(transport), rx)
    }

    /// Encode and queue a protocol message.
    pub async fn send(&self, msg: &ClientMessage) -> Result<(), TunnelClientError> {
        let text = encode_client_message(msg)?;
        self.send_raw(Message::Text(text.into())).await
    }

    /// Queue a WebSocket ping control frame.
    pub async fn ping(&self) -> Result<(), TunnelClientError> {
        self.send_raw(Message::Ping(Vec::new().into())).await
    }

    async fn send_raw(&self, msg: Message) -> Result<(), TunnelClientError> {
        if self.is_closed() {
            return Err(TunnelClientError::NotConnected);
        }
        self.outbound
            .send(msg)
            .await
            .map_err(|_| TunnelClientError::NotConnected)
    }

    /// Close the connection. The read loop observes this as a transport
    /// failure. Idempotent.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn close_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }
}

/// Receiving half of a connection, owned by the read loop.
pub struct TransportReader {
    source: SplitStream<WsStream>,
    closed: watch::Receiver<bool>,
}

impl TransportReader {
    /// Wait for the next inbound event. Any error ends the connection.
    pub async fn next_event(&mut self) -> Result<Inbound, TunnelClientError> {
        let Self { source, closed } = self;
        tokio::select! {
            () = async { let _ = closed.wait_for(|closed| *closed).await; } => {
                Err(TunnelClientError::Connection("Transport closed locally".into()))
            }
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => Ok(Inbound::Text(text.to_string())),
                Some(Ok(Message::Close(frame))) => Err(close_error(frame)),
                Some(Ok(_)) => Ok(Inbound::Liveness),
                Some(Err(e)) => Err(TunnelClientError::Stream(e.to_string())),
                None => Err(TunnelClientError::Connection("Stream ended by server".into())),
            },
        }
    }
}

/// Map a server close frame to the error the read loop reports.
///
/// A normal close carrying [`SERVER_STOP_REASON`] means the tunnel was shut
/// down from the dashboard and must not be retried.
fn close_error(frame: Option<CloseFrame>) -> TunnelClientError {
    match frame {
        Some(f) if f.code == CloseCode::Normal && f.reason.as_str() == SERVER_STOP_REASON => {
            TunnelClientError::StoppedByServer(SERVER_STOP_REASON.to_string())
        }
        Some(f) => TunnelClientError::Stream(format!(
            "Closed by server ({}): {}",
            u16::from(f.code),
            f.reason
        )),
        None => TunnelClientError::Stream("Closed by server".into()),
    }
}

/// Open a WebSocket connection to `url`, bounded by `timeout`.
pub async fn open(
    url: &str,
    timeout: Duration,
) -> Result<(std::sync::Arc<Transport>, TransportReader), TunnelClientError> {
    // Ensure a TLS crypto provider is installed for wss:// endpoints.
    // The `Err` case just means it was already installed.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let (ws, _response) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url))
        .await
        .map_err(|_| {
            TunnelClientError::Connection(format!(
                "Timed out after {}ms connecting to {url}",
                timeout.as_millis()
            ))
        })?
        .map_err(|e| TunnelClientError::Connection(format!("Failed to connect to {url}: {e}")))?;

    let (sink, source) = ws.split();
    let (transport, outbound_rx) = Transport::new();
    let reader = TransportReader {
        source,
        closed: transport.close_signal(),
    };
    tokio::spawn(writer_task(sink, outbound_rx, transport.close_signal()));
    Ok((std::sync::Arc::new(transport), reader))
}

/// Drain queued frames onto the socket until the transport is closed or a
/// write fails.
async fn writer_task(
    mut sink: SplitSink<WsStream, Message>,
    mut outbound_rx: mpsc::Receiver<Message>,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            msg = outbound_rx.recv() => {
                let Some(msg) = msg else { break };
                if let Err(e) = sink.send(msg).await {
                    warn!(error = %e, "Failed to write frame");
                    break;
                }
            }
            () = async { let _ = closed.wait_for(|closed| *closed).await; } => break,
        }
    }
    if tokio::time::timeout(CLOSE_FRAME_TIMEOUT, sink.close())
        .await
        .is_err()
    {
        debug!("Close frame not acknowledged in time");
    }
}

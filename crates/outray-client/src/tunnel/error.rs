//! Tunnel client error types.

/// Errors that can occur in the tunnel client.
#[derive(Debug, thiserror::Error)]
pub enum TunnelClientError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Handshake error: {0}")]
    Handshake(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Stopped by server: {0}")]
    StoppedByServer(String),

    #[error("Not connected")]
    NotConnected,

    #[error(transparent)]
    Codec(#[from] outray_proto::CodecError),
}

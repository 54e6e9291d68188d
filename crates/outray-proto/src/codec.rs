//! JSON text-frame codec.
//!
//! Every frame is a JSON object whose `type` field is read before the rest
//! of the payload. Unknown types decode to `None` so that newer servers can
//! add frames without breaking older clients.

use serde::Deserialize;
use thiserror::Error;

use crate::messages::{ClientMessage, ServerMessage};

/// Errors raised while encoding or decoding a frame.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Invalid frame JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame has no 'type' discriminator")]
    MissingType,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: Option<String>,
}

/// Read only the `type` discriminator of a frame.
pub fn frame_type(data: &str) -> Result<String, CodecError> {
    let envelope: Envelope = serde_json::from_str(data)?;
    envelope.kind.ok_or(CodecError::MissingType)
}

/// Decode an inbound frame. `Ok(None)` means the type is not one this
/// client handles.
pub fn decode_server_message(data: &str) -> Result<Option<ServerMessage>, CodecError> {
    match frame_type(data)?.as_str() {
        "ping" => Ok(Some(ServerMessage::Ping)),
        "pong" => Ok(Some(ServerMessage::Pong)),
        "tunnel_opened" | "error" | "request" => Ok(Some(serde_json::from_str(data)?)),
        _ => Ok(None),
    }
}

/// Encode an outbound frame as JSON text.
pub fn encode_client_message(msg: &ClientMessage) -> Result<String, CodecError> {
    Ok(serde_json::to_string(msg)?)
}

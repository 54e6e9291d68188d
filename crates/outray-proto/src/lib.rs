//! Outray wire protocol
//!
//! Message envelope types exchanged with the tunnel server over a text-framed
//! WebSocket, the JSON codec for them, and the known server error codes.

pub mod codec;
pub mod codes;
pub mod messages;

pub use codec::{CodecError, decode_server_message, encode_client_message};
pub use codes::ErrorCode;
pub use messages::{
    ClientMessage, ErrorMessage, HeaderValue, Headers, OpenTunnel, RequestMessage,
    ResponseMessage, ServerMessage, TunnelOpened, TunnelProtocol,
};

//! Transport kernel: exchange-agnostic pieces the stream is assembled from.
//!
//! - `WsSession` / `TungsteniteWs`: raw WebSocket transport
//! - `WsCodec`: exchange-specific frame encoding and decoding
//! - `WsConnection`: a session paired with its codec
//! - `ReconnectPolicy`: exponential backoff with jitter

pub mod backoff;
pub mod codec;
pub mod ws;

pub use backoff::ReconnectPolicy;
pub use codec::WsCodec;
pub use ws::{TungsteniteWs, WsConfig, WsConnection, WsSession};

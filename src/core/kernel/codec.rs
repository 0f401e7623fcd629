use crate::core::errors::StreamError;
use crate::core::types::{Inbound, Topic};
use tokio_tungstenite::tungstenite::Message;

/// Codec trait for exchange-specific WebSocket message encoding/decoding
///
/// The transport moves raw frames; the codec is the only place that knows the
/// exchange's subscription schema and how to find the topic of an inbound
/// data frame.
pub trait WsCodec: Send + Sync + 'static {
    /// Encode a subscribe request for a single topic
    fn encode_subscription(&self, topic: &Topic) -> Result<Message, StreamError>;

    /// Encode an unsubscribe request for a single topic
    fn encode_unsubscription(&self, topic: &Topic) -> Result<Message, StreamError>;

    /// Application-level keepalive frame, `None` falls back to a protocol ping
    fn encode_ping(&self) -> Option<Message> {
        None
    }

    /// Decode a raw WebSocket message
    ///
    /// Control frames (ping, pong, close) are handled at the transport level
    /// and never reach the codec.
    ///
    /// # Returns
    /// - `Ok(Some(inbound))` - Successfully decoded frame
    /// - `Ok(None)` - Frame was ignored by the codec
    /// - `Err(error)` - Malformed frame
    fn decode_message(&self, message: Message) -> Result<Option<Inbound>, StreamError>;
}

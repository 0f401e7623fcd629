use thiserror::Error;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("Callback for {topic} panicked: {message}")]
    CallbackError { topic: String, message: String },

    #[error("Start error: {0}")]
    StartError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] crate::core::config::ConfigError),
}

impl StreamError {
    /// Errors that end the current connection and hand control to the reconnect supervisor.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::ConnectionError(_) | Self::TransportError(_))
    }

    #[cold]
    #[inline(never)]
    pub fn not_connected() -> Self {
        Self::TransportError("WebSocket not connected".to_string())
    }
}

impl From<serde_json::Error> for StreamError {
    fn from(err: serde_json::Error) -> Self {
        Self::DecodeError(err.to_string())
    }
}

use crate::core::errors::StreamError;
use crate::core::kernel::codec::WsCodec;
use crate::core::types::{Inbound, Topic};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, Secret};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, instrument, trace};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Transport-level WebSocket settings
#[derive(Debug, Clone)]
pub struct WsConfig {
    pub connect_timeout: Duration,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// WebSocket session trait - pure transport layer
///
/// A session is reusable: after `close` (or a transport failure) it can be
/// connected again, which is how the reconnect supervisor drives it.
#[async_trait]
pub trait WsSession: Send + 'static {
    /// Connect to the WebSocket
    async fn connect(&mut self) -> Result<(), StreamError>;

    /// Send a raw message
    async fn send_raw(&mut self, msg: Message) -> Result<(), StreamError>;

    /// Receive the next raw message, `None` once the connection has ended
    async fn next_raw(&mut self) -> Option<Result<Message, StreamError>>;

    /// Close the connection
    async fn close(&mut self) -> Result<(), StreamError>;

    /// Check if the connection is alive
    fn is_connected(&self) -> bool;
}

/// Tungstenite-based WebSocket implementation
pub struct TungsteniteWs {
    url: String,
    auth_token: Option<Secret<String>>,
    write: Option<SplitSink<WsStream, Message>>,
    read: Option<SplitStream<WsStream>>,
    connected: bool,
    config: WsConfig,
}

impl TungsteniteWs {
    /// Create a new WebSocket session
    ///
    /// # Arguments
    /// * `url` - The `ws://` or `wss://` URL to connect to
    pub fn new(url: String) -> Self {
        Self {
            url,
            auth_token: None,
            write: None,
            read: None,
            connected: false,
            config: WsConfig::default(),
        }
    }

    /// Set custom WebSocket configuration
    pub fn with_config(mut self, config: WsConfig) -> Self {
        self.config = config;
        self
    }

    /// Send `Authorization: Bearer <token>` on every handshake
    pub fn with_auth_token(mut self, token: Secret<String>) -> Self {
        self.auth_token = Some(token);
        self
    }

    fn build_request(
        &self,
    ) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, StreamError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| StreamError::ConnectionError(format!("Invalid WebSocket URL: {}", e)))?;

        if let Some(token) = &self.auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))
                .map_err(|_| {
                    StreamError::ConnectionError("Auth token is not a valid header".to_string())
                })?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        Ok(request)
    }
}

#[async_trait]
impl WsSession for TungsteniteWs {
    #[instrument(skip(self))]
    async fn connect(&mut self) -> Result<(), StreamError> {
        if self.connected {
            self.close().await?;
        }

        let request = self.build_request()?;
        let (ws_stream, _) = tokio::time::timeout(self.config.connect_timeout, connect_async(request))
            .await
            .map_err(|_| StreamError::ConnectionError("WebSocket connection timeout".to_string()))?
            .map_err(|e| {
                StreamError::ConnectionError(format!("WebSocket connection failed: {}", e))
            })?;

        let (write, read) = ws_stream.split();
        self.write = Some(write);
        self.read = Some(read);
        self.connected = true;

        Ok(())
    }

    #[instrument(skip(self, msg))]
    async fn send_raw(&mut self, msg: Message) -> Result<(), StreamError> {
        if !self.connected {
            return Err(StreamError::not_connected());
        }

        let write = self.write.as_mut().ok_or_else(|| {
            StreamError::TransportError("WebSocket write stream not available".to_string())
        })?;

        if let Err(e) = write.send(msg).await {
            self.connected = false;
            return Err(StreamError::TransportError(format!(
                "Failed to send WebSocket message: {}",
                e
            )));
        }

        Ok(())
    }

    async fn next_raw(&mut self) -> Option<Result<Message, StreamError>> {
        if !self.connected {
            return Some(Err(StreamError::not_connected()));
        }

        loop {
            let read = self.read.as_mut()?;
            match read.next().await {
                Some(Ok(message)) => match message {
                    Message::Close(frame) => {
                        debug!(?frame, "server closed WebSocket");
                        self.connected = false;
                        return None;
                    }
                    // Tungstenite queues the pong and flushes it on the next
                    // read or write; sending it here would not survive a
                    // cancelled read.
                    Message::Ping(_) => trace!("ping from server"),
                    Message::Frame(_) => {}
                    other => return Some(Ok(other)),
                },
                Some(Err(e)) => {
                    self.connected = false;
                    return Some(Err(StreamError::TransportError(format!(
                        "WebSocket error: {}",
                        e
                    ))));
                }
                None => {
                    self.connected = false;
                    return None;
                }
            }
        }
    }

    #[instrument(skip(self))]
    async fn close(&mut self) -> Result<(), StreamError> {
        if let Some(write) = self.write.as_mut() {
            let _ = write.send(Message::Close(None)).await;
            let _ = write.close().await;
        }
        self.connected = false;
        self.write = None;
        self.read = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

/// A transport session paired with the codec that speaks its protocol
pub struct WsConnection<S, C> {
    session: S,
    codec: C,
}

impl<S: WsSession, C: WsCodec> WsConnection<S, C> {
    pub fn new(session: S, codec: C) -> Self {
        Self { session, codec }
    }

    pub async fn connect(&mut self) -> Result<(), StreamError> {
        self.session.connect().await
    }

    pub async fn close(&mut self) -> Result<(), StreamError> {
        self.session.close().await
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub async fn subscribe(&mut self, topic: &Topic) -> Result<(), StreamError> {
        let message = self.codec.encode_subscription(topic)?;
        debug!(%topic, "subscribe");
        self.session.send_raw(message).await
    }

    pub async fn unsubscribe(&mut self, topic: &Topic) -> Result<(), StreamError> {
        let message = self.codec.encode_unsubscription(topic)?;
        debug!(%topic, "unsubscribe");
        self.session.send_raw(message).await
    }

    pub async fn ping(&mut self) -> Result<(), StreamError> {
        let message = self
            .codec
            .encode_ping()
            .unwrap_or_else(|| Message::Ping(Vec::new()));
        self.session.send_raw(message).await
    }

    /// Next decoded frame, `None` once the connection has ended
    pub async fn next_inbound(&mut self) -> Option<Result<Inbound, StreamError>> {
        loop {
            match self.session.next_raw().await? {
                Ok(Message::Pong(_)) => return Some(Ok(Inbound::Heartbeat)),
                Ok(Message::Close(_)) => return None,
                Ok(Message::Ping(_) | Message::Frame(_)) => {}
                Ok(raw) => match self.codec.decode_message(raw) {
                    Ok(Some(inbound)) => return Some(Ok(inbound)),
                    Ok(None) => {} // Codec chose to ignore this message
                    Err(e) => return Some(Err(e)),
                },
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

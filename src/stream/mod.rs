//! Resilient subscription stream
//!
//! [`Stream`] owns one WebSocket connection, the subscriptions registered on
//! it and a background task that keeps the connection alive:
//!
//! ```rust,no_run
//! use hyperstream::{Stream, StreamConfig};
//!
//! # async fn demo() -> Result<(), hyperstream::StreamError> {
//! let stream = Stream::new(StreamConfig::new("wss://api.hyperliquid.xyz/ws"))
//!     .on_reconnect(|attempt| println!("reconnected after {attempt} attempts"));
//!
//! stream.trades(&["BTC", "ETH"], |payload| println!("{payload}"));
//! stream.start()?;
//!
//! tokio::signal::ctrl_c().await.ok();
//! stream.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod dispatcher;
pub mod hooks;
pub mod registry;
mod supervisor;

pub use dispatcher::Dispatcher;
pub use hooks::{StateCell, StreamHooks};
pub use registry::{Callback, Registry, RegistryCommand, SubscriptionInfo};

use crate::core::config::StreamConfig;
use crate::core::errors::StreamError;
use crate::core::kernel::{ReconnectPolicy, TungsteniteWs, WsCodec, WsConfig, WsConnection, WsSession};
use crate::core::types::{Channel, ConnectionState, Payload, SubscriptionId, SubscriptionOptions};
use crate::exchanges::hyperliquid::HyperliquidCodec;
use parking_lot::Mutex;
use std::sync::Arc;
use supervisor::Supervisor;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

enum Lifecycle<S, C> {
    Idle { session: S, codec: C },
    Running {
        cancel: CancellationToken,
        handle: JoinHandle<()>,
    },
    /// A `stop` call is waiting for the task to finish
    Stopping,
    Stopped,
}

/// Subscription stream over a single reconnecting connection.
///
/// Subscriptions can be registered before or after [`Stream::start`]; they
/// are sent once the connection is up and replayed after every reconnect.
/// Errors after `start` are reported through [`Stream::on_error`], never
/// returned.
pub struct Stream<S = TungsteniteWs, C = HyperliquidCodec> {
    config: StreamConfig,
    hooks: StreamHooks,
    registry: Arc<Registry>,
    state: Arc<StateCell>,
    lifecycle: Mutex<Lifecycle<S, C>>,
}

impl Stream {
    /// Stream over the Tungstenite transport speaking the Hyperliquid protocol.
    pub fn new(config: StreamConfig) -> Self {
        // An invalid endpoint is reported by `start`
        let url = config
            .websocket_url()
            .unwrap_or_else(|_| config.endpoint().to_string());

        let mut session = TungsteniteWs::new(url).with_config(WsConfig {
            connect_timeout: config.connect_timeout,
        });
        if let Some(token) = &config.auth_token {
            session = session.with_auth_token(token.clone());
        }

        Self::with_session(config, session, HyperliquidCodec::new())
    }
}

impl<S: WsSession, C: WsCodec> Stream<S, C> {
    /// Stream over a caller-provided transport and codec.
    pub fn with_session(config: StreamConfig, session: S, codec: C) -> Self {
        Self {
            config,
            hooks: StreamHooks::default(),
            registry: Arc::new(Registry::new()),
            state: Arc::new(StateCell::new()),
            lifecycle: Mutex::new(Lifecycle::Idle { session, codec }),
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    // Hooks

    #[must_use]
    pub fn on_open(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.hooks.on_open = Some(Arc::new(hook));
        self
    }

    /// Fires once, when the stream reaches `Closed`.
    #[must_use]
    pub fn on_close(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.hooks.on_close = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn on_error(mut self, hook: impl Fn(&StreamError) + Send + Sync + 'static) -> Self {
        self.hooks.on_error = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn on_state_change(mut self, hook: impl Fn(ConnectionState) + Send + Sync + 'static) -> Self {
        self.hooks.on_state_change = Some(Arc::new(hook));
        self
    }

    /// Called with the number of failed attempts after a connection that was
    /// lost has been re-established and every subscription replayed.
    #[must_use]
    pub fn on_reconnect(mut self, hook: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.hooks.on_reconnect = Some(Arc::new(hook));
        self
    }

    // Subscriptions

    /// Register a subscription on any market channel.
    ///
    /// On per-symbol channels an empty `symbols` list sends nothing to the
    /// server, which only accepts these channels one coin at a time. The
    /// callback then receives every coin that other subscriptions on the
    /// same channel bring in. Symbols are ignored on channel-wide channels
    /// such as `allMids`. User-keyed channels go through
    /// [`Stream::subscribe_user`].
    ///
    /// Delivery is keyed by channel and coin (plus interval for candles), so
    /// two subscriptions that differ only in book aggregation options both
    /// receive both feeds.
    pub fn subscribe<F>(
        &self,
        channel: Channel,
        symbols: &[&str],
        options: SubscriptionOptions,
        callback: F,
    ) -> SubscriptionId
    where
        F: Fn(&Payload) + Send + Sync + 'static,
    {
        let symbols: Vec<String> = symbols.iter().map(|s| (*s).to_string()).collect();
        self.registry
            .add(channel, &symbols, options, Arc::new(callback))
    }

    /// Register a subscription on a user-keyed channel for one address.
    ///
    /// User payloads do not say which address they belong to, so every
    /// subscription on the same channel receives the data of every address
    /// subscribed on it.
    pub fn subscribe_user<F>(&self, channel: Channel, user: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&Payload) + Send + Sync + 'static,
    {
        self.registry.add_for_user(
            channel,
            user,
            SubscriptionOptions::default(),
            Arc::new(callback),
        )
    }

    pub fn trades<F>(&self, symbols: &[&str], callback: F) -> SubscriptionId
    where
        F: Fn(&Payload) + Send + Sync + 'static,
    {
        self.subscribe(Channel::Trades, symbols, SubscriptionOptions::default(), callback)
    }

    pub fn book_updates<F>(&self, symbols: &[&str], callback: F) -> SubscriptionId
    where
        F: Fn(&Payload) + Send + Sync + 'static,
    {
        self.subscribe(
            Channel::BookUpdates,
            symbols,
            SubscriptionOptions::default(),
            callback,
        )
    }

    /// Aggregated book for one coin; see `n_sig_figs`, `n_levels` and `mantissa`.
    ///
    /// Book messages are routed by coin only. Subscribing to the same coin
    /// twice with different options delivers both aggregations to both
    /// callbacks, interleaved.
    pub fn l2_book<F>(&self, symbol: &str, options: SubscriptionOptions, callback: F) -> SubscriptionId
    where
        F: Fn(&Payload) + Send + Sync + 'static,
    {
        self.subscribe(Channel::L2Book, &[symbol], options, callback)
    }

    pub fn l4_book<F>(&self, symbol: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&Payload) + Send + Sync + 'static,
    {
        self.subscribe(
            Channel::L4Book,
            &[symbol],
            SubscriptionOptions::default(),
            callback,
        )
    }

    /// Best bid and offer for one coin.
    pub fn bbo<F>(&self, symbol: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&Payload) + Send + Sync + 'static,
    {
        self.subscribe(Channel::Bbo, &[symbol], SubscriptionOptions::default(), callback)
    }

    /// Funding, open interest and volume context for one coin.
    pub fn active_asset_ctx<F>(&self, symbol: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&Payload) + Send + Sync + 'static,
    {
        self.subscribe(
            Channel::ActiveAssetCtx,
            &[symbol],
            SubscriptionOptions::default(),
            callback,
        )
    }

    pub fn blocks<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Payload) + Send + Sync + 'static,
    {
        self.subscribe(Channel::Blocks, &[], SubscriptionOptions::default(), callback)
    }

    pub fn all_mids<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Payload) + Send + Sync + 'static,
    {
        self.subscribe(Channel::AllMids, &[], SubscriptionOptions::default(), callback)
    }

    /// Candles for one coin, `interval` as the exchange spells it ("1m", "1h", ...).
    pub fn candle<F>(&self, symbol: &str, interval: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&Payload) + Send + Sync + 'static,
    {
        self.subscribe(
            Channel::Candle,
            &[symbol],
            SubscriptionOptions::default().with_interval(interval),
            callback,
        )
    }

    pub fn order_updates<F>(&self, user: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&Payload) + Send + Sync + 'static,
    {
        self.subscribe_user(Channel::OrderUpdates, user, callback)
    }

    pub fn open_orders<F>(&self, user: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&Payload) + Send + Sync + 'static,
    {
        self.subscribe_user(Channel::OpenOrders, user, callback)
    }

    pub fn user_fills<F>(&self, user: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&Payload) + Send + Sync + 'static,
    {
        self.subscribe_user(Channel::UserFills, user, callback)
    }

    /// Fills, funding payments, liquidations and cancels for one address.
    pub fn user_events<F>(&self, user: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&Payload) + Send + Sync + 'static,
    {
        self.subscribe_user(Channel::UserEvents, user, callback)
    }

    pub fn user_fundings<F>(&self, user: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&Payload) + Send + Sync + 'static,
    {
        self.subscribe_user(Channel::UserFundings, user, callback)
    }

    pub fn user_twap_slice_fills<F>(&self, user: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&Payload) + Send + Sync + 'static,
    {
        self.subscribe_user(Channel::UserTwapSliceFills, user, callback)
    }

    /// Returns `false` if the subscription was already removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.registry.remove(id)
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.registry.all_active().collect()
    }

    // Lifecycle

    /// Spawn the connection task on the current tokio runtime and return.
    ///
    /// Fails with [`StreamError::StartError`] for an invalid configuration,
    /// outside a runtime, or if the stream was already started or stopped.
    pub fn start(&self) -> Result<(), StreamError> {
        self.config
            .validate()
            .map_err(|e| StreamError::StartError(e.to_string()))?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            StreamError::StartError("start() must be called within a tokio runtime".to_string())
        })?;

        let mut lifecycle = self.lifecycle.lock();
        match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Idle { session, codec } => {
                let cancel = CancellationToken::new();
                let supervisor = Supervisor {
                    connection: WsConnection::new(session, codec),
                    registry: self.registry.clone(),
                    dispatcher: Dispatcher::new(self.registry.clone(), self.hooks.clone()),
                    hooks: self.hooks.clone(),
                    state: self.state.clone(),
                    policy: ReconnectPolicy::new(self.config.backoff.clone()),
                    reconnect: self.config.reconnect,
                    ping_interval: self.config.ping_interval,
                    cancel: cancel.clone(),
                };
                let handle = runtime.spawn(supervisor.run());
                *lifecycle = Lifecycle::Running { cancel, handle };
                info!(subscriptions = self.registry.len(), "stream started");
                Ok(())
            }
            running @ Lifecycle::Running { .. } => {
                *lifecycle = running;
                Err(StreamError::StartError("stream already started".to_string()))
            }
            Lifecycle::Stopping => {
                *lifecycle = Lifecycle::Stopping;
                Err(StreamError::StartError("stream is stopping".to_string()))
            }
            Lifecycle::Stopped => Err(StreamError::StartError(
                "stream has been stopped".to_string(),
            )),
        }
    }

    /// Start, then wait until the stream closes.
    pub async fn run(&self) -> Result<(), StreamError> {
        self.start()?;
        self.wait().await;
        Ok(())
    }

    /// Shut the stream down and wait for its task to finish.
    ///
    /// A callback in progress is allowed to complete; the task is aborted
    /// if it has not finished within `stop_grace_period`. Subscriptions are
    /// cleared and the state ends `Closed`. A concurrent or repeated call
    /// returns once the stream is `Closed`.
    pub async fn stop(&self) {
        let previous = {
            let mut lifecycle = self.lifecycle.lock();
            if matches!(*lifecycle, Lifecycle::Stopping | Lifecycle::Stopped) {
                None
            } else {
                Some(std::mem::replace(&mut *lifecycle, Lifecycle::Stopping))
            }
        };
        let Some(previous) = previous else {
            self.wait().await;
            return;
        };

        match previous {
            Lifecycle::Running { cancel, mut handle } => {
                cancel.cancel();
                match tokio::time::timeout(self.config.stop_grace_period, &mut handle).await {
                    Ok(Ok(())) => debug!("stream task finished"),
                    Ok(Err(e)) => warn!(error = %e, "stream task ended abnormally"),
                    Err(_) => {
                        warn!(
                            grace_ms = self.config.stop_grace_period.as_millis() as u64,
                            "stream task did not stop in time, aborting"
                        );
                        handle.abort();
                        let _ = handle.await;
                    }
                }
            }
            Lifecycle::Idle { .. } => debug!("stopping a stream that never started"),
            Lifecycle::Stopping | Lifecycle::Stopped => {}
        }

        *self.lifecycle.lock() = Lifecycle::Stopped;
        self.registry.clear();
        if self.state.transition(ConnectionState::Closed, &self.hooks) {
            self.hooks.emit_close();
        }
    }

    /// Resolves once the stream is `Closed`.
    pub async fn wait(&self) {
        self.wait_for_state(ConnectionState::Closed).await;
    }

    /// Resolves when the stream reaches `state`, or `Closed`, whichever is
    /// first. Returns the state that was observed.
    pub async fn wait_for_state(&self, state: ConnectionState) -> ConnectionState {
        let mut changes = self.state.subscribe();
        let observed = match changes
            .wait_for(|current| *current == state || current.is_closed())
            .await
        {
            Ok(current) => *current,
            // The sender lives as long as `self`
            Err(_) => self.state.get(),
        };
        observed
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Receiver that observes every state change.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_running(&self) -> bool {
        matches!(&*self.lifecycle.lock(), Lifecycle::Running { .. })
    }
}

impl<S, C> Drop for Stream<S, C> {
    fn drop(&mut self) {
        if let Lifecycle::Running { cancel, .. } = self.lifecycle.get_mut() {
            cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> StreamConfig {
        StreamConfig::new("wss://api.hyperliquid.xyz/ws")
    }

    #[test]
    fn test_start_outside_runtime_fails() {
        let stream = Stream::new(config());
        let err = stream.start().unwrap_err();
        assert!(matches!(err, StreamError::StartError(_)));
        assert!(!stream.is_running());
    }

    #[tokio::test]
    async fn test_invalid_endpoint_is_start_error() {
        let stream = Stream::new(StreamConfig::new("not a url"));
        assert!(matches!(stream.start(), Err(StreamError::StartError(_))));
        assert_eq!(stream.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_stop_before_start_closes_once() {
        let closed = Arc::new(AtomicUsize::new(0));
        let counter = closed.clone();
        let stream = Stream::new(config()).on_close(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        stream.trades(&["BTC"], |_| {});

        stream.stop().await;
        stream.stop().await;

        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(stream.state(), ConnectionState::Closed);
        assert!(stream.subscriptions().is_empty());
        assert!(matches!(stream.start(), Err(StreamError::StartError(_))));
        assert_eq!(stream.wait_for_state(ConnectionState::Connected).await, ConnectionState::Closed);
    }

    #[test]
    fn test_helpers_register_expected_channels() {
        let stream = Stream::new(config());
        stream.trades(&["BTC", "ETH"], |_| {});
        stream.l2_book("BTC", SubscriptionOptions::default().with_n_levels(20), |_| {});
        stream.candle("SOL", "1m", |_| {});
        stream.blocks(|_| {});
        stream.bbo("ETH", |_| {});
        stream.active_asset_ctx("BTC", |_| {});
        stream.user_fills("0xabc", |_| {});
        stream.order_updates("0xabc", |_| {});

        let subscriptions = stream.subscriptions();
        let channels: Vec<Channel> = subscriptions.iter().map(|info| info.channel).collect();
        assert_eq!(
            channels,
            vec![
                Channel::Trades,
                Channel::L2Book,
                Channel::Candle,
                Channel::Blocks,
                Channel::Bbo,
                Channel::ActiveAssetCtx,
                Channel::UserFills,
                Channel::OrderUpdates,
            ]
        );
        assert_eq!(subscriptions[0].symbols, vec!["BTC".to_string(), "ETH".to_string()]);
        assert_eq!(subscriptions[2].options.interval.as_deref(), Some("1m"));
        assert!(subscriptions[3].symbols.is_empty());
        assert_eq!(subscriptions[6].user.as_deref(), Some("0xabc"));
        assert!(subscriptions[6].symbols.is_empty());
    }

    #[test]
    fn test_empty_symbols_on_per_symbol_channel_sends_nothing() {
        let stream = Stream::new(config());
        stream.trades(&[], |_| {});
        stream.user_fills("  ", |_| {});

        let subscriptions = stream.subscriptions();
        assert_eq!(subscriptions.len(), 2);
        assert!(subscriptions.iter().all(SubscriptionInfo::is_route_only));
    }
}

use serde::{Deserialize, Serialize};
use std::fmt;

/// Decoded server payload handed to subscription callbacks.
pub type Payload = serde_json::Value;

/// Lifecycle of the single transport connection owned by a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

impl ConnectionState {
    pub const fn is_closed(self) -> bool {
        matches!(self, Self::Closed)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Channel {
    Trades,
    BookUpdates,
    L2Book,
    L4Book,
    Bbo,
    ActiveAssetCtx,
    Candle,
    Blocks,
    AllMids,
    OrderUpdates,
    OpenOrders,
    UserFills,
    UserEvents,
    UserFundings,
    UserTwapSliceFills,
}

/// What a channel's wire subscription is keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelScope {
    /// One subscription per coin
    Symbol,
    /// One subscription per user address
    User,
    /// A single subscription for the whole channel
    Global,
}

impl Channel {
    pub const ALL: [Self; 15] = [
        Self::Trades,
        Self::BookUpdates,
        Self::L2Book,
        Self::L4Book,
        Self::Bbo,
        Self::ActiveAssetCtx,
        Self::Candle,
        Self::Blocks,
        Self::AllMids,
        Self::OrderUpdates,
        Self::OpenOrders,
        Self::UserFills,
        Self::UserEvents,
        Self::UserFundings,
        Self::UserTwapSliceFills,
    ];

    pub const fn wire_name(self) -> &'static str {
        match self {
            Self::Trades => "trades",
            Self::BookUpdates => "bookUpdates",
            Self::L2Book => "l2Book",
            Self::L4Book => "l4Book",
            Self::Bbo => "bbo",
            Self::ActiveAssetCtx => "activeAssetCtx",
            Self::Candle => "candle",
            Self::Blocks => "blocks",
            Self::AllMids => "allMids",
            Self::OrderUpdates => "orderUpdates",
            Self::OpenOrders => "openOrders",
            Self::UserFills => "userFills",
            Self::UserEvents => "userEvents",
            Self::UserFundings => "userFundings",
            Self::UserTwapSliceFills => "userTwapSliceFills",
        }
    }

    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|channel| channel.wire_name() == name)
    }

    pub const fn scope(self) -> ChannelScope {
        match self {
            Self::Trades
            | Self::BookUpdates
            | Self::L2Book
            | Self::L4Book
            | Self::Bbo
            | Self::ActiveAssetCtx
            | Self::Candle => ChannelScope::Symbol,
            Self::OrderUpdates
            | Self::OpenOrders
            | Self::UserFills
            | Self::UserEvents
            | Self::UserFundings
            | Self::UserTwapSliceFills => ChannelScope::User,
            Self::Blocks | Self::AllMids => ChannelScope::Global,
        }
    }

    /// Channels that are subscribed one coin at a time.
    pub const fn is_per_symbol(self) -> bool {
        matches!(self.scope(), ChannelScope::Symbol)
    }

    /// Channels that are subscribed one user address at a time.
    pub const fn is_per_user(self) -> bool {
        matches!(self.scope(), ChannelScope::User)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Per-subscription parameters. Part of the subscription identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionOptions {
    /// Price aggregation in significant figures (L2 book)
    pub n_sig_figs: Option<u32>,
    /// Book depth (L2 book)
    pub n_levels: Option<u32>,
    pub mantissa: Option<u32>,
    /// Candle interval, e.g. "1m"
    pub interval: Option<String>,
}

impl SubscriptionOptions {
    #[must_use]
    pub fn with_n_sig_figs(mut self, n_sig_figs: u32) -> Self {
        self.n_sig_figs = Some(n_sig_figs);
        self
    }

    #[must_use]
    pub fn with_n_levels(mut self, n_levels: u32) -> Self {
        self.n_levels = Some(n_levels);
        self
    }

    #[must_use]
    pub fn with_mantissa(mut self, mantissa: u32) -> Self {
        self.mantissa = Some(mantissa);
        self
    }

    #[must_use]
    pub fn with_interval(mut self, interval: impl Into<String>) -> Self {
        self.interval = Some(interval.into());
        self
    }
}

/// Routing key for inbound data.
///
/// The server tags market data with the channel and coin, and candles with
/// their interval as well. Book aggregation options and user addresses are
/// never echoed back, so they take no part in routing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteKey {
    pub channel: Channel,
    pub symbol: Option<String>,
    /// Candle interval; `None` on every other channel
    pub interval: Option<String>,
}

impl RouteKey {
    pub fn new(channel: Channel, symbol: Option<String>) -> Self {
        Self {
            channel,
            symbol,
            interval: None,
        }
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Option<String>) -> Self {
        self.interval = interval;
        self
    }

    /// Route that receives every message of the channel regardless of coin.
    pub const fn channel_wide(channel: Channel) -> Self {
        Self {
            channel,
            symbol: None,
            interval: None,
        }
    }

    pub fn is_channel_wide(&self) -> bool {
        self.symbol.is_none() && self.interval.is_none()
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.channel)?;
        if let Some(symbol) = &self.symbol {
            write!(f, ":{}", symbol)?;
        }
        if let Some(interval) = &self.interval {
            write!(f, ":{}", interval)?;
        }
        Ok(())
    }
}

/// One wire-level subscription: exactly one subscribe frame is sent per topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic {
    pub channel: Channel,
    pub symbol: Option<String>,
    /// User address for user-keyed channels, sent as `user`
    pub user: Option<String>,
    pub options: SubscriptionOptions,
}

impl Topic {
    pub fn new(channel: Channel, symbol: Option<String>, options: SubscriptionOptions) -> Self {
        Self {
            channel,
            symbol,
            user: None,
            options,
        }
    }

    pub fn for_user(channel: Channel, user: impl Into<String>, options: SubscriptionOptions) -> Self {
        Self {
            channel,
            symbol: None,
            user: Some(user.into()),
            options,
        }
    }

    /// Route the server's messages for this topic arrive on.
    pub fn route_key(&self) -> RouteKey {
        match (self.channel.scope(), &self.symbol) {
            (ChannelScope::Symbol, Some(symbol)) => {
                let interval = match self.channel {
                    Channel::Candle => self.options.interval.clone(),
                    _ => None,
                };
                RouteKey::new(self.channel, Some(symbol.clone())).with_interval(interval)
            }
            _ => RouteKey::channel_wide(self.channel),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.user {
            Some(user) => write!(f, "{}:{}", self.channel, user),
            None => write!(f, "{}", self.route_key()),
        }
    }
}

/// Handle returned by every subscribe call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub route: RouteKey,
    pub payload: Payload,
}

/// Result of decoding one transport frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Data(InboundMessage),
    /// Application-level pong
    Heartbeat,
    /// Subscription acknowledgement
    Ack,
    ServerError(String),
}

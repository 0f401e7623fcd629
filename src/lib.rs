pub mod core;
pub mod exchanges;
pub mod stream;

pub use crate::core::{
    config::{BackoffConfig, ConfigError, StreamConfig},
    errors::StreamError,
    types::*,
};
pub use exchanges::hyperliquid::HyperliquidCodec;
pub use stream::{Stream, SubscriptionInfo};

use crate::core::errors::StreamError;
use crate::core::types::Payload;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "B")]
    Buy,
    #[serde(rename = "A")]
    Sell,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsTrade {
    pub coin: String,
    pub side: Side,
    #[serde(with = "rust_decimal::serde::str")]
    pub px: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub sz: Decimal,
    /// Milliseconds since the epoch
    pub time: i64,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub tid: Option<u64>,
}

impl WsTrade {
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.time).single()
    }

    pub fn notional(&self) -> Decimal {
        self.px * self.sz
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct L2Level {
    #[serde(with = "rust_decimal::serde::str")]
    pub px: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub sz: Decimal,
    /// Number of resting orders at this level
    #[serde(default)]
    pub n: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct L2BookUpdate {
    pub coin: String,
    /// `[bids, asks]`, best level first
    pub levels: [Vec<L2Level>; 2],
    #[serde(default)]
    pub time: i64,
}

impl L2BookUpdate {
    pub fn bids(&self) -> &[L2Level] {
        &self.levels[0]
    }

    pub fn asks(&self) -> &[L2Level] {
        &self.levels[1]
    }

    pub fn best_bid(&self) -> Option<&L2Level> {
        self.bids().first()
    }

    pub fn best_ask(&self) -> Option<&L2Level> {
        self.asks().first()
    }

    pub fn spread(&self) -> Option<Decimal> {
        Some(self.best_ask()?.px - self.best_bid()?.px)
    }
}

/// Unwrap the block-event envelope used by some endpoints:
/// `{"block": {"events": [[user, item], ..]}}` yields every `item`.
fn block_events(data: &Value) -> Option<Vec<&Value>> {
    let events = data.get("block")?.get("events")?.as_array()?;
    Some(events.iter().filter_map(|event| event.get(1)).collect())
}

/// Decode the trades carried by a `trades` channel message.
pub fn parse_trades(payload: &Payload) -> Result<Vec<WsTrade>, StreamError> {
    let data = payload
        .get("data")
        .ok_or_else(|| StreamError::DecodeError("trades message has no data".to_string()))?;

    let items: Vec<&Value> = if let Some(events) = block_events(data) {
        events
    } else if let Some(array) = data.as_array() {
        array.iter().collect()
    } else {
        vec![data]
    };

    items
        .into_iter()
        .map(|item| WsTrade::deserialize(item).map_err(StreamError::from))
        .collect()
}

/// Decode an `l2Book` or `bookUpdates` channel message.
pub fn parse_l2_book(payload: &Payload) -> Result<L2BookUpdate, StreamError> {
    let data = payload
        .get("data")
        .ok_or_else(|| StreamError::DecodeError("book message has no data".to_string()))?;

    let book = block_events(data)
        .and_then(|events| events.into_iter().next())
        .unwrap_or(data);

    L2BookUpdate::deserialize(book).map_err(StreamError::from)
}

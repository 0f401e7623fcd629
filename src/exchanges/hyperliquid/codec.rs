use crate::core::errors::StreamError;
use crate::core::kernel::codec::WsCodec;
use crate::core::types::{Channel, ChannelScope, Inbound, InboundMessage, RouteKey, Topic};
use serde::Serialize;
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;
use tracing::trace;

#[derive(Serialize)]
struct WsRequest<'a> {
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    subscription: Option<SubscriptionBody<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionBody<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    coin: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    n_sig_figs: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    n_levels: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mantissa: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    interval: Option<&'a str>,
}

impl<'a> From<&'a Topic> for SubscriptionBody<'a> {
    fn from(topic: &'a Topic) -> Self {
        Self {
            kind: topic.channel.wire_name(),
            coin: topic.symbol.as_deref(),
            user: topic.user.as_deref(),
            n_sig_figs: topic.options.n_sig_figs,
            n_levels: topic.options.n_levels,
            mantissa: topic.options.mantissa,
            interval: topic.options.interval.as_deref(),
        }
    }
}

/// Hyperliquid WebSocket codec
#[derive(Debug, Clone, Copy, Default)]
pub struct HyperliquidCodec;

impl HyperliquidCodec {
    pub fn new() -> Self {
        Self
    }

    fn encode(method: &str, topic: Option<&Topic>) -> Result<Message, StreamError> {
        let request = WsRequest {
            method,
            subscription: topic.map(SubscriptionBody::from),
        };
        let text = serde_json::to_string(&request)
            .map_err(|e| StreamError::TransportError(format!("Failed to encode request: {}", e)))?;
        Ok(Message::Text(text))
    }

    fn decode_text(&self, text: &str) -> Result<Option<Inbound>, StreamError> {
        let parsed: Value = serde_json::from_str(text)?;

        let channel = parsed
            .get("channel")
            .and_then(Value::as_str)
            .ok_or_else(|| StreamError::DecodeError("message has no channel".to_string()))?;

        match channel {
            "pong" => return Ok(Some(Inbound::Heartbeat)),
            "subscriptionResponse" => return Ok(Some(Inbound::Ack)),
            "error" => {
                let message = match parsed.get("data") {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => "unknown server error".to_string(),
                };
                return Ok(Some(Inbound::ServerError(message)));
            }
            _ => {}
        }

        let Some(channel) = Channel::from_wire(channel) else {
            trace!(channel, "ignoring unknown channel");
            return Ok(None);
        };

        let data = parsed.get("data");
        let route = match (channel, channel.scope()) {
            (Channel::Candle, _) => {
                let candle = data.map(first_item);
                RouteKey::new(channel, candle.and_then(|c| str_field(c, "s")))
                    .with_interval(candle.and_then(|c| str_field(c, "i")))
            }
            (_, ChannelScope::Symbol) => RouteKey::new(channel, data.and_then(extract_coin)),
            // User payloads rarely name the user; they route channel-wide.
            (_, ChannelScope::User | ChannelScope::Global) => RouteKey::channel_wide(channel),
        };

        Ok(Some(Inbound::Data(InboundMessage {
            route,
            payload: parsed,
        })))
    }
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

fn first_item(data: &Value) -> &Value {
    data.as_array().and_then(|items| items.first()).unwrap_or(data)
}

/// Find the coin a data frame belongs to.
///
/// Handles the three shapes seen on the wire: an object with `coin`
/// (books, bbo, asset contexts), an array of objects with `coin` (trades), and the
/// block format `{"block": {"events": [[user, {"coin": ..}], ..]}}`.
fn extract_coin(data: &Value) -> Option<String> {
    let coin_of = |value: &Value| str_field(value, "coin");

    coin_of(data)
        .or_else(|| data.as_array().and_then(|items| items.first()).and_then(coin_of))
        .or_else(|| {
            data.get("block")
                .and_then(|block| block.get("events"))
                .and_then(Value::as_array)
                .and_then(|events| events.first())
                .and_then(|event| event.get(1))
                .and_then(coin_of)
        })
}

impl WsCodec for HyperliquidCodec {
    fn encode_subscription(&self, topic: &Topic) -> Result<Message, StreamError> {
        Self::encode("subscribe", Some(topic))
    }

    fn encode_unsubscription(&self, topic: &Topic) -> Result<Message, StreamError> {
        Self::encode("unsubscribe", Some(topic))
    }

    fn encode_ping(&self) -> Option<Message> {
        Self::encode("ping", None).ok()
    }

    fn decode_message(&self, message: Message) -> Result<Option<Inbound>, StreamError> {
        match message {
            Message::Text(text) => self.decode_text(&text),
            Message::Binary(bytes) => {
                let text = std::str::from_utf8(&bytes).map_err(|e| {
                    StreamError::DecodeError(format!("binary frame is not UTF-8: {}", e))
                })?;
                self.decode_text(text)
            }
            Message::Ping(_) | Message::Pong(_) | Message::Close(_) | Message::Frame(_) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::SubscriptionOptions;
    use serde_json::json;

    fn text_of(message: Message) -> Value {
        match message {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("Expected text message, got {:?}", other),
        }
    }

    #[test]
    fn test_encode_trades_subscription() {
        let topic = Topic::new(
            Channel::Trades,
            Some("BTC".to_string()),
            SubscriptionOptions::default(),
        );
        let frame = text_of(HyperliquidCodec::new().encode_subscription(&topic).unwrap());
        assert_eq!(
            frame,
            json!({"method": "subscribe", "subscription": {"type": "trades", "coin": "BTC"}})
        );
    }

    #[test]
    fn test_encode_l2_book_options() {
        let topic = Topic::new(
            Channel::L2Book,
            Some("ETH".to_string()),
            SubscriptionOptions::default()
                .with_n_sig_figs(5)
                .with_n_levels(10),
        );
        let frame = text_of(HyperliquidCodec::new().encode_unsubscription(&topic).unwrap());
        assert_eq!(
            frame,
            json!({
                "method": "unsubscribe",
                "subscription": {"type": "l2Book", "coin": "ETH", "nSigFigs": 5, "nLevels": 10}
            })
        );
    }

    #[test]
    fn test_encode_user_subscription() {
        let topic = Topic::for_user(Channel::UserFills, "0xabc", SubscriptionOptions::default());
        let frame = text_of(HyperliquidCodec::new().encode_subscription(&topic).unwrap());
        assert_eq!(
            frame,
            json!({"method": "subscribe", "subscription": {"type": "userFills", "user": "0xabc"}})
        );
    }

    #[test]
    fn test_encode_candle_and_bbo() {
        let codec = HyperliquidCodec::new();
        let candle = Topic::new(
            Channel::Candle,
            Some("SOL".to_string()),
            SubscriptionOptions::default().with_interval("1h"),
        );
        assert_eq!(
            text_of(codec.encode_subscription(&candle).unwrap()),
            json!({"method": "subscribe", "subscription": {"type": "candle", "coin": "SOL", "interval": "1h"}})
        );

        let bbo = Topic::new(Channel::Bbo, Some("ETH".to_string()), SubscriptionOptions::default());
        assert_eq!(
            text_of(codec.encode_subscription(&bbo).unwrap()),
            json!({"method": "subscribe", "subscription": {"type": "bbo", "coin": "ETH"}})
        );
    }

    #[test]
    fn test_encode_ping() {
        let frame = text_of(HyperliquidCodec::new().encode_ping().unwrap());
        assert_eq!(frame, json!({"method": "ping"}));
    }

    #[test]
    fn test_decode_control_channels() {
        let codec = HyperliquidCodec::new();
        let pong = codec
            .decode_message(Message::Text(r#"{"channel":"pong"}"#.to_string()))
            .unwrap();
        assert_eq!(pong, Some(Inbound::Heartbeat));

        let ack = codec
            .decode_message(Message::Text(
                r#"{"channel":"subscriptionResponse","data":{"method":"subscribe"}}"#.to_string(),
            ))
            .unwrap();
        assert_eq!(ack, Some(Inbound::Ack));

        let error = codec
            .decode_message(Message::Text(
                r#"{"channel":"error","data":"Invalid subscription"}"#.to_string(),
            ))
            .unwrap();
        assert_eq!(
            error,
            Some(Inbound::ServerError("Invalid subscription".to_string()))
        );
    }

    #[test]
    fn test_decode_trades_routes_by_coin() {
        let text = json!({
            "channel": "trades",
            "data": [{"coin": "ETH", "side": "B", "px": "3000.5", "sz": "0.1", "time": 1}]
        })
        .to_string();
        let decoded = HyperliquidCodec::new()
            .decode_message(Message::Text(text))
            .unwrap();

        match decoded {
            Some(Inbound::Data(message)) => {
                assert_eq!(
                    message.route,
                    RouteKey::new(Channel::Trades, Some("ETH".to_string()))
                );
                assert_eq!(message.payload["data"][0]["px"], "3000.5");
            }
            other => panic!("Expected data message, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_block_event_format() {
        let text = json!({
            "channel": "bookUpdates",
            "data": {"block": {"events": [["0xabc", {"coin": "BTC", "levels": [[], []]}]]}}
        })
        .to_string();
        let decoded = HyperliquidCodec::new()
            .decode_message(Message::Binary(text.into_bytes()))
            .unwrap();

        match decoded {
            Some(Inbound::Data(message)) => assert_eq!(
                message.route,
                RouteKey::new(Channel::BookUpdates, Some("BTC".to_string()))
            ),
            other => panic!("Expected data message, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_candle_routes_by_symbol_and_interval() {
        let text = json!({
            "channel": "candle",
            "data": {
                "t": 1, "T": 2, "s": "SOL", "i": "1m",
                "o": "150.1", "c": "150.4", "h": "150.9", "l": "149.8", "v": "1200", "n": 42
            }
        })
        .to_string();
        let decoded = HyperliquidCodec::new()
            .decode_message(Message::Text(text))
            .unwrap();

        match decoded {
            Some(Inbound::Data(message)) => {
                assert_eq!(
                    message.route,
                    RouteKey::new(Channel::Candle, Some("SOL".to_string()))
                        .with_interval(Some("1m".to_string()))
                );
                assert_eq!(message.route.to_string(), "candle:SOL:1m");
            }
            other => panic!("Expected data message, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_bbo_and_asset_ctx_route_by_coin() {
        let codec = HyperliquidCodec::new();
        let bbo = json!({
            "channel": "bbo",
            "data": {"coin": "ETH", "time": 7, "bbo": [{"px": "3000", "sz": "1", "n": 1}, null]}
        });
        let ctx = json!({
            "channel": "activeAssetCtx",
            "data": {"coin": "BTC", "ctx": {"funding": "0.0001", "openInterest": "100"}}
        });

        for (frame, channel, coin) in [(bbo, Channel::Bbo, "ETH"), (ctx, Channel::ActiveAssetCtx, "BTC")] {
            match codec.decode_message(Message::Text(frame.to_string())).unwrap() {
                Some(Inbound::Data(message)) => {
                    assert_eq!(message.route, RouteKey::new(channel, Some(coin.to_string())));
                }
                other => panic!("Expected data message, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_decode_user_channel_routes_channel_wide() {
        let text = json!({
            "channel": "userFills",
            "data": {"isSnapshot": true, "user": "0xabc", "fills": []}
        })
        .to_string();
        let decoded = HyperliquidCodec::new()
            .decode_message(Message::Text(text))
            .unwrap();
        match decoded {
            Some(Inbound::Data(message)) => {
                assert_eq!(message.route, RouteKey::channel_wide(Channel::UserFills));
            }
            other => panic!("Expected data message, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_channel_wide_data() {
        let text = json!({"channel": "allMids", "data": {"mids": {"BTC": "50000"}}}).to_string();
        let decoded = HyperliquidCodec::new()
            .decode_message(Message::Text(text))
            .unwrap();
        match decoded {
            Some(Inbound::Data(message)) => {
                assert_eq!(message.route, RouteKey::channel_wide(Channel::AllMids));
            }
            other => panic!("Expected data message, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_unknown_channel_is_ignored() {
        let decoded = HyperliquidCodec::new()
            .decode_message(Message::Text(
                r#"{"channel":"notification","data":{}}"#.to_string(),
            ))
            .unwrap();
        assert!(decoded.is_none());
    }

    #[test]
    fn test_decode_malformed_frames() {
        let codec = HyperliquidCodec::new();
        assert!(matches!(
            codec.decode_message(Message::Text("not json".to_string())),
            Err(StreamError::DecodeError(_))
        ));
        assert!(matches!(
            codec.decode_message(Message::Text(r#"{"data":[]}"#.to_string())),
            Err(StreamError::DecodeError(_))
        ));
    }
}

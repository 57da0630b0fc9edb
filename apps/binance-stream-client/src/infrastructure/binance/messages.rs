//! Binance Stream Message Types
//!
//! Wire format types for payloads pushed on the raw stream endpoint. Field
//! names follow Binance's single-letter keys; each struct documents the
//! mapping through its serde renames.
//!
//! # Event Types (`e` discriminator)
//!
//! - `kline`: candlestick update
//! - `aggTrade`: aggregate trade
//! - `trade`: raw trade
//! - `24hrMiniTicker`: rolling 24h mini ticker
//! - `24hrTicker`: rolling 24h ticker
//! - `outboundAccountPosition`: user-data balance update
//!
//! # References
//!
//! - [Market streams](https://developers.binance.com/docs/binance-spot-api-docs/web-socket-streams)
//! - [User data stream](https://developers.binance.com/docs/binance-spot-api-docs/user-data-stream)

use chrono::serde::ts_milliseconds;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::subscription::RequestId;
use crate::domain::topic::Interval;

// =============================================================================
// Control Messages
// =============================================================================

/// Error pushed by the server in response to a malformed or refused request.
///
/// # Wire Format (JSON)
/// ```json
/// {"error": {"code": 2, "msg": "Invalid request: unknown variant"}, "id": 3}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("stream error {code}: {msg}")]
pub struct StreamError {
    /// Venue error code.
    pub code: i64,
    /// Human-readable description.
    pub msg: String,
    /// Id of the request the error answers, when the server names one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
}

// =============================================================================
// Market Events
// =============================================================================

/// Candlestick update.
///
/// # Wire Format (JSON)
/// ```json
/// {"e":"kline","E":1672515782136,"s":"BNBBTC","k":{"t":1672515780000,"T":1672515839999,
///  "s":"BNBBTC","i":"1m","f":100,"L":200,"o":"0.0010","c":"0.0020","h":"0.0025",
///  "l":"0.0015","v":"1000","n":100,"x":false,"q":"1.0000","V":"500","Q":"0.500"}}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandleEvent {
    /// Event time.
    #[serde(rename = "E", with = "ts_milliseconds")]
    pub event_time: DateTime<Utc>,
    /// Symbol, uppercase.
    #[serde(rename = "s")]
    pub symbol: String,
    /// The candle.
    #[serde(rename = "k")]
    pub candle: Candle,
}

/// Candle carried by a [`CandleEvent`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    /// Candle open time.
    #[serde(rename = "t", with = "ts_milliseconds")]
    pub open_time: DateTime<Utc>,
    /// Candle close time.
    #[serde(rename = "T", with = "ts_milliseconds")]
    pub close_time: DateTime<Utc>,
    /// Candle interval.
    #[serde(rename = "i")]
    pub interval: Interval,
    /// First trade id in the candle.
    #[serde(rename = "f")]
    pub first_trade_id: i64,
    /// Last trade id in the candle.
    #[serde(rename = "L")]
    pub last_trade_id: i64,
    /// Open price.
    #[serde(rename = "o")]
    pub open: Decimal,
    /// Close price.
    #[serde(rename = "c")]
    pub close: Decimal,
    /// High price.
    #[serde(rename = "h")]
    pub high: Decimal,
    /// Low price.
    #[serde(rename = "l")]
    pub low: Decimal,
    /// Base asset volume.
    #[serde(rename = "v")]
    pub volume: Decimal,
    /// Number of trades.
    #[serde(rename = "n")]
    pub trade_count: u64,
    /// Whether the candle is closed.
    #[serde(rename = "x")]
    pub closed: bool,
    /// Quote asset volume.
    #[serde(rename = "q")]
    pub quote_volume: Decimal,
    /// Taker buy base asset volume.
    #[serde(rename = "V")]
    pub taker_buy_base_volume: Decimal,
    /// Taker buy quote asset volume.
    #[serde(rename = "Q")]
    pub taker_buy_quote_volume: Decimal,
}

/// Aggregate trade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateTradeEvent {
    /// Event time.
    #[serde(rename = "E", with = "ts_milliseconds")]
    pub event_time: DateTime<Utc>,
    /// Symbol, uppercase.
    #[serde(rename = "s")]
    pub symbol: String,
    /// Aggregate trade id.
    #[serde(rename = "a")]
    pub aggregate_trade_id: u64,
    /// Price.
    #[serde(rename = "p")]
    pub price: Decimal,
    /// Quantity.
    #[serde(rename = "q")]
    pub quantity: Decimal,
    /// First trade id.
    #[serde(rename = "f")]
    pub first_trade_id: u64,
    /// Last trade id.
    #[serde(rename = "l")]
    pub last_trade_id: u64,
    /// Trade time.
    #[serde(rename = "T", with = "ts_milliseconds")]
    pub trade_time: DateTime<Utc>,
    /// Whether the buyer was the market maker.
    #[serde(rename = "m")]
    pub buyer_is_maker: bool,
    /// Whether the trade was the best price match.
    #[serde(rename = "M", default)]
    pub best_price_match: bool,
}

/// Raw trade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeEvent {
    /// Event time.
    #[serde(rename = "E", with = "ts_milliseconds")]
    pub event_time: DateTime<Utc>,
    /// Symbol, uppercase.
    #[serde(rename = "s")]
    pub symbol: String,
    /// Trade id.
    #[serde(rename = "t")]
    pub trade_id: u64,
    /// Price.
    #[serde(rename = "p")]
    pub price: Decimal,
    /// Quantity.
    #[serde(rename = "q")]
    pub quantity: Decimal,
    /// Buyer order id (no longer sent on current streams).
    #[serde(rename = "b", default, skip_serializing_if = "Option::is_none")]
    pub buyer_order_id: Option<u64>,
    /// Seller order id (no longer sent on current streams).
    #[serde(rename = "a", default, skip_serializing_if = "Option::is_none")]
    pub seller_order_id: Option<u64>,
    /// Trade time.
    #[serde(rename = "T", with = "ts_milliseconds")]
    pub trade_time: DateTime<Utc>,
    /// Whether the buyer was the market maker.
    #[serde(rename = "m")]
    pub buyer_is_maker: bool,
    /// Whether the trade was the best price match.
    #[serde(rename = "M", default)]
    pub best_price_match: bool,
}

/// Rolling 24h mini ticker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MiniTickerEvent {
    /// Event time.
    #[serde(rename = "E", with = "ts_milliseconds")]
    pub event_time: DateTime<Utc>,
    /// Symbol, uppercase.
    #[serde(rename = "s")]
    pub symbol: String,
    /// Close price.
    #[serde(rename = "c")]
    pub close: Decimal,
    /// Open price.
    #[serde(rename = "o")]
    pub open: Decimal,
    /// High price.
    #[serde(rename = "h")]
    pub high: Decimal,
    /// Low price.
    #[serde(rename = "l")]
    pub low: Decimal,
    /// Base asset volume.
    #[serde(rename = "v")]
    pub volume: Decimal,
    /// Quote asset volume.
    #[serde(rename = "q")]
    pub quote_volume: Decimal,
}

/// Rolling 24h ticker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickerEvent {
    /// Event time.
    #[serde(rename = "E", with = "ts_milliseconds")]
    pub event_time: DateTime<Utc>,
    /// Symbol, uppercase.
    #[serde(rename = "s")]
    pub symbol: String,
    /// Absolute price change.
    #[serde(rename = "p")]
    pub price_change: Decimal,
    /// Price change percent.
    #[serde(rename = "P")]
    pub price_change_percent: Decimal,
    /// Weighted average price.
    #[serde(rename = "w")]
    pub weighted_average_price: Decimal,
    /// Last price before the window opened.
    #[serde(rename = "x")]
    pub previous_close: Decimal,
    /// Last price.
    #[serde(rename = "c")]
    pub last_price: Decimal,
    /// Last quantity.
    #[serde(rename = "Q")]
    pub last_quantity: Decimal,
    /// Best bid price.
    #[serde(rename = "b")]
    pub bid_price: Decimal,
    /// Best bid quantity.
    #[serde(rename = "B")]
    pub bid_quantity: Decimal,
    /// Best ask price.
    #[serde(rename = "a")]
    pub ask_price: Decimal,
    /// Best ask quantity.
    #[serde(rename = "A")]
    pub ask_quantity: Decimal,
    /// Open price.
    #[serde(rename = "o")]
    pub open: Decimal,
    /// High price.
    #[serde(rename = "h")]
    pub high: Decimal,
    /// Low price.
    #[serde(rename = "l")]
    pub low: Decimal,
    /// Base asset volume.
    #[serde(rename = "v")]
    pub volume: Decimal,
    /// Quote asset volume.
    #[serde(rename = "q")]
    pub quote_volume: Decimal,
    /// Statistics open time.
    #[serde(rename = "O", with = "ts_milliseconds")]
    pub open_time: DateTime<Utc>,
    /// Statistics close time.
    #[serde(rename = "C", with = "ts_milliseconds")]
    pub close_time: DateTime<Utc>,
    /// First trade id (-1 when there were no trades).
    #[serde(rename = "F")]
    pub first_trade_id: i64,
    /// Last trade id (-1 when there were no trades).
    #[serde(rename = "L")]
    pub last_trade_id: i64,
    /// Number of trades.
    #[serde(rename = "n")]
    pub trade_count: u64,
}

// =============================================================================
// User Data Events
// =============================================================================

/// Account balance update from the user-data stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountPositionEvent {
    /// Event time.
    #[serde(rename = "E", with = "ts_milliseconds")]
    pub event_time: DateTime<Utc>,
    /// Time of the last account update.
    #[serde(rename = "u", with = "ts_milliseconds")]
    pub last_update_time: DateTime<Utc>,
    /// Changed balances.
    #[serde(rename = "B")]
    pub balances: Vec<AssetBalance>,
}

/// One asset balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetBalance {
    /// Asset name.
    #[serde(rename = "a")]
    pub asset: String,
    /// Free amount.
    #[serde(rename = "f")]
    pub free: Decimal,
    /// Locked amount.
    #[serde(rename = "l")]
    pub locked: Decimal,
}

// =============================================================================
// Decoded Events
// =============================================================================

/// Every event kind the router recognizes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Candlestick update.
    Candle(CandleEvent),
    /// Aggregate trade.
    AggregateTrade(AggregateTradeEvent),
    /// Raw trade.
    Trade(TradeEvent),
    /// Rolling 24h mini ticker.
    MiniTicker(MiniTickerEvent),
    /// Rolling 24h ticker.
    Ticker(TickerEvent),
    /// Account balance update.
    AccountPosition(AccountPositionEvent),
}

impl StreamEvent {
    /// Kind label of the event.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Candle(_) => EventKind::Candle,
            Self::AggregateTrade(_) => EventKind::AggregateTrade,
            Self::Trade(_) => EventKind::Trade,
            Self::MiniTicker(_) => EventKind::MiniTicker,
            Self::Ticker(_) => EventKind::Ticker,
            Self::AccountPosition(_) => EventKind::AccountPosition,
        }
    }

    /// Symbol the event refers to; account events have none.
    #[must_use]
    pub fn symbol(&self) -> Option<&str> {
        match self {
            Self::Candle(e) => Some(&e.symbol),
            Self::AggregateTrade(e) => Some(&e.symbol),
            Self::Trade(e) => Some(&e.symbol),
            Self::MiniTicker(e) => Some(&e.symbol),
            Self::Ticker(e) => Some(&e.symbol),
            Self::AccountPosition(_) => None,
        }
    }
}

/// Event kind labels, used for channels and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// `kline`
    Candle,
    /// `aggTrade`
    AggregateTrade,
    /// `trade`
    Trade,
    /// `24hrMiniTicker`
    MiniTicker,
    /// `24hrTicker`
    Ticker,
    /// `outboundAccountPosition`
    AccountPosition,
}

impl EventKind {
    /// Match a wire discriminator, ignoring ASCII case.
    #[must_use]
    pub fn from_discriminator(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "kline" => Some(Self::Candle),
            "aggtrade" => Some(Self::AggregateTrade),
            "trade" => Some(Self::Trade),
            "24hrminiticker" => Some(Self::MiniTicker),
            "24hrticker" => Some(Self::Ticker),
            "outboundaccountposition" => Some(Self::AccountPosition),
            _ => None,
        }
    }

    /// Snake-case label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Candle => "candle",
            Self::AggregateTrade => "aggregate_trade",
            Self::Trade => "trade",
            Self::MiniTicker => "mini_ticker",
            Self::Ticker => "ticker",
            Self::AccountPosition => "account_position",
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use test_case::test_case;

    use super::*;

    #[test]
    fn candle_event_deserializes() {
        let json = r#"{
            "e":"kline","E":1672515782136,"s":"BNBBTC",
            "k":{"t":1672515780000,"T":1672515839999,"s":"BNBBTC","i":"1m","f":100,"L":200,
                 "o":"0.0010","c":"0.0020","h":"0.0025","l":"0.0015","v":"1000","n":100,
                 "x":false,"q":"1.0000","V":"500","Q":"0.500","B":"123456"}
        }"#;
        let event: CandleEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.symbol, "BNBBTC");
        assert_eq!(event.event_time.timestamp_millis(), 1_672_515_782_136);
        assert_eq!(event.candle.interval, Interval::OneMinute);
        assert_eq!(event.candle.open, Decimal::from_str("0.0010").unwrap());
        assert_eq!(event.candle.high, Decimal::from_str("0.0025").unwrap());
        assert_eq!(event.candle.trade_count, 100);
        assert!(!event.candle.closed);
    }

    #[test]
    fn trade_event_without_order_ids() {
        let json = r#"{"e":"trade","E":1672515782136,"s":"BNBBTC","t":12345,"p":"0.001",
                       "q":"100","T":1672515782136,"m":true,"M":true}"#;
        let event: TradeEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.trade_id, 12345);
        assert!(event.buyer_order_id.is_none());
        assert!(event.buyer_is_maker);
    }

    #[test]
    fn ticker_event_with_no_trades() {
        let json = r#"{"e":"24hrTicker","E":1672515782136,"s":"BNBBTC","p":"0.0015","P":"250.00",
            "w":"0.0018","x":"0.0009","c":"0.0025","Q":"10","b":"0.0024","B":"10","a":"0.0026",
            "A":"100","o":"0.0010","h":"0.0025","l":"0.0010","v":"10000","q":"18",
            "O":0,"C":86400000,"F":-1,"L":-1,"n":0}"#;
        let event: TickerEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.first_trade_id, -1);
        assert_eq!(event.trade_count, 0);
        assert_eq!(event.close_time.timestamp_millis(), 86_400_000);
    }

    #[test]
    fn account_position_event_deserializes() {
        let json = r#"{"e":"outboundAccountPosition","E":1564034571105,"u":1564034571073,
                       "B":[{"a":"ETH","f":"10000.000000","l":"0.000000"}]}"#;
        let event: AccountPositionEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.balances.len(), 1);
        assert_eq!(event.balances[0].asset, "ETH");
        assert_eq!(event.balances[0].free, Decimal::from(10_000));
    }

    #[test]
    fn stream_error_display() {
        let error: StreamError =
            serde_json::from_str(r#"{"code":2,"msg":"Invalid request"}"#).unwrap();
        assert_eq!(error.to_string(), "stream error 2: Invalid request");
        assert!(error.id.is_none());
    }

    #[test_case("kline", Some(EventKind::Candle))]
    #[test_case("aggTrade", Some(EventKind::AggregateTrade))]
    #[test_case("AGGTRADE", Some(EventKind::AggregateTrade))]
    #[test_case("trade", Some(EventKind::Trade))]
    #[test_case("24hrMiniTicker", Some(EventKind::MiniTicker))]
    #[test_case("24hrTicker", Some(EventKind::Ticker))]
    #[test_case("outboundAccountPosition", Some(EventKind::AccountPosition))]
    #[test_case("depthUpdate", None)]
    fn discriminators(value: &str, expected: Option<EventKind>) {
        assert_eq!(EventKind::from_discriminator(value), expected);
    }
}

//! Stream Topics
//!
//! A topic names one feed on the combined stream endpoint. Market feeds
//! follow `<symbol>@<kind>[_<param>]` with a lowercase symbol, wildcard
//! feeds start with `!`, and the user-data feed is addressed by its bare
//! listen key.
//!
//! # Examples
//!
//! ```text
//! btcusdt@kline_1m
//! ethbtc@aggTrade
//! !miniTicker@arr
//! pqia91ma19a5s61cv6a81va65sdf19v8a65a1a5s61cv6a81va65sdf19v8a65a1
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// =============================================================================
// Errors
// =============================================================================

/// Errors produced when validating a topic string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    /// Topic string is empty.
    #[error("topic cannot be empty")]
    Empty,

    /// Topic contains whitespace or control characters.
    #[error("topic contains invalid characters: {0:?}")]
    InvalidCharacters(String),

    /// Symbol portion before `@` is missing.
    #[error("topic is missing a symbol: {0:?}")]
    MissingSymbol(String),

    /// Feed portion after `@` is missing.
    #[error("topic is missing a stream kind: {0:?}")]
    MissingKind(String),

    /// Interval code is not one of the supported candle intervals.
    #[error("unknown interval code: {0:?}")]
    UnknownInterval(String),
}

// =============================================================================
// Interval
// =============================================================================

/// Candle interval accepted by kline streams and the klines endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Interval {
    /// One minute.
    #[serde(rename = "1m")]
    OneMinute,
    /// Three minutes.
    #[serde(rename = "3m")]
    ThreeMinutes,
    /// Five minutes.
    #[serde(rename = "5m")]
    FiveMinutes,
    /// Fifteen minutes.
    #[serde(rename = "15m")]
    FifteenMinutes,
    /// Thirty minutes.
    #[serde(rename = "30m")]
    ThirtyMinutes,
    /// One hour.
    #[serde(rename = "1h")]
    OneHour,
    /// Two hours.
    #[serde(rename = "2h")]
    TwoHours,
    /// Four hours.
    #[serde(rename = "4h")]
    FourHours,
    /// Six hours.
    #[serde(rename = "6h")]
    SixHours,
    /// Eight hours.
    #[serde(rename = "8h")]
    EightHours,
    /// Twelve hours.
    #[serde(rename = "12h")]
    TwelveHours,
    /// One day.
    #[serde(rename = "1d")]
    OneDay,
    /// Three days.
    #[serde(rename = "3d")]
    ThreeDays,
    /// One week.
    #[serde(rename = "1w")]
    OneWeek,
    /// One calendar month.
    #[serde(rename = "1M")]
    OneMonth,
}

impl Interval {
    /// Every supported interval, shortest first.
    pub const ALL: [Self; 15] = [
        Self::OneMinute,
        Self::ThreeMinutes,
        Self::FiveMinutes,
        Self::FifteenMinutes,
        Self::ThirtyMinutes,
        Self::OneHour,
        Self::TwoHours,
        Self::FourHours,
        Self::SixHours,
        Self::EightHours,
        Self::TwelveHours,
        Self::OneDay,
        Self::ThreeDays,
        Self::OneWeek,
        Self::OneMonth,
    ];

    /// Wire code used in topic names and REST parameters.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::OneMinute => "1m",
            Self::ThreeMinutes => "3m",
            Self::FiveMinutes => "5m",
            Self::FifteenMinutes => "15m",
            Self::ThirtyMinutes => "30m",
            Self::OneHour => "1h",
            Self::TwoHours => "2h",
            Self::FourHours => "4h",
            Self::SixHours => "6h",
            Self::EightHours => "8h",
            Self::TwelveHours => "12h",
            Self::OneDay => "1d",
            Self::ThreeDays => "3d",
            Self::OneWeek => "1w",
            Self::OneMonth => "1M",
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Interval {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|interval| interval.code() == s)
            .ok_or_else(|| TopicError::UnknownInterval(s.to_string()))
    }
}

// =============================================================================
// Topic
// =============================================================================

/// A validated stream topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Topic(String);

impl Topic {
    /// Validate and normalize a topic string.
    ///
    /// The symbol part of `<symbol>@<kind>` topics is lowercased; wildcard
    /// topics and listen keys are kept verbatim.
    ///
    /// # Errors
    ///
    /// Returns `TopicError` if the string does not follow the topic grammar.
    pub fn parse(raw: &str) -> Result<Self, TopicError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(TopicError::Empty);
        }
        if raw.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(TopicError::InvalidCharacters(raw.to_string()));
        }

        if let Some(rest) = raw.strip_prefix('!') {
            if rest.is_empty() {
                return Err(TopicError::MissingKind(raw.to_string()));
            }
            return Ok(Self(raw.to_string()));
        }

        match raw.split_once('@') {
            Some(("", _)) => Err(TopicError::MissingSymbol(raw.to_string())),
            Some((_, "")) => Err(TopicError::MissingKind(raw.to_string())),
            Some((symbol, kind)) => Ok(Self(format!("{}@{kind}", symbol.to_lowercase()))),
            None => Ok(Self(raw.to_string())),
        }
    }

    /// Kline/candlestick stream for a symbol and interval.
    #[must_use]
    pub fn kline(symbol: &str, interval: Interval) -> Self {
        Self::market(symbol, &format!("kline_{}", interval.code()))
    }

    /// Aggregate trade stream for a symbol.
    #[must_use]
    pub fn aggregate_trade(symbol: &str) -> Self {
        Self::market(symbol, "aggTrade")
    }

    /// Raw trade stream for a symbol.
    #[must_use]
    pub fn trade(symbol: &str) -> Self {
        Self::market(symbol, "trade")
    }

    /// Rolling 24h mini ticker for a symbol.
    #[must_use]
    pub fn mini_ticker(symbol: &str) -> Self {
        Self::market(symbol, "miniTicker")
    }

    /// Rolling 24h mini tickers for every symbol.
    #[must_use]
    pub fn all_mini_tickers() -> Self {
        Self("!miniTicker@arr".to_string())
    }

    /// Rolling 24h ticker for a symbol.
    #[must_use]
    pub fn ticker(symbol: &str) -> Self {
        Self::market(symbol, "ticker")
    }

    /// Rolling 24h tickers for every symbol.
    #[must_use]
    pub fn all_tickers() -> Self {
        Self("!ticker@arr".to_string())
    }

    /// Best bid/ask stream for a symbol.
    #[must_use]
    pub fn book_ticker(symbol: &str) -> Self {
        Self::market(symbol, "bookTicker")
    }

    /// Best bid/ask stream for every symbol.
    #[must_use]
    pub fn all_book_tickers() -> Self {
        Self("!bookTicker".to_string())
    }

    /// User-data stream addressed by its listen key.
    #[must_use]
    pub fn account(listen_key: &str) -> Self {
        Self(listen_key.trim().to_string())
    }

    /// The topic as it appears on the wire.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn market(symbol: &str, kind: &str) -> Self {
        Self(format!("{}@{kind}", symbol.trim().to_lowercase()))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Topic {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Topic {
    type Error = TopicError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Topic> for String {
    fn from(topic: Topic) -> Self {
        topic.0
    }
}

impl AsRef<str> for Topic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use test_case::test_case;

    use super::*;

    #[test_case(Interval::OneMinute, "1m")]
    #[test_case(Interval::FifteenMinutes, "15m")]
    #[test_case(Interval::TwelveHours, "12h")]
    #[test_case(Interval::OneWeek, "1w")]
    #[test_case(Interval::OneMonth, "1M")]
    fn interval_codes(interval: Interval, code: &str) {
        assert_eq!(interval.code(), code);
        assert_eq!(code.parse::<Interval>().unwrap(), interval);
        assert_eq!(
            serde_json::to_string(&interval).unwrap(),
            format!("\"{code}\"")
        );
    }

    #[test]
    fn interval_codes_are_case_sensitive() {
        // "1m" is a minute, "1M" a month
        assert_eq!("1M".parse::<Interval>().unwrap(), Interval::OneMonth);
        assert!("1H".parse::<Interval>().is_err());
    }

    #[test_case(Topic::kline("BTCUSDT", Interval::OneMinute), "btcusdt@kline_1m")]
    #[test_case(Topic::aggregate_trade("EthBtc"), "ethbtc@aggTrade")]
    #[test_case(Topic::trade("bnbusdt"), "bnbusdt@trade")]
    #[test_case(Topic::mini_ticker("BTCUSDT"), "btcusdt@miniTicker")]
    #[test_case(Topic::all_mini_tickers(), "!miniTicker@arr")]
    #[test_case(Topic::ticker("BTCUSDT"), "btcusdt@ticker")]
    #[test_case(Topic::all_tickers(), "!ticker@arr")]
    #[test_case(Topic::book_ticker("BTCUSDT"), "btcusdt@bookTicker")]
    #[test_case(Topic::all_book_tickers(), "!bookTicker")]
    fn topic_constructors(topic: Topic, expected: &str) {
        assert_eq!(topic.as_str(), expected);
    }

    #[test]
    fn listen_key_kept_verbatim() {
        let key = "pqia91ma19a5s61cv6a81va65sdf19v8a65a1a5s61cv6a81va65sdf19v8a65a1";
        assert_eq!(Topic::account(key).as_str(), key);
        assert_eq!(Topic::parse(key).unwrap().as_str(), key);
    }

    #[test]
    fn parse_lowercases_symbol_only() {
        let topic = Topic::parse("BTCUSDT@aggTrade").unwrap();
        assert_eq!(topic.as_str(), "btcusdt@aggTrade");
    }

    #[test_case("" ; "empty")]
    #[test_case("   " ; "blank")]
    #[test_case("@trade" ; "missing symbol")]
    #[test_case("btcusdt@" ; "missing kind")]
    #[test_case("!" ; "bare bang")]
    #[test_case("btc usdt@trade" ; "inner whitespace")]
    fn parse_rejects(raw: &str) {
        assert!(Topic::parse(raw).is_err());
    }

    #[test]
    fn serde_is_transparent_string() {
        let topic = Topic::trade("btcusdt");
        assert_eq!(serde_json::to_string(&topic).unwrap(), "\"btcusdt@trade\"");

        let parsed: Topic = serde_json::from_str("\"ethbtc@kline_5m\"").unwrap();
        assert_eq!(parsed, Topic::kline("ethbtc", Interval::FiveMinutes));

        assert!(serde_json::from_str::<Topic>("\"\"").is_err());
    }

    proptest! {
        #[test]
        fn constructed_kline_topics_reparse_unchanged(
            symbol in "[A-Za-z0-9]{2,12}",
            index in 0usize..15,
        ) {
            let topic = Topic::kline(&symbol, Interval::ALL[index]);
            let reparsed = Topic::parse(topic.as_str()).unwrap();
            prop_assert_eq!(&reparsed, &topic);
            let symbol = topic.as_str().split('@').next().unwrap();
            prop_assert!(!symbol.chars().any(char::is_uppercase));
        }
    }
}

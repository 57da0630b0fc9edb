//! Stream Codec Module
//!
//! JSON encoding of control requests and decoding of inbound frames.
//!
//! Inbound frames are one of:
//!
//! ```json
//! {"result": null, "id": 1}                                  // acknowledgement
//! {"error": {"code": 2, "msg": "Invalid request"}, "id": 1}  // request error
//! {"e": "trade", "E": 1672515782136, "s": "BNBBTC", ...}     // event
//! [{"e": "24hrMiniTicker", ...}, {"e": "24hrMiniTicker", ...}]  // event batch
//! ```
//!
//! Combined-stream envelopes (`{"stream": "...", "data": {...}}`) are
//! unwrapped, so the codec works against either endpoint style.

use serde_json::{Map, Value};

use super::messages::{
    AccountPositionEvent, AggregateTradeEvent, CandleEvent, EventKind, MiniTickerEvent,
    StreamError, StreamEvent, TickerEvent, TradeEvent,
};
use crate::domain::subscription::{RequestId, SubscriptionRequest};

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// A required field is absent or has the wrong type.
    #[error("missing or invalid field: {0}")]
    MissingField(&'static str),

    /// Invalid message format.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),
}

/// A decoded inbound frame element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// Acknowledgement of a control request.
    Ack {
        /// Id of the acknowledged request.
        id: RequestId,
    },
    /// Error reported by the server.
    Error(StreamError),
    /// Market or user-data event.
    Event(StreamEvent),
    /// Event with a discriminator this client does not handle.
    Unrecognized(String),
}

/// JSON codec for the stream endpoint.
#[derive(Debug, Default, Clone)]
pub struct JsonCodec;

impl JsonCodec {
    /// Create a new JSON codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Serialize a control request to its wire form.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self, request: &SubscriptionRequest) -> Result<String, CodecError> {
        Ok(serde_json::to_string(request)?)
    }

    /// Parse a text frame into a JSON value.
    ///
    /// # Errors
    ///
    /// Returns an error for text that is not JSON, or JSON that is neither an
    /// object nor an array.
    pub fn parse(&self, text: &str) -> Result<Value, CodecError> {
        let value: Value = serde_json::from_str(text)?;
        match value {
            Value::Object(_) | Value::Array(_) => Ok(value),
            other => Err(CodecError::InvalidFormat(format!(
                "expected JSON object or array, got: {}",
                truncate(&other.to_string())
            ))),
        }
    }

    /// Decode one frame object.
    ///
    /// # Errors
    ///
    /// Returns an error if the object matches no known frame shape or its
    /// payload does not fit the shape's schema.
    pub fn decode_object(&self, value: Value) -> Result<InboundFrame, CodecError> {
        let Value::Object(mut map) = value else {
            return Err(CodecError::InvalidFormat(format!(
                "expected JSON object, got: {}",
                truncate(&value.to_string())
            )));
        };

        if let Some(data) = unwrap_envelope(&mut map) {
            return self.decode_object(data);
        }

        if map.contains_key("result") {
            let id = map
                .get("id")
                .and_then(Value::as_u64)
                .ok_or(CodecError::MissingField("id"))?;
            return Ok(InboundFrame::Ack { id });
        }

        let request_id = map.get("id").and_then(Value::as_u64);

        if let Some(error) = map.remove("error") {
            let mut error: StreamError = serde_json::from_value(error)?;
            error.id = error.id.or(request_id);
            return Ok(InboundFrame::Error(error));
        }

        let discriminator = match map.get("e") {
            Some(Value::String(kind)) => kind.clone(),
            Some(_) => return Err(CodecError::MissingField("e")),
            None if map.contains_key("code") && map.contains_key("msg") => {
                // Flat error form: {"code": 2, "msg": "...", "id": 1}
                let error: StreamError = serde_json::from_value(Value::Object(map))?;
                return Ok(InboundFrame::Error(error));
            }
            None => return Err(CodecError::MissingField("e")),
        };

        let Some(kind) = EventKind::from_discriminator(&discriminator) else {
            return Ok(InboundFrame::Unrecognized(discriminator));
        };

        let payload = Value::Object(map);
        let event = match kind {
            EventKind::Candle => {
                let m: CandleEvent = serde_json::from_value(payload)?;
                StreamEvent::Candle(m)
            }
            EventKind::AggregateTrade => {
                let m: AggregateTradeEvent = serde_json::from_value(payload)?;
                StreamEvent::AggregateTrade(m)
            }
            EventKind::Trade => {
                let m: TradeEvent = serde_json::from_value(payload)?;
                StreamEvent::Trade(m)
            }
            EventKind::MiniTicker => {
                let m: MiniTickerEvent = serde_json::from_value(payload)?;
                StreamEvent::MiniTicker(m)
            }
            EventKind::Ticker => {
                let m: TickerEvent = serde_json::from_value(payload)?;
                StreamEvent::Ticker(m)
            }
            EventKind::AccountPosition => {
                let m: AccountPositionEvent = serde_json::from_value(payload)?;
                StreamEvent::AccountPosition(m)
            }
        };

        Ok(InboundFrame::Event(event))
    }
}

fn unwrap_envelope(map: &mut Map<String, Value>) -> Option<Value> {
    if map.len() == 2 && map.get("stream").is_some_and(Value::is_string) {
        return map.remove("data");
    }
    None
}

fn truncate(text: &str) -> &str {
    let end = text
        .char_indices()
        .nth(50)
        .map_or(text.len(), |(index, _)| index);
    &text[..end]
}

// =============================================================================
// Tests
// =============================================================================

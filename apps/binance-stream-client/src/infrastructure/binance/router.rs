//! Event Router
//!
//! Decodes each inbound text frame and delivers its contents:
//!
//! 1. acknowledgements go to the subscription registry, then the acks channel
//! 2. error frames go to the errors channel and ask for a forced reconnect
//! 3. events go to their kind's broadcast channel
//! 4. arrays are routed element by element, errors and events only; an
//!    acknowledgement inside an array is ignored
//!
//! Frames that fail to decode are logged and counted, never fatal.

use std::sync::Arc;

use serde_json::Value;

use super::codec::{CodecError, InboundFrame, JsonCodec};
use crate::domain::subscription::SubscriptionRegistry;
use crate::infrastructure::broadcast::SharedBroadcastHub;
use crate::infrastructure::metrics;

/// What routing one frame produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteSummary {
    /// Events published.
    pub events: usize,
    /// Acknowledgements applied.
    pub acks: usize,
    /// Server error frames seen.
    pub errors: usize,
    /// Elements that failed to decode.
    pub protocol_errors: usize,
    /// Events with an unhandled discriminator, and acknowledgements inside arrays.
    pub unrecognized: usize,
}

impl RouteSummary {
    /// Whether the frame carried a server error, which forces a reconnect.
    #[must_use]
    pub const fn requires_reconnect(&self) -> bool {
        self.errors > 0
    }
}

/// Routes inbound frames to the registry and broadcast channels.
#[derive(Debug, Clone)]
pub struct EventRouter {
    codec: JsonCodec,
    registry: Arc<SubscriptionRegistry>,
    hub: SharedBroadcastHub,
}

impl EventRouter {
    /// Create a router over a registry and hub.
    #[must_use]
    pub const fn new(registry: Arc<SubscriptionRegistry>, hub: SharedBroadcastHub) -> Self {
        Self {
            codec: JsonCodec::new(),
            registry,
            hub,
        }
    }

    /// Route one text frame.
    pub fn route(&self, text: &str) -> RouteSummary {
        let mut summary = RouteSummary::default();

        match self.codec.parse(text) {
            Ok(Value::Array(elements)) => {
                for element in elements {
                    self.route_element(element, true, &mut summary);
                }
            }
            Ok(value) => self.route_element(value, false, &mut summary),
            Err(e) => record_protocol_error(&e, text, &mut summary),
        }

        summary
    }

    fn route_element(&self, value: Value, in_array: bool, summary: &mut RouteSummary) {
        let frame = match self.codec.decode_object(value) {
            Ok(frame) => frame,
            Err(e) => {
                record_protocol_error(&e, "", summary);
                return;
            }
        };

        match frame {
            InboundFrame::Ack { id } if in_array => {
                summary.unrecognized += 1;
                tracing::debug!(id, "Acknowledgement inside array ignored");
            }
            InboundFrame::Ack { id } => {
                summary.acks += 1;
                metrics::record_ack_received();

                let Some(request) = self.registry.on_acknowledge(id) else {
                    tracing::debug!(id, "Acknowledgement for unknown request ignored");
                    return;
                };
                tracing::debug!(
                    id,
                    method = %request.method(),
                    topics = request.topics().len(),
                    "Subscription acknowledged"
                );
                metrics::set_acknowledged_topics(self.registry.acknowledged_topic_count());
                let _ = self.hub.send_ack(request);
            }
            InboundFrame::Error(error) => {
                summary.errors += 1;
                metrics::record_error_frame();
                tracing::error!(
                    code = error.code,
                    msg = %error.msg,
                    id = ?error.id,
                    "Stream error"
                );

                if let Some(id) = error.id {
                    self.registry.on_reject(id);
                }
                let _ = self.hub.send_error(error);
            }
            InboundFrame::Event(event) => {
                summary.events += 1;
                let kind = event.kind();
                metrics::record_event_received(kind);

                if self.hub.publish(event).is_none() {
                    tracing::trace!(kind = kind.as_str(), "No receivers for event");
                    metrics::record_event_unrouted(kind);
                }
            }
            InboundFrame::Unrecognized(kind) => {
                summary.unrecognized += 1;
                tracing::trace!(kind = %kind, "Dropping event with unhandled type");
            }
        }
    }
}

fn record_protocol_error(error: &CodecError, text: &str, summary: &mut RouteSummary) {
    summary.protocol_errors += 1;
    metrics::record_protocol_error();
    tracing::warn!(error = %error, frame_len = text.len(), "Failed to decode stream frame");
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use tokio::sync::broadcast::error::TryRecvError;

    use super::*;
    use crate::domain::topic::Topic;
    use crate::infrastructure::broadcast::BroadcastHub;

    const MINI_TICKER: &str = r#"{"e":"24hrMiniTicker","E":1672515782136,"s":"BNBBTC",
        "c":"0.0025","o":"0.0010","h":"0.0025","l":"0.0010","v":"10000","q":"18"}"#;

    fn router() -> (EventRouter, Arc<SubscriptionRegistry>, SharedBroadcastHub) {
        let registry = Arc::new(SubscriptionRegistry::default());
        let hub = Arc::new(BroadcastHub::with_defaults());
        (
            EventRouter::new(Arc::clone(&registry), Arc::clone(&hub)),
            registry,
            hub,
        )
    }

    #[tokio::test]
    async fn ack_updates_registry_and_publishes() {
        let (router, registry, hub) = router();
        let _ = registry.take_replay();
        let id = registry.subscribe([Topic::trade("btcusdt")]).unwrap().request().id();
        let mut acks = hub.acks_rx();

        let summary = router.route(&format!(r#"{{"result":null,"id":{id}}}"#));
        assert_eq!(summary.acks, 1);
        assert!(registry.get(id).unwrap().is_acknowledged());

        let acked = acks.recv().await.unwrap();
        assert_eq!(acked.id(), id);
        assert!(acked.is_acknowledged());
    }

    #[test]
    fn ack_for_unknown_id_is_ignored() {
        let (router, _registry, hub) = router();
        let mut acks = hub.acks_rx();

        let summary = router.route(r#"{"result":null,"id":42}"#);
        assert_eq!(summary.acks, 1);
        assert!(!summary.requires_reconnect());
        assert!(matches!(acks.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn error_frame_publishes_and_requests_reconnect() {
        let (router, registry, hub) = router();
        let id = registry.subscribe([Topic::trade("btcusdt")]).unwrap().request().id();
        let mut errors = hub.errors_rx();

        let summary = router.route(&format!(
            r#"{{"error":{{"code":2,"msg":"Invalid request"}},"id":{id}}}"#
        ));
        assert!(summary.requires_reconnect());
        assert!(registry.get(id).unwrap().is_rejected());

        let error = errors.recv().await.unwrap();
        assert_eq!(error.code, 2);
        assert_eq!(error.msg, "Invalid request");
    }

    #[tokio::test]
    async fn event_reaches_only_its_channel() {
        let (router, _registry, hub) = router();
        let mut mini_tickers = hub.mini_tickers_rx();
        let mut tickers = hub.tickers_rx();

        let summary = router.route(MINI_TICKER);
        assert_eq!(summary.events, 1);

        assert_eq!(mini_tickers.recv().await.unwrap().symbol, "BNBBTC");
        assert!(matches!(tickers.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn array_elements_route_independently() {
        let (router, _registry, hub) = router();
        let mut mini_tickers = hub.mini_tickers_rx();

        let frame = format!(r#"[{MINI_TICKER}, {{"garbage":true}}, {MINI_TICKER}]"#);
        let summary = router.route(&frame);

        assert_eq!(summary.events, 2);
        assert_eq!(summary.protocol_errors, 1);
        assert!(mini_tickers.recv().await.is_ok());
        assert!(mini_tickers.recv().await.is_ok());
    }

    #[test]
    fn ack_inside_array_is_not_applied() {
        let (router, registry, hub) = router();
        let _ = registry.take_replay();
        let id = registry.subscribe([Topic::trade("btcusdt")]).unwrap().request().id();
        let mut acks = hub.acks_rx();

        let summary = router.route(&format!(r#"[{{"result":null,"id":{id}}}, {MINI_TICKER}]"#));

        assert_eq!(summary.acks, 0);
        assert_eq!(summary.unrecognized, 1);
        assert_eq!(summary.events, 1);
        assert!(!registry.get(id).unwrap().is_acknowledged());
        assert!(matches!(acks.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn malformed_frame_is_counted_not_fatal() {
        let (router, _registry, _hub) = router();
        let summary = router.route("{not json");
        assert_eq!(summary.protocol_errors, 1);
        assert!(!summary.requires_reconnect());
    }

    #[test]
    fn unknown_event_is_dropped() {
        let (router, _registry, _hub) = router();
        let summary = router.route(r#"{"e":"depthUpdate","E":1,"s":"BNBBTC"}"#);
        assert_eq!(summary.unrecognized, 1);
        assert_eq!(summary.events, 0);
    }
}

//! Broadcast Channel Adapters
//!
//! Implements event distribution using tokio broadcast channels for
//! fan-out to any number of in-process consumers.
//!
//! # Architecture
//!
//! The `BroadcastHub` provides one channel per event kind:
//! - Candles, aggregate trades, trades, mini tickers and tickers
//! - Account position updates from the user-data stream
//! - Subscription acknowledgements and server error frames
//!
//! Producers never block. A receiver that falls more than the channel's
//! capacity behind loses the oldest events; a receiver created after an
//! event was sent never sees it.

use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::{Stream, StreamExt};

use super::binance::messages::{
    AccountPositionEvent, AggregateTradeEvent, CandleEvent, MiniTickerEvent, StreamError,
    StreamEvent, TickerEvent, TradeEvent,
};
use super::metrics;
use crate::BroadcastSettings;
use crate::domain::subscription::SubscriptionRequest;

/// Boxed stream of events handed to consumers.
pub type EventStream<T> = Pin<Box<dyn Stream<Item = T> + Send>>;

// =============================================================================
// Broadcast Hub
// =============================================================================

/// Configuration for broadcast channel capacities.
#[derive(Debug, Clone, Copy)]
pub struct BroadcastConfig {
    /// Capacity for the candle channel.
    pub candles_capacity: usize,
    /// Capacity for the aggregate trade channel.
    pub aggregate_trades_capacity: usize,
    /// Capacity for the trade channel.
    pub trades_capacity: usize,
    /// Capacity for the mini ticker channel.
    pub mini_tickers_capacity: usize,
    /// Capacity for the ticker channel.
    pub tickers_capacity: usize,
    /// Capacity for the account position channel.
    pub account_positions_capacity: usize,
    /// Capacity for the acknowledgement and error channels.
    pub control_capacity: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            candles_capacity: 1_000,
            aggregate_trades_capacity: 10_000,
            trades_capacity: 10_000,
            mini_tickers_capacity: 5_000,
            tickers_capacity: 5_000,
            account_positions_capacity: 256,
            control_capacity: 256,
        }
    }
}

impl From<BroadcastSettings> for BroadcastConfig {
    fn from(settings: BroadcastSettings) -> Self {
        Self {
            candles_capacity: settings.candles_capacity,
            aggregate_trades_capacity: settings.aggregate_trades_capacity,
            trades_capacity: settings.trades_capacity,
            mini_tickers_capacity: settings.mini_tickers_capacity,
            tickers_capacity: settings.tickers_capacity,
            account_positions_capacity: settings.account_positions_capacity,
            control_capacity: settings.control_capacity,
        }
    }
}

/// Central hub for all broadcast channels.
///
/// # Example
///
/// ```rust
/// use binance_stream_client::infrastructure::broadcast::{BroadcastConfig, BroadcastHub};
///
/// let hub = BroadcastHub::new(BroadcastConfig::default());
///
/// // Get a receiver for trades
/// let mut rx = hub.trades_rx();
///
/// // The stream client publishes decoded events
/// // hub.publish(event);
/// ```
#[derive(Debug)]
#[allow(clippy::struct_field_names)]
pub struct BroadcastHub {
    candles_tx: broadcast::Sender<CandleEvent>,
    aggregate_trades_tx: broadcast::Sender<AggregateTradeEvent>,
    trades_tx: broadcast::Sender<TradeEvent>,
    mini_tickers_tx: broadcast::Sender<MiniTickerEvent>,
    tickers_tx: broadcast::Sender<TickerEvent>,
    account_positions_tx: broadcast::Sender<AccountPositionEvent>,
    acks_tx: broadcast::Sender<SubscriptionRequest>,
    errors_tx: broadcast::Sender<StreamError>,
}

impl BroadcastHub {
    /// Create a new broadcast hub with the given configuration.
    #[must_use]
    pub fn new(config: BroadcastConfig) -> Self {
        Self {
            candles_tx: broadcast::channel(config.candles_capacity).0,
            aggregate_trades_tx: broadcast::channel(config.aggregate_trades_capacity).0,
            trades_tx: broadcast::channel(config.trades_capacity).0,
            mini_tickers_tx: broadcast::channel(config.mini_tickers_capacity).0,
            tickers_tx: broadcast::channel(config.tickers_capacity).0,
            account_positions_tx: broadcast::channel(config.account_positions_capacity).0,
            acks_tx: broadcast::channel(config.control_capacity).0,
            errors_tx: broadcast::channel(config.control_capacity).0,
        }
    }

    /// Create a new broadcast hub with default configuration.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(BroadcastConfig::default())
    }

    /// Publish a decoded event on its kind's channel.
    ///
    /// Returns the number of receivers that got the event, or `None` if the
    /// channel had no receivers.
    #[must_use]
    pub fn publish(&self, event: StreamEvent) -> Option<usize> {
        match event {
            StreamEvent::Candle(e) => self.candles_tx.send(e).ok(),
            StreamEvent::AggregateTrade(e) => self.aggregate_trades_tx.send(e).ok(),
            StreamEvent::Trade(e) => self.trades_tx.send(e).ok(),
            StreamEvent::MiniTicker(e) => self.mini_tickers_tx.send(e).ok(),
            StreamEvent::Ticker(e) => self.tickers_tx.send(e).ok(),
            StreamEvent::AccountPosition(e) => self.account_positions_tx.send(e).ok(),
        }
    }

    // =========================================================================
    // Market Channels
    // =========================================================================

    /// Get a new receiver for candles.
    #[must_use]
    pub fn candles_rx(&self) -> broadcast::Receiver<CandleEvent> {
        self.candles_tx.subscribe()
    }

    /// Get a new receiver for aggregate trades.
    #[must_use]
    pub fn aggregate_trades_rx(&self) -> broadcast::Receiver<AggregateTradeEvent> {
        self.aggregate_trades_tx.subscribe()
    }

    /// Get a new receiver for trades.
    #[must_use]
    pub fn trades_rx(&self) -> broadcast::Receiver<TradeEvent> {
        self.trades_tx.subscribe()
    }

    /// Get a new receiver for mini tickers.
    #[must_use]
    pub fn mini_tickers_rx(&self) -> broadcast::Receiver<MiniTickerEvent> {
        self.mini_tickers_tx.subscribe()
    }

    /// Get a new receiver for tickers.
    #[must_use]
    pub fn tickers_rx(&self) -> broadcast::Receiver<TickerEvent> {
        self.tickers_tx.subscribe()
    }

    // =========================================================================
    // User Data Channel
    // =========================================================================

    /// Get a new receiver for account position updates.
    #[must_use]
    pub fn account_positions_rx(&self) -> broadcast::Receiver<AccountPositionEvent> {
        self.account_positions_tx.subscribe()
    }

    // =========================================================================
    // Control Channels
    // =========================================================================

    /// Publish an acknowledged request.
    #[must_use]
    pub fn send_ack(&self, request: SubscriptionRequest) -> Option<usize> {
        self.acks_tx.send(request).ok()
    }

    /// Get a new receiver for acknowledged requests.
    #[must_use]
    pub fn acks_rx(&self) -> broadcast::Receiver<SubscriptionRequest> {
        self.acks_tx.subscribe()
    }

    /// Publish a server error frame.
    #[must_use]
    pub fn send_error(&self, error: StreamError) -> Option<usize> {
        self.errors_tx.send(error).ok()
    }

    /// Get a new receiver for server error frames.
    #[must_use]
    pub fn errors_rx(&self) -> broadcast::Receiver<StreamError> {
        self.errors_tx.subscribe()
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    /// Get statistics about all channels.
    #[must_use]
    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            candles_receivers: self.candles_tx.receiver_count(),
            aggregate_trades_receivers: self.aggregate_trades_tx.receiver_count(),
            trades_receivers: self.trades_tx.receiver_count(),
            mini_tickers_receivers: self.mini_tickers_tx.receiver_count(),
            tickers_receivers: self.tickers_tx.receiver_count(),
            account_positions_receivers: self.account_positions_tx.receiver_count(),
            acks_receivers: self.acks_tx.receiver_count(),
            errors_receivers: self.errors_tx.receiver_count(),
        }
    }
}

/// Shared broadcast hub reference.
pub type SharedBroadcastHub = Arc<BroadcastHub>;

/// Statistics about broadcast channels.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct BroadcastStats {
    /// Number of candle receivers.
    pub candles_receivers: usize,
    /// Number of aggregate trade receivers.
    pub aggregate_trades_receivers: usize,
    /// Number of trade receivers.
    pub trades_receivers: usize,
    /// Number of mini ticker receivers.
    pub mini_tickers_receivers: usize,
    /// Number of ticker receivers.
    pub tickers_receivers: usize,
    /// Number of account position receivers.
    pub account_positions_receivers: usize,
    /// Number of acknowledgement receivers.
    pub acks_receivers: usize,
    /// Number of error receivers.
    pub errors_receivers: usize,
}

impl BroadcastStats {
    /// Get total number of receivers across all channels.
    #[must_use]
    pub const fn total_receivers(&self) -> usize {
        self.candles_receivers
            + self.aggregate_trades_receivers
            + self.trades_receivers
            + self.mini_tickers_receivers
            + self.tickers_receivers
            + self.account_positions_receivers
            + self.acks_receivers
            + self.errors_receivers
    }
}

// =============================================================================
// Filtered Views
// =============================================================================

/// Turn a receiver into a stream of the items matching `predicate`.
///
/// Lag is logged and counted, then the stream continues with the oldest
/// item still buffered.
pub fn filtered<T, F>(
    rx: broadcast::Receiver<T>,
    channel: &'static str,
    predicate: F,
) -> EventStream<T>
where
    T: Clone + Send + 'static,
    F: Fn(&T) -> bool + Send + 'static,
{
    Box::pin(BroadcastStream::new(rx).filter_map(move |item| match item {
        Ok(event) => predicate(&event).then_some(event),
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            tracing::warn!(channel, skipped, "Slow consumer lagged, events dropped");
            metrics::record_events_lagged(channel, skipped);
            None
        }
    }))
}

/// Unfiltered stream over a receiver.
pub fn all<T>(rx: broadcast::Receiver<T>, channel: &'static str) -> EventStream<T>
where
    T: Clone + Send + 'static,
{
    filtered(rx, channel, |_| true)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;

    use super::*;

    fn make_test_trade(symbol: &str, id: u64) -> TradeEvent {
        TradeEvent {
            event_time: Utc.timestamp_millis_opt(1_672_515_782_136).unwrap(),
            symbol: symbol.to_string(),
            trade_id: id,
            price: Decimal::from_str("0.001").unwrap(),
            quantity: Decimal::from(100),
            buyer_order_id: None,
            seller_order_id: None,
            trade_time: Utc.timestamp_millis_opt(1_672_515_782_136).unwrap(),
            buyer_is_maker: true,
            best_price_match: true,
        }
    }

    #[test]
    fn broadcast_hub_creation() {
        let hub = BroadcastHub::with_defaults();
        assert_eq!(hub.stats().total_receivers(), 0);
    }

    #[test]
    fn receiver_count_tracks_drops() {
        let hub = BroadcastHub::with_defaults();

        {
            let _rx1 = hub.trades_rx();
            let _rx2 = hub.trades_rx();
            assert_eq!(hub.stats().trades_receivers, 2);
        }

        assert_eq!(hub.stats().trades_receivers, 0);
    }

    #[tokio::test]
    async fn publish_routes_by_kind() {
        let hub = BroadcastHub::with_defaults();
        let mut trades = hub.trades_rx();
        let mut candles = hub.candles_rx();

        let delivered = hub.publish(StreamEvent::Trade(make_test_trade("BNBBTC", 1)));
        assert_eq!(delivered, Some(1));

        assert_eq!(trades.recv().await.unwrap().trade_id, 1);
        assert!(matches!(
            candles.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[test]
    fn publish_with_no_receivers_returns_none() {
        let hub = BroadcastHub::with_defaults();
        assert!(hub.publish(StreamEvent::Trade(make_test_trade("BNBBTC", 1))).is_none());
    }

    #[tokio::test]
    async fn late_receiver_sees_no_history() {
        let hub = BroadcastHub::with_defaults();
        let _early = hub.trades_rx();
        let _ = hub.publish(StreamEvent::Trade(make_test_trade("BNBBTC", 1)));

        let mut late = hub.trades_rx();
        let _ = hub.publish(StreamEvent::Trade(make_test_trade("BNBBTC", 2)));
        assert_eq!(late.recv().await.unwrap().trade_id, 2);
    }

    #[tokio::test]
    async fn filtered_stream_applies_predicate() {
        let hub = BroadcastHub::with_defaults();
        let mut stream = filtered(hub.trades_rx(), "trades", |t: &TradeEvent| {
            t.symbol == "ETHBTC"
        });

        let _ = hub.publish(StreamEvent::Trade(make_test_trade("BNBBTC", 1)));
        let _ = hub.publish(StreamEvent::Trade(make_test_trade("ETHBTC", 2)));

        let next = stream.next().await.unwrap();
        assert_eq!(next.trade_id, 2);
    }

    #[tokio::test]
    async fn lagging_consumer_loses_oldest() {
        let hub = BroadcastHub::new(BroadcastConfig {
            trades_capacity: 2,
            ..BroadcastConfig::default()
        });
        let mut stream = all(hub.trades_rx(), "trades");

        for id in 1..=5 {
            let _ = hub.publish(StreamEvent::Trade(make_test_trade("BNBBTC", id)));
        }

        // Only the newest two survive
        assert_eq!(stream.next().await.unwrap().trade_id, 4);
        assert_eq!(stream.next().await.unwrap().trade_id, 5);
    }
}

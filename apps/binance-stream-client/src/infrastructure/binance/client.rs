//! Stream Client
//!
//! Long-lived client for the market data and user-data stream endpoint.
//!
//! # Lifecycle
//!
//! ```text
//! Disconnected ──dial──► Connecting ──Open──► Connected
//!      ▲                     │                    │
//!      └───── Closed ────────┴──── Closed ────────┘
//! ```
//!
//! One run loop owns the connection. On open it installs the connection and
//! replays every queued subscription through the outbound dispatcher. On
//! failure or on a server error frame it closes with 1002 and waits, bounded
//! by `close_timeout`, for the transport to report closure. Every closure
//! queues the registry for replay and dials again: immediately when the
//! connection had opened, with backoff when it never did.
//!
//! Sends queued for an earlier connection are discarded when they reach the
//! front of the queue; replay covers them.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::codec::{CodecError, JsonCodec};
use super::messages::{
    AccountPositionEvent, AggregateTradeEvent, CandleEvent, MiniTickerEvent, StreamError,
    TickerEvent, TradeEvent,
};
use super::reconnect::{ReconnectConfig, ReconnectError, ReconnectPolicy};
use super::router::EventRouter;
use crate::application::ports::{
    Connection, NORMAL_CLOSURE, PROTOCOL_ERROR, Transport, TransportError, TransportEvent,
};
use crate::domain::streaming::ConnectionState;
use crate::domain::subscription::{
    Admission, RegistryStats, RequestId, SubscriptionError, SubscriptionRegistry,
    SubscriptionRequest,
};
use crate::domain::topic::{Interval, Topic};
use crate::infrastructure::broadcast::{self, EventStream, SharedBroadcastHub};
use crate::infrastructure::config::ClientConfig;
use crate::infrastructure::dispatch::{DispatchError, OutboundDispatcher};
use crate::infrastructure::metrics;

// =============================================================================
// Configuration
// =============================================================================

/// Settings for one stream client.
#[derive(Debug, Clone)]
pub struct StreamClientConfig {
    /// Stream endpoint URL.
    pub url: String,
    /// Ceiling on acknowledged topics.
    pub max_topics: usize,
    /// Minimum spacing between outbound control frames.
    pub min_send_spacing: Duration,
    /// How long to wait for the transport to confirm closure.
    pub close_timeout: Duration,
    /// Upper bound on a single outbound send.
    pub send_timeout: Duration,
    /// Backoff for dials that fail before the stream opens.
    pub reconnect: ReconnectConfig,
}

impl Default for StreamClientConfig {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

impl From<&ClientConfig> for StreamClientConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            url: config.endpoints.stream_url.clone(),
            max_topics: config.stream.max_topics,
            min_send_spacing: config.stream.min_send_spacing,
            close_timeout: config.stream.close_timeout,
            send_timeout: config.stream.send_timeout,
            reconnect: ReconnectConfig::from(&config.reconnect),
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors returned by the stream client.
#[derive(Debug, thiserror::Error)]
pub enum StreamClientError {
    /// The registry refused the request.
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    /// The request could not be encoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The outbound queue has stopped.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// Dialing gave up.
    #[error(transparent)]
    Reconnect(#[from] ReconnectError),

    /// The server answered the request with an error.
    #[error("request {0} was rejected by the server")]
    Rejected(RequestId),

    /// No request with this id was ever issued.
    #[error("unknown request {0}")]
    UnknownRequest(RequestId),

    /// The client was closed.
    #[error("stream client closed")]
    Closed,
}

// =============================================================================
// Feed Subscription
// =============================================================================

/// A subscription request paired with the events it feeds.
pub struct FeedSubscription<T> {
    /// The request admitted for the feed's topics.
    pub request: SubscriptionRequest,
    /// Events for the feed, observed from before the request was admitted.
    pub events: EventStream<T>,
}

impl<T> fmt::Debug for FeedSubscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedSubscription")
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}

/// Client statistics for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ClientStats {
    /// Current connection state.
    pub state: ConnectionState,
    /// Connections dialled so far.
    pub connections: u64,
    /// Dials after the first.
    pub reconnects: u64,
    /// Text frames received across all connections.
    pub frames_received: u64,
    /// Outbound frames queued or in flight.
    pub pending_sends: usize,
    /// Registry counts.
    pub subscriptions: RegistryStats,
}

// =============================================================================
// Connection Slot
// =============================================================================

/// The open connection, tagged with the epoch it was dialled in.
#[derive(Default)]
struct ConnectionSlot {
    current: Mutex<Option<(u64, Arc<dyn Connection>)>>,
}

impl ConnectionSlot {
    fn install(&self, epoch: u64, connection: Arc<dyn Connection>) {
        *self.current.lock() = Some((epoch, connection));
    }

    fn clear(&self) {
        self.current.lock().take();
    }

    async fn send(&self, epoch: u64, text: String) -> Result<(), TransportError> {
        let current = self.current.lock().clone();
        let connection = match current {
            Some((current, connection)) if current == epoch => connection,
            Some(_) => return Err(TransportError::Stale(epoch)),
            None => return Err(TransportError::NotConnected),
        };
        connection.send(text).await
    }
}

// =============================================================================
// Stream Client
// =============================================================================

/// Persistent streaming subscription client.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use binance_stream_client::infrastructure::binance::client::{StreamClient, StreamClientConfig};
/// use binance_stream_client::infrastructure::binance::websocket::WebSocketTransport;
/// use binance_stream_client::infrastructure::broadcast::BroadcastHub;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = StreamClient::new(
///     StreamClientConfig::default(),
///     Arc::new(WebSocketTransport::default()),
///     Arc::new(BroadcastHub::with_defaults()),
/// );
/// let _run = client.spawn();
///
/// let feed = client.trades("BTCUSDT")?;
/// client.acknowledged(&feed.request).await?;
/// # Ok(())
/// # }
/// ```
pub struct StreamClient {
    config: StreamClientConfig,
    transport: Arc<dyn Transport>,
    registry: Arc<SubscriptionRegistry>,
    hub: SharedBroadcastHub,
    router: EventRouter,
    codec: JsonCodec,
    dispatcher: OutboundDispatcher,
    slot: Arc<ConnectionSlot>,
    state: RwLock<ConnectionState>,
    epoch: AtomicU64,
    reconnects: AtomicU64,
    frames_received: AtomicU64,
    cancel: CancellationToken,
}

impl fmt::Debug for StreamClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamClient")
            .field("url", &self.config.url)
            .field("state", &self.state())
            .field("epoch", &self.epoch.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl StreamClient {
    /// Create a client. Must be called within a tokio runtime.
    ///
    /// Nothing is dialled until [`StreamClient::run`] is driven.
    #[must_use]
    pub fn new(
        config: StreamClientConfig,
        transport: Arc<dyn Transport>,
        hub: SharedBroadcastHub,
    ) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let registry = Arc::new(SubscriptionRegistry::new(config.max_topics));
        let dispatcher = OutboundDispatcher::spawn(
            config.min_send_spacing,
            config.send_timeout,
            cancel.child_token(),
        );
        let router = EventRouter::new(Arc::clone(&registry), Arc::clone(&hub));

        Arc::new(Self {
            config,
            transport,
            registry,
            hub,
            router,
            codec: JsonCodec::new(),
            dispatcher,
            slot: Arc::new(ConnectionSlot::default()),
            state: RwLock::new(ConnectionState::Disconnected),
            epoch: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            cancel,
        })
    }

    /// Spawn [`StreamClient::run`] on the current runtime.
    #[must_use]
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<Result<(), StreamClientError>> {
        tokio::spawn(Arc::clone(self).run())
    }

    /// Drive the connection until [`StreamClient::close`] is called.
    ///
    /// # Errors
    ///
    /// Returns `Reconnect` once consecutive failed dials exhaust
    /// `max_attempts`.
    pub async fn run(self: Arc<Self>) -> Result<(), StreamClientError> {
        let mut policy = ReconnectPolicy::new(self.config.reconnect.clone());

        while !self.cancel.is_cancelled() {
            let opened = self.connect_and_run().await;
            if self.cancel.is_cancelled() {
                break;
            }

            if opened {
                policy.reset();
            } else {
                let Some(delay) = policy.next_delay() else {
                    let attempts = policy.attempt_count();
                    tracing::error!(attempts, "Giving up on stream connection");
                    return Err(ReconnectError::MaxAttemptsExceeded(attempts).into());
                };
                tracing::warn!(
                    attempt = policy.attempt_count(),
                    delay_ms = delay.as_millis(),
                    "Stream connection failed, backing off"
                );
                tokio::select! {
                    () = self.cancel.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                }
            }

            self.reconnects.fetch_add(1, Ordering::Relaxed);
            metrics::record_reconnect();
        }

        tracing::info!("Stream client stopped");
        Ok(())
    }

    /// One connection from dial to closure. Returns whether it opened.
    async fn connect_and_run(&self) -> bool {
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        let (events_tx, mut events) = mpsc::unbounded_channel();

        self.set_state(ConnectionState::Connecting);
        tracing::info!(url = %self.config.url, epoch, "Dialing stream");
        let connection = self.transport.connect(&self.config.url, events_tx);

        let mut opened = false;
        let mut close_deadline: Option<Instant> = None;

        loop {
            let event = tokio::select! {
                () = self.cancel.cancelled(), if close_deadline.is_none() => {
                    connection.close(NORMAL_CLOSURE, "client closing");
                    close_deadline = Some(Instant::now() + self.config.close_timeout);
                    continue;
                }
                () = tokio::time::sleep_until(close_deadline.unwrap_or_else(Instant::now)),
                    if close_deadline.is_some() =>
                {
                    tracing::warn!(epoch, "Transport did not confirm closure in time");
                    break;
                }
                event = events.recv() => event,
            };

            match event {
                Some(TransportEvent::Open) => {
                    opened = true;
                    self.slot.install(epoch, Arc::clone(&connection));
                    self.set_state(ConnectionState::Connected);
                    self.replay(epoch);
                }
                Some(TransportEvent::Message(text)) => {
                    self.frames_received.fetch_add(1, Ordering::Relaxed);
                    let summary = self.router.route(&text);
                    if summary.requires_reconnect() && close_deadline.is_none() {
                        tracing::warn!(epoch, "Server error frame, forcing reconnect");
                        connection.close(PROTOCOL_ERROR, "server error frame");
                        close_deadline = Some(Instant::now() + self.config.close_timeout);
                    }
                }
                Some(TransportEvent::Failure(error)) => {
                    tracing::warn!(epoch, error = %error, "Stream transport failure");
                    if close_deadline.is_none() {
                        connection.close(PROTOCOL_ERROR, "transport failure");
                        close_deadline = Some(Instant::now() + self.config.close_timeout);
                    }
                }
                Some(TransportEvent::Closed { code, reason }) => {
                    tracing::info!(epoch, code, reason = %reason, "Stream closed");
                    break;
                }
                None => break,
            }
        }

        self.slot.clear();
        let queued = self.registry.mark_disconnected();
        metrics::set_acknowledged_topics(0);
        self.set_state(ConnectionState::Disconnected);
        tracing::debug!(epoch, queued, "Subscriptions queued for replay");

        opened
    }

    fn replay(&self, epoch: u64) {
        let requests = self.registry.take_replay();
        if !requests.is_empty() {
            tracing::info!(epoch, count = requests.len(), "Replaying subscriptions");
        }
        for request in &requests {
            if let Err(e) = self.send_request(epoch, request) {
                tracing::error!(id = request.id(), error = %e, "Failed to queue replay");
            }
        }
    }

    fn send_request(
        &self,
        epoch: u64,
        request: &SubscriptionRequest,
    ) -> Result<(), StreamClientError> {
        let text = self.codec.encode(request)?;
        let slot = Arc::clone(&self.slot);
        let id = request.id();
        let method = request.method();

        self.dispatcher.submit(async move {
            match slot.send(epoch, text).await {
                Ok(()) => {
                    metrics::record_frame_sent(method);
                    tracing::debug!(id, method = %method, "Subscription frame sent");
                    Ok(())
                }
                Err(TransportError::Stale(_) | TransportError::NotConnected) => {
                    tracing::debug!(id, epoch, "Dropping send for closed connection");
                    Ok(())
                }
                Err(e) => Err(e),
            }
        })?;
        Ok(())
    }

    fn admit(&self, admission: Admission) -> Result<SubscriptionRequest, StreamClientError> {
        if admission.should_dispatch() {
            // Read after admission: a reconnect in between resends via replay
            let epoch = self.epoch.load(Ordering::Acquire);
            self.send_request(epoch, admission.request())?;
        }
        Ok(admission.into_request())
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
        metrics::set_connection_state(state);
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Subscribe to topics.
    ///
    /// Returns an existing request when one already covers every topic.
    ///
    /// # Errors
    ///
    /// Returns `Subscription` when the registry refuses the request.
    pub fn subscribe(
        &self,
        topics: impl IntoIterator<Item = Topic>,
    ) -> Result<SubscriptionRequest, StreamClientError> {
        let admission = self.registry.subscribe(topics)?;
        self.admit(admission)
    }

    /// Unsubscribe from topics.
    ///
    /// # Errors
    ///
    /// Returns `Subscription` when the registry refuses the request.
    pub fn unsubscribe(
        &self,
        topics: impl IntoIterator<Item = Topic>,
    ) -> Result<SubscriptionRequest, StreamClientError> {
        let admission = self.registry.unsubscribe(topics)?;
        self.admit(admission)
    }

    /// Unsubscribe from every topic of an earlier request.
    ///
    /// # Errors
    ///
    /// Returns `Subscription` when the registry refuses the request.
    pub fn unsubscribe_request(
        &self,
        request: &SubscriptionRequest,
    ) -> Result<SubscriptionRequest, StreamClientError> {
        self.unsubscribe(request.topics().iter().cloned())
    }

    /// Wait until the server acknowledges `request`.
    ///
    /// Resolves immediately when it is already acknowledged on the current
    /// connection.
    ///
    /// # Errors
    ///
    /// Returns `Rejected` if the server answered with an error, `UnknownRequest`
    /// for an id this client never issued, and `Closed` once the client closes.
    pub async fn acknowledged(
        &self,
        request: &SubscriptionRequest,
    ) -> Result<SubscriptionRequest, StreamClientError> {
        let id = request.id();
        let mut acks = self.hub.acks_rx();
        let mut errors = self.hub.errors_rx();

        loop {
            match self.registry.get(id) {
                None => return Err(StreamClientError::UnknownRequest(id)),
                Some(current) if current.is_acknowledged() => return Ok(current),
                Some(current) if current.is_rejected() => {
                    return Err(StreamClientError::Rejected(id));
                }
                Some(_) => {}
            }

            tokio::select! {
                () = self.cancel.cancelled() => return Err(StreamClientError::Closed),
                ack = acks.recv() => match ack {
                    Ok(ack) if ack.id() == id => return Ok(ack),
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => return Err(StreamClientError::Closed),
                },
                error = errors.recv() => {
                    if matches!(error, Err(RecvError::Closed)) {
                        return Err(StreamClientError::Closed);
                    }
                }
            }
        }
    }

    /// Wait for the next acknowledgement of any request.
    ///
    /// # Errors
    ///
    /// Returns `Closed` once the client closes.
    pub async fn next_acknowledgement(&self) -> Result<SubscriptionRequest, StreamClientError> {
        let mut acks = self.hub.acks_rx();
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return Err(StreamClientError::Closed),
                ack = acks.recv() => match ack {
                    Ok(ack) => return Ok(ack),
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => return Err(StreamClientError::Closed),
                },
            }
        }
    }

    /// Every acknowledgement from now on.
    #[must_use]
    pub fn acknowledgements(&self) -> EventStream<SubscriptionRequest> {
        broadcast::all(self.hub.acks_rx(), "acks")
    }

    /// Server error frames from now on.
    #[must_use]
    pub fn protocol_errors(&self) -> EventStream<StreamError> {
        broadcast::all(self.hub.errors_rx(), "errors")
    }

    // =========================================================================
    // Feeds
    // =========================================================================

    /// Subscribe to candles for one symbol.
    ///
    /// # Errors
    ///
    /// Returns `Subscription` when the registry refuses the request.
    pub fn subscribe_candles(
        &self,
        symbol: &str,
        interval: Interval,
    ) -> Result<SubscriptionRequest, StreamClientError> {
        self.subscribe([Topic::kline(symbol, interval)])
    }

    /// Subscribe to candles for several symbol and interval pairs in one request.
    ///
    /// # Errors
    ///
    /// Returns `Subscription` when the registry refuses the request.
    pub fn subscribe_candles_batch<'a>(
        &self,
        pairs: impl IntoIterator<Item = (&'a str, Interval)>,
    ) -> Result<SubscriptionRequest, StreamClientError> {
        self.subscribe(
            pairs
                .into_iter()
                .map(|(symbol, interval)| Topic::kline(symbol, interval)),
        )
    }

    /// Candles for one symbol and interval. Does not subscribe.
    #[must_use]
    pub fn candles(&self, symbol: &str, interval: Interval) -> EventStream<CandleEvent> {
        let symbol = symbol.to_string();
        broadcast::filtered(self.hub.candles_rx(), "candles", move |event: &CandleEvent| {
            event.candle.interval == interval && same_symbol(&event.symbol, &symbol)
        })
    }

    /// Subscribe to aggregate trades for one symbol.
    ///
    /// # Errors
    ///
    /// Returns `Subscription` when the registry refuses the request.
    pub fn aggregate_trades(
        &self,
        symbol: &str,
    ) -> Result<FeedSubscription<AggregateTradeEvent>, StreamClientError> {
        let wanted = symbol.to_string();
        let events = broadcast::filtered(
            self.hub.aggregate_trades_rx(),
            "aggregate_trades",
            move |event: &AggregateTradeEvent| same_symbol(&event.symbol, &wanted),
        );
        self.feed([Topic::aggregate_trade(symbol)], events)
    }

    /// Subscribe to raw trades for one symbol.
    ///
    /// # Errors
    ///
    /// Returns `Subscription` when the registry refuses the request.
    pub fn trades(&self, symbol: &str) -> Result<FeedSubscription<TradeEvent>, StreamClientError> {
        let wanted = symbol.to_string();
        let events = broadcast::filtered(
            self.hub.trades_rx(),
            "trades",
            move |event: &TradeEvent| same_symbol(&event.symbol, &wanted),
        );
        self.feed([Topic::trade(symbol)], events)
    }

    /// Subscribe to the mini ticker for one symbol.
    ///
    /// # Errors
    ///
    /// Returns `Subscription` when the registry refuses the request.
    pub fn mini_ticker(
        &self,
        symbol: &str,
    ) -> Result<FeedSubscription<MiniTickerEvent>, StreamClientError> {
        let wanted = symbol.to_string();
        let events = broadcast::filtered(
            self.hub.mini_tickers_rx(),
            "mini_tickers",
            move |event: &MiniTickerEvent| same_symbol(&event.symbol, &wanted),
        );
        self.feed([Topic::mini_ticker(symbol)], events)
    }

    /// Subscribe to mini tickers for every symbol.
    ///
    /// # Errors
    ///
    /// Returns `Subscription` when the registry refuses the request.
    pub fn all_mini_tickers(&self) -> Result<FeedSubscription<MiniTickerEvent>, StreamClientError> {
        let events = broadcast::all(self.hub.mini_tickers_rx(), "mini_tickers");
        self.feed([Topic::all_mini_tickers()], events)
    }

    /// Subscribe to the ticker for one symbol.
    ///
    /// # Errors
    ///
    /// Returns `Subscription` when the registry refuses the request.
    pub fn ticker(&self, symbol: &str) -> Result<FeedSubscription<TickerEvent>, StreamClientError> {
        let wanted = symbol.to_string();
        let events = broadcast::filtered(
            self.hub.tickers_rx(),
            "tickers",
            move |event: &TickerEvent| same_symbol(&event.symbol, &wanted),
        );
        self.feed([Topic::ticker(symbol)], events)
    }

    /// Subscribe to tickers for every symbol.
    ///
    /// # Errors
    ///
    /// Returns `Subscription` when the registry refuses the request.
    pub fn all_tickers(&self) -> Result<FeedSubscription<TickerEvent>, StreamClientError> {
        let events = broadcast::all(self.hub.tickers_rx(), "tickers");
        self.feed([Topic::all_tickers()], events)
    }

    /// Subscribe to the user-data stream behind a listen key.
    ///
    /// # Errors
    ///
    /// Returns `Subscription` when the registry refuses the request.
    pub fn subscribe_account(
        &self,
        listen_key: &str,
    ) -> Result<SubscriptionRequest, StreamClientError> {
        self.subscribe([Topic::account(listen_key)])
    }

    /// Account position updates. Does not subscribe.
    #[must_use]
    pub fn account_positions(&self) -> EventStream<AccountPositionEvent> {
        broadcast::all(self.hub.account_positions_rx(), "account_positions")
    }

    fn feed<T, const N: usize>(
        &self,
        topics: [Topic; N],
        events: EventStream<T>,
    ) -> Result<FeedSubscription<T>, StreamClientError> {
        let request = self.subscribe(topics)?;
        Ok(FeedSubscription { request, events })
    }

    // =========================================================================
    // State
    // =========================================================================

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Whether the stream is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// The subscription registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Client statistics.
    #[must_use]
    pub fn stats(&self) -> ClientStats {
        ClientStats {
            state: self.state(),
            connections: self.epoch.load(Ordering::Acquire),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            pending_sends: self.dispatcher.pending(),
            subscriptions: self.registry.stats(),
        }
    }

    /// Close the connection and stop reconnecting. Idempotent.
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            tracing::info!("Closing stream client");
            self.cancel.cancel();
        }
    }

    /// Whether [`StreamClient::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

fn same_symbol(event_symbol: &str, wanted: &str) -> bool {
    event_symbol.eq_ignore_ascii_case(wanted)
}

// =============================================================================
// Tests
// =============================================================================

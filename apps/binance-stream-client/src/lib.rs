#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Binance Stream Client - Persistent Market Data Subscriptions
//!
//! Keeps one self-healing connection to Binance's stream endpoint, replays
//! subscriptions after every reconnect and fans decoded events out to
//! in-process consumers.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Topics, subscription requests and connection state
//!   - `topic`: Stream names and candle intervals
//!   - `subscription`: Request registry with dedup, topic cap and replay
//!   - `streaming`: Connection lifecycle
//!
//! - **Application**: Port definitions
//!   - `ports`: Duplex transport and connection contracts
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `binance`: Stream client, codec, router and REST client
//!   - `dispatch`: Outbound control frames spaced 500 ms apart
//!   - `broadcast`: Per-kind event channels
//!   - `adapter`: Callback-style calls as cancellable futures
//!   - `config`, `health`, `metrics`, `telemetry`
//!
//! # Data Flow
//!
//! ```text
//!                       ┌─────────────┐
//! subscribe() ─────────►│  Registry   │── dedup / cap / replay
//!                       └──────┬──────┘
//!                              ▼
//!                       ┌─────────────┐     ┌───────────┐
//!                       │ Dispatcher  │────►│ WebSocket │
//!                       └─────────────┘     └─────┬─────┘
//!                                                 │ frames
//!                       ┌─────────────┐     ┌─────▼─────┐
//! Consumer 1 ◄──────────┤  Broadcast  │◄────┤  Router   │
//! Consumer N ◄──────────┤   Channels  │     └───────────┘
//!                       └─────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Subscription types with no I/O.
pub mod domain;

/// Application layer - Port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::streaming::ConnectionState;
pub use domain::subscription::{
    Admission, DEFAULT_MAX_TOPICS, RegistryStats, RequestId, SubscriptionError,
    SubscriptionMethod, SubscriptionRegistry, SubscriptionRequest,
};
pub use domain::topic::{Interval, Topic, TopicError};

// Ports
pub use application::ports::{Connection, Transport, TransportError, TransportEvent};

// Infrastructure config
pub use infrastructure::config::{
    BroadcastSettings, ClientConfig, ConfigError, Credentials, EndpointSettings, Environment,
    ReconnectSettings, ServerSettings, StreamSettings,
};

// Stream and REST clients
pub use infrastructure::binance::{
    ApiError, ClientStats, FeedSubscription, RestCall, RestClient, RestError, StreamClient,
    StreamClientConfig, StreamClientError, WebSocketTransport,
};

// Stream message types
pub use infrastructure::binance::messages::{
    AccountPositionEvent, AggregateTradeEvent, CandleEvent, MiniTickerEvent, StreamError,
    StreamEvent, TickerEvent, TradeEvent,
};

// Call adapter
pub use infrastructure::adapter::{Call, CallAdapter, CallCallback, CallError, CallFuture};

// Broadcast hub
pub use infrastructure::broadcast::{
    BroadcastConfig, BroadcastHub, BroadcastStats, EventStream, SharedBroadcastHub,
};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};

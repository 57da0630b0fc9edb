//! Prometheus Metrics Module
//!
//! Exposes client metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Frames**: Inbound frames by kind, outbound control frames by method
//! - **Delivery**: Events published without receivers, consumer lag
//! - **Connection**: Connection state and reconnect count
//! - **Subscriptions**: Acknowledged topic count
//! - **REST**: Call outcomes by endpoint
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::domain::streaming::ConnectionState;
use crate::domain::subscription::SubscriptionMethod;
use crate::infrastructure::binance::messages::EventKind;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if the recorder cannot be installed.
#[allow(clippy::expect_used)]
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "binance_stream_events_received_total",
        "Events decoded from the stream, by kind"
    );
    describe_counter!(
        "binance_stream_acks_received_total",
        "Subscription acknowledgements received"
    );
    describe_counter!(
        "binance_stream_error_frames_total",
        "Error frames pushed by the server"
    );
    describe_counter!(
        "binance_stream_protocol_errors_total",
        "Inbound frames that could not be decoded"
    );
    describe_counter!(
        "binance_stream_events_unrouted_total",
        "Events published while their channel had no receivers"
    );
    describe_counter!(
        "binance_stream_events_lagged_total",
        "Events skipped by slow consumers"
    );
    describe_counter!(
        "binance_stream_frames_sent_total",
        "Control frames written to the connection, by method"
    );
    describe_counter!(
        "binance_stream_reconnects_total",
        "Connection attempts after the first"
    );
    describe_gauge!(
        "binance_stream_connection_state",
        "1 when the stream connection is in the labelled state"
    );
    describe_gauge!(
        "binance_stream_acknowledged_topics",
        "Topics acknowledged on the current connection"
    );
    describe_counter!(
        "binance_rest_calls_total",
        "REST calls by endpoint and outcome"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Outcome labels for REST calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// Value delivered.
    Success,
    /// Error delivered.
    Failure,
    /// Cancelled before completion.
    Cancelled,
}

impl CallOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Record a decoded event.
pub fn record_event_received(kind: EventKind) {
    counter!(
        "binance_stream_events_received_total",
        "kind" => kind.as_str()
    )
    .increment(1);
}

/// Record an acknowledgement frame.
pub fn record_ack_received() {
    counter!("binance_stream_acks_received_total").increment(1);
}

/// Record an error frame from the server.
pub fn record_error_frame() {
    counter!("binance_stream_error_frames_total").increment(1);
}

/// Record an inbound frame that failed to decode.
pub fn record_protocol_error() {
    counter!("binance_stream_protocol_errors_total").increment(1);
}

/// Record an event published with nobody listening.
pub fn record_event_unrouted(kind: EventKind) {
    counter!(
        "binance_stream_events_unrouted_total",
        "kind" => kind.as_str()
    )
    .increment(1);
}

/// Record events skipped by a lagging consumer.
pub fn record_events_lagged(channel: &'static str, count: u64) {
    counter!(
        "binance_stream_events_lagged_total",
        "channel" => channel
    )
    .increment(count);
}

/// Record a control frame written to the connection.
pub fn record_frame_sent(method: SubscriptionMethod) {
    counter!(
        "binance_stream_frames_sent_total",
        "method" => method.as_str()
    )
    .increment(1);
}

/// Record a reconnection attempt.
pub fn record_reconnect() {
    counter!("binance_stream_reconnects_total").increment(1);
}

/// Publish the current connection state as a one-hot gauge set.
pub fn set_connection_state(state: ConnectionState) {
    for candidate in [
        ConnectionState::Disconnected,
        ConnectionState::Connecting,
        ConnectionState::Connected,
    ] {
        let value = if candidate == state { 1.0 } else { 0.0 };
        gauge!(
            "binance_stream_connection_state",
            "state" => candidate.as_str()
        )
        .set(value);
    }
}

/// Update the acknowledged topic gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_acknowledged_topics(count: usize) {
    gauge!("binance_stream_acknowledged_topics").set(count as f64);
}

/// Record a REST call outcome.
pub fn record_rest_call(endpoint: &'static str, outcome: CallOutcome) {
    counter!(
        "binance_rest_calls_total",
        "endpoint" => endpoint,
        "outcome" => outcome.as_str()
    )
    .increment(1);
}

// =============================================================================
// Tests
// =============================================================================

//! Port Interfaces
//!
//! Defines the transport contract the streaming client is written against.
//! The production adapter is the WebSocket transport in
//! `infrastructure::binance::websocket`; tests substitute in-memory fakes.
//!
//! ## Driven Ports (Outbound)
//!
//! - `Transport`: dials a duplex text connection and reports its lifecycle
//! - `Connection`: the open handle used to send frames and close

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Close code for an orderly shutdown.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Close code used when the peer violated the protocol.
pub const PROTOCOL_ERROR: u16 = 1002;

/// Lifecycle and data events reported by a transport connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The connection is open and accepts sends.
    Open,
    /// A text frame arrived.
    Message(String),
    /// The connection is closed. Always the last event of a connection.
    Closed {
        /// Close code reported by the peer or chosen locally.
        code: u16,
        /// Close reason, possibly empty.
        reason: String,
    },
    /// The connection failed. A `Closed` event follows.
    Failure(String),
}

/// Sender half a transport reports events into.
pub type TransportEvents = mpsc::UnboundedSender<TransportEvent>;

/// Errors returned by connection operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The connection is not open.
    #[error("connection is not open")]
    NotConnected,

    /// The frame was addressed to a connection that has since been replaced.
    #[error("connection {0} has been replaced")]
    Stale(u64),

    /// Writing the frame failed.
    #[error("send failed: {0}")]
    SendFailed(String),
}

/// An established (or establishing) duplex text connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connection: Send + Sync {
    /// Write one text frame.
    async fn send(&self, text: String) -> Result<(), TransportError>;

    /// Begin closing the connection. Repeated calls are no-ops.
    fn close(&self, code: u16, reason: &str);
}

/// Dials connections.
pub trait Transport: Send + Sync {
    /// Start connecting to `url`.
    ///
    /// Returns immediately; progress is reported through `events`, starting
    /// with `Open` or `Failure` and always ending with `Closed`.
    fn connect(&self, url: &str, events: TransportEvents) -> Arc<dyn Connection>;
}

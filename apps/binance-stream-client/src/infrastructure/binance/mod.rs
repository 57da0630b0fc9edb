//! Binance Integration
//!
//! Stream client, wire codec, event routing and the REST surface.
//!
//! # Endpoints
//!
//! - Stream: `wss://stream.binance.com:9443/ws`
//! - REST: `https://api.binance.com/api/v3/`
//!
//! Testnet equivalents are selected through
//! [`Environment`](crate::infrastructure::config::Environment).

pub mod client;
pub mod codec;
pub mod messages;
pub mod reconnect;
pub mod rest;
pub mod router;
pub mod signer;
pub mod websocket;

pub use client::{
    ClientStats, FeedSubscription, StreamClient, StreamClientConfig, StreamClientError,
};
pub use rest::{ApiError, RestCall, RestClient, RestError};
pub use websocket::WebSocketTransport;

//! Domain Layer - Core subscription types and business logic.
//!
//! This layer holds the stream topic grammar, the subscription request
//! lifecycle and connection state. Nothing here performs I/O.

/// Connection lifecycle types.
pub mod streaming;

/// Subscription request tracking, deduplication and replay.
pub mod subscription;

/// Stream topic names and candle intervals.
pub mod topic;

//! Application Layer - Port definitions.
//!
//! This layer defines the contracts the stream client drives and the
//! infrastructure adapters implement.

/// Port interfaces for external systems (duplex transport).
pub mod ports;

//! Infrastructure Layer - Adapters and external integrations.
//!
//! - `adapter`: Callback-style calls as cancellable futures
//! - `binance`: Stream client, codec and REST client
//! - `broadcast`: Per-kind event fan-out
//! - `config`: Environment configuration
//! - `dispatch`: Spaced outbound control frames
//! - `health`: Health check HTTP endpoint
//! - `metrics`: Prometheus metrics
//! - `telemetry`: Tracing and OpenTelemetry setup

pub mod adapter;
pub mod binance;
pub mod broadcast;
pub mod config;
pub mod dispatch;
pub mod health;
pub mod metrics;
pub mod telemetry;

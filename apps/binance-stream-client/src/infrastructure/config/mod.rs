//! Configuration Module
//!
//! Configuration loading for the stream client.

mod settings;

pub use settings::{
    BroadcastSettings, ClientConfig, ConfigError, Credentials, EndpointSettings, Environment,
    ReconnectSettings, ServerSettings, StreamSettings,
};

//! Binance Stream Client Binary
//!
//! Connects to the stream endpoint, subscribes to the configured topics and
//! logs what arrives.
//!
//! # Usage
//!
//! ```bash
//! BINANCE_STREAMS=btcusdt@kline_1m,ethusdt@trade cargo run --bin binance-stream-client
//! ```
//!
//! # Environment Variables
//!
//! ## Optional
//! - `BINANCE_ENV`: LIVE | TESTNET (default: LIVE)
//! - `BINANCE_STREAMS`: Comma-separated topics to subscribe at startup
//! - `BINANCE_API_KEY` / `BINANCE_API_SECRET`: Enables the user-data stream
//! - `STREAM_HEALTH_PORT`: Health check HTTP port (default: 8083)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use binance_stream_client::infrastructure::broadcast;
use binance_stream_client::infrastructure::telemetry;
use binance_stream_client::{
    BroadcastConfig, BroadcastHub, ClientConfig, HealthServer, HealthServerState, RestClient,
    StreamClient, StreamClientConfig, WebSocketTransport, init_metrics,
};
use tokio::signal;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Listen keys expire after 60 minutes without a keepalive.
const LISTEN_KEY_KEEPALIVE: Duration = Duration::from_secs(30 * 60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        return Err("failed to install rustls crypto provider".into());
    }

    load_dotenv();

    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Binance stream client");

    let _metrics_handle = init_metrics();

    let config = ClientConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let broadcast_hub = Arc::new(BroadcastHub::new(BroadcastConfig::from(
        config.broadcast.clone(),
    )));

    let client = StreamClient::new(
        StreamClientConfig::from(&config),
        Arc::new(WebSocketTransport::default().with_close_timeout(config.stream.close_timeout)),
        Arc::clone(&broadcast_hub),
    );
    let run_handle = client.spawn();

    let rest = RestClient::new(&config)?;
    match rest.server_time().await {
        Ok(time) => {
            let skew_ms = (chrono::Utc::now() - time.server_time).num_milliseconds();
            tracing::info!(skew_ms, "Server clock checked");
        }
        Err(e) => tracing::warn!(error = %e, "Server clock unavailable"),
    }

    if !config.streams.is_empty() {
        let request = client.subscribe(config.streams.iter().cloned())?;
        tracing::info!(
            id = request.id(),
            topics = request.topics().len(),
            "Subscribed to configured streams"
        );
    }

    spawn_event_loggers(&client, &broadcast_hub);

    if rest.has_credentials() {
        spawn_user_data_stream(Arc::clone(&client), rest.clone(), shutdown_token.clone());
    }

    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&client),
        Arc::clone(&broadcast_hub),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    tracing::info!("Stream client ready");

    await_shutdown(shutdown_token).await;
    client.close();

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, run_handle).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => tracing::error!(error = %e, "Stream client stopped with error"),
        Ok(Err(e)) => tracing::error!(error = %e, "Stream client task failed"),
        Err(_) => tracing::warn!("Stream client did not stop in time"),
    }

    tracing::info!("Stream client stopped");
    Ok(())
}

/// Log every acknowledgement, protocol error and candle.
fn spawn_event_loggers(client: &Arc<StreamClient>, hub: &Arc<BroadcastHub>) {
    let mut acks = client.acknowledgements();
    tokio::spawn(async move {
        while let Some(request) = acks.next().await {
            tracing::info!(
                id = request.id(),
                method = request.method().as_str(),
                topics = request.topics().len(),
                "Request acknowledged"
            );
        }
    });

    let mut errors = client.protocol_errors();
    tokio::spawn(async move {
        while let Some(error) = errors.next().await {
            tracing::warn!(code = error.code, msg = %error.msg, "Server error frame");
        }
    });

    let mut candles = broadcast::all(hub.candles_rx(), "candles");
    tokio::spawn(async move {
        while let Some(event) = candles.next().await {
            tracing::debug!(
                symbol = %event.symbol,
                interval = event.candle.interval.code(),
                close = %event.candle.close,
                closed = event.candle.closed,
                "Candle"
            );
        }
    });

    let mut positions = client.account_positions();
    tokio::spawn(async move {
        while let Some(event) = positions.next().await {
            tracing::info!(balances = event.balances.len(), "Account position update");
        }
    });
}

/// Open the user-data stream, keep its listen key alive and close it on
/// shutdown.
fn spawn_user_data_stream(client: Arc<StreamClient>, rest: RestClient, cancel: CancellationToken) {
    tokio::spawn(async move {
        let listen_key = match rest.create_listen_key().await {
            Ok(key) => key.listen_key,
            Err(e) => {
                tracing::error!(error = %e, "Failed to create listen key");
                return;
            }
        };

        if let Err(e) = client.subscribe_account(&listen_key) {
            tracing::error!(error = %e, "Failed to subscribe to user-data stream");
            return;
        }
        tracing::info!("User-data stream subscribed");

        let mut keepalive = tokio::time::interval(LISTEN_KEY_KEEPALIVE);
        keepalive.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = keepalive.tick() => {
                    if let Err(e) = rest.keep_alive_listen_key(&listen_key).await {
                        tracing::warn!(error = %e, "Listen key keepalive failed");
                    }
                }
            }
        }

        if let Err(e) = rest.close_listen_key(&listen_key).await {
            tracing::warn!(error = %e, "Failed to close listen key");
        }
    });
}

/// Log the parsed configuration.
fn log_config(config: &ClientConfig) {
    tracing::info!(
        environment = config.environment.as_str(),
        streams = config.streams.len(),
        max_topics = config.stream.max_topics,
        health_port = config.server.health_port,
        authenticated = config.credentials.is_some(),
        "Configuration loaded"
    );
    tracing::debug!(
        stream_url = %config.endpoints.stream_url,
        rest_url = %config.endpoints.rest_url,
        "Endpoints"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        for dir in cwd.ancestors().skip(1) {
            let env_path = dir.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+C handler failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}

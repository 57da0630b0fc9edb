//! WebSocket Transport
//!
//! `Transport` adapter over `tokio-tungstenite`. Each connection is driven
//! by its own task that owns the socket; the returned handle talks to it
//! through a command channel.
//!
//! # Stream URL
//!
//! - Production: `wss://stream.binance.com:9443/ws`
//! - Testnet: `wss://testnet.binance.vision/ws`
//!
//! The server pings every few minutes and drops connections that do not
//! answer; pongs are sent from the driver task.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use crate::application::ports::{
    Connection, NORMAL_CLOSURE, Transport, TransportError, TransportEvent, TransportEvents,
};

/// Close code reported when the socket ended without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Default bound on the TCP + TLS + upgrade handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default wait for the server to echo a close frame.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

enum Command {
    Send(String, oneshot::Sender<Result<(), TransportError>>),
    Close(u16, String),
}

/// Dials WebSocket connections.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    connect_timeout: Duration,
    close_timeout: Duration,
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

impl WebSocketTransport {
    /// Create a transport with the given handshake timeout.
    #[must_use]
    pub const fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }

    /// Bound the wait for the server's close frame after a close is sent.
    ///
    /// Sends issued while closing fail with `NotConnected`; once the bound
    /// passes the socket is dropped and `Closed` is reported.
    #[must_use]
    pub const fn with_close_timeout(mut self, close_timeout: Duration) -> Self {
        self.close_timeout = close_timeout;
        self
    }
}

impl Transport for WebSocketTransport {
    fn connect(&self, url: &str, events: TransportEvents) -> Arc<dyn Connection> {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        tokio::spawn(drive(
            url.to_string(),
            self.connect_timeout,
            self.close_timeout,
            commands_rx,
            events,
        ));

        Arc::new(WebSocketConnection {
            commands: commands_tx,
            close_requested: AtomicBool::new(false),
        })
    }
}

struct WebSocketConnection {
    commands: mpsc::UnboundedSender<Command>,
    close_requested: AtomicBool,
}

#[async_trait]
impl Connection for WebSocketConnection {
    async fn send(&self, text: String) -> Result<(), TransportError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.commands
            .send(Command::Send(text, ack_tx))
            .map_err(|_| TransportError::NotConnected)?;
        ack_rx.await.map_err(|_| TransportError::NotConnected)?
    }

    fn close(&self, code: u16, reason: &str) {
        if !self.close_requested.swap(true, Ordering::AcqRel) {
            let _ = self.commands.send(Command::Close(code, reason.to_string()));
        }
    }
}

async fn drive(
    url: String,
    connect_timeout: Duration,
    close_timeout: Duration,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: TransportEvents,
) {
    tracing::info!(url = %url, "Connecting to stream");

    let ws_stream =
        match tokio::time::timeout(connect_timeout, tokio_tungstenite::connect_async(&url)).await {
            Ok(Ok((ws_stream, _response))) => ws_stream,
            Ok(Err(e)) => {
                fail(&events, format!("connect failed: {e}"));
                return;
            }
            Err(_) => {
                fail(
                    &events,
                    format!("connect timed out after {}ms", connect_timeout.as_millis()),
                );
                return;
            }
        };

    let (mut write, mut read) = ws_stream.split();
    let _ = events.send(TransportEvent::Open);

    let mut close_code = ABNORMAL_CLOSURE;
    let mut close_reason = String::new();
    let mut close_deadline: Option<Instant> = None;
    let mut handles_alive = true;

    loop {
        tokio::select! {
            command = commands.recv(), if handles_alive => match command {
                Some(Command::Send(_, ack)) if close_deadline.is_some() => {
                    let _ = ack.send(Err(TransportError::NotConnected));
                }
                Some(Command::Send(text, ack)) => {
                    let result = write
                        .send(Message::Text(text.into()))
                        .await
                        .map_err(|e| TransportError::SendFailed(e.to_string()));
                    let failed = result.is_err();
                    if let Err(e) = &result {
                        let _ = events.send(TransportEvent::Failure(e.to_string()));
                    }
                    let _ = ack.send(result);
                    if failed {
                        break;
                    }
                }
                Some(Command::Close(..)) if close_deadline.is_some() => {}
                Some(Command::Close(code, reason)) => {
                    close_deadline = Some(Instant::now() + close_timeout);
                    close_code = code;
                    close_reason.clone_from(&reason);
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.into(),
                    };
                    if write.send(Message::Close(Some(frame))).await.is_err() {
                        break;
                    }
                }
                None => {
                    // Every handle dropped
                    handles_alive = false;
                    if close_deadline.is_none() {
                        close_deadline = Some(Instant::now() + close_timeout);
                        close_code = NORMAL_CLOSURE;
                        let _ = write.send(Message::Close(None)).await;
                    }
                }
            },
            () = sleep_until_deadline(close_deadline), if close_deadline.is_some() => {
                tracing::warn!(
                    code = close_code,
                    timeout_ms = close_timeout.as_millis(),
                    "Close handshake not answered, dropping socket"
                );
                break;
            }
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let _ = events.send(TransportEvent::Message(text.as_str().to_owned()));
                }
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = write.send(Message::Pong(data)).await {
                        let _ = events.send(TransportEvent::Failure(e.to_string()));
                        break;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    if let Some(frame) = frame {
                        close_code = u16::from(frame.code);
                        close_reason = frame.reason.as_str().to_owned();
                    }
                    tracing::info!(
                        code = close_code,
                        reason = %close_reason,
                        "Stream closed by server"
                    );
                    break;
                }
                Some(Ok(_)) => {
                    // Binary and pong frames carry nothing for us
                }
                Some(Err(e)) => {
                    if close_deadline.is_none() {
                        let _ = events.send(TransportEvent::Failure(e.to_string()));
                    }
                    break;
                }
                None => break,
            },
        }
    }

    let _ = events.send(TransportEvent::Closed {
        code: close_code,
        reason: close_reason,
    });
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    if let Some(deadline) = deadline {
        tokio::time::sleep_until(deadline).await;
    }
}

fn fail(events: &TransportEvents, error: String) {
    tracing::warn!(error = %error, "Stream connection failed");
    let _ = events.send(TransportEvent::Failure(error));
    let _ = events.send(TransportEvent::Closed {
        code: ABNORMAL_CLOSURE,
        reason: String::new(),
    });
}

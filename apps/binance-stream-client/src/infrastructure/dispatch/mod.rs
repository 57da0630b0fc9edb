//! Outbound Dispatcher
//!
//! Serializes outbound control frames through a single worker task with a
//! minimum spacing between consecutive sends. The venue disconnects clients
//! that send control messages faster than its rate limit, so every
//! subscription frame, fresh or replayed, goes through here.
//!
//! # Timing
//!
//! Spacing is measured from the end of one action to the start of the next.
//! An action submitted after a long idle period runs immediately. An action
//! that outlives the action timeout is aborted and counts as finished.
//!
//! ```text
//! submit:  a(t0)   b(t0+50ms)  c(t0+60ms)
//! run:     a@t0    b@t0+500ms  c@t0+1000ms
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Default minimum spacing between outbound control frames.
pub const DEFAULT_MIN_SPACING: Duration = Duration::from_millis(500);

/// Default upper bound on a single action.
pub const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(10);

type SendAction = BoxFuture<'static, anyhow::Result<()>>;

/// Errors returned when submitting an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// The worker has stopped and no longer accepts actions.
    #[error("outbound dispatcher has stopped")]
    Stopped,
}

/// Handle to the dispatcher worker. Cheap to clone.
#[derive(Clone)]
pub struct OutboundDispatcher {
    tx: mpsc::UnboundedSender<SendAction>,
    pending: Arc<AtomicUsize>,
    min_spacing: Duration,
}

impl fmt::Debug for OutboundDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundDispatcher")
            .field("pending", &self.pending())
            .field("min_spacing", &self.min_spacing)
            .finish_non_exhaustive()
    }
}

impl OutboundDispatcher {
    /// Spawn the worker on the current runtime.
    ///
    /// The worker stops when `cancel` fires or every handle is dropped.
    /// Actions still queued at that point are dropped without running.
    #[must_use]
    pub fn spawn(
        min_spacing: Duration,
        action_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));

        tokio::spawn(run_worker(
            rx,
            min_spacing,
            action_timeout,
            Arc::clone(&pending),
            cancel,
        ));

        Self {
            tx,
            pending,
            min_spacing,
        }
    }

    /// Queue an action. Never blocks.
    ///
    /// The future is not polled until the worker reaches it. Failures are
    /// logged by the worker and do not stop the queue.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Stopped` if the worker has exited.
    pub fn submit<F, E>(&self, action: F) -> Result<(), DispatchError>
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<anyhow::Error>,
    {
        let action: SendAction = Box::pin(async move { action.await.map_err(Into::into) });

        self.pending.fetch_add(1, Ordering::AcqRel);
        self.tx.send(action).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            DispatchError::Stopped
        })
    }

    /// Actions queued or running.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Configured minimum spacing.
    #[must_use]
    pub const fn min_spacing(&self) -> Duration {
        self.min_spacing
    }
}

async fn run_worker(
    mut rx: mpsc::UnboundedReceiver<SendAction>,
    min_spacing: Duration,
    action_timeout: Duration,
    pending: Arc<AtomicUsize>,
    cancel: CancellationToken,
) {
    let mut last_finished: Option<Instant> = None;

    loop {
        let action = tokio::select! {
            () = cancel.cancelled() => break,
            action = rx.recv() => match action {
                Some(action) => action,
                None => break,
            },
        };

        if let Some(finished) = last_finished {
            tokio::select! {
                () = cancel.cancelled() => {
                    pending.fetch_sub(1, Ordering::AcqRel);
                    break;
                }
                () = tokio::time::sleep_until(finished + min_spacing) => {}
            }
        }

        // Own task so a panicking action cannot take the worker down
        let mut task = tokio::spawn(action);
        match tokio::time::timeout(action_timeout, &mut task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => tracing::warn!(error = %e, "Outbound send failed"),
            Ok(Err(e)) => tracing::error!(error = %e, "Outbound send panicked"),
            Err(_) => {
                task.abort();
                tracing::warn!(
                    timeout_ms = action_timeout.as_millis(),
                    "Outbound send timed out"
                );
            }
        }

        pending.fetch_sub(1, Ordering::AcqRel);
        last_finished = Some(Instant::now());
    }

    rx.close();
    let mut dropped = 0_usize;
    while rx.try_recv().is_ok() {
        dropped += 1;
    }
    pending.fetch_sub(dropped, Ordering::AcqRel);

    tracing::debug!(dropped, "Outbound dispatcher stopped");
}

// =============================================================================
// Tests
// =============================================================================

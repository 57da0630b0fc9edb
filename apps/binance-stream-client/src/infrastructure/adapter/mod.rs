//! Async Call Adapter
//!
//! Turns a callback-style, single-shot network call into a cancellable
//! future that resolves exactly once.
//!
//! # Contract
//!
//! - The call is enqueued on the first poll, never before.
//! - Exactly one of value or error is delivered. The callback is consumed by
//!   its terminal method, so a second signal cannot be expressed.
//! - Cancelling (explicitly, or by dropping a started future) invokes the
//!   call's own `cancel` once; the future then resolves to
//!   [`CallError::Cancelled`] and any late completion is discarded.
//! - A cancel racing a completion is settled by one compare-exchange on the
//!   shared context.
//! - An optional error hook observes failures before delivery. A panic in
//!   the hook is caught and logged; the error is still delivered.

use std::fmt;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::task::{Context, Poll};

use tokio::sync::oneshot;

// =============================================================================
// Call Port
// =============================================================================

/// A network call that reports its outcome through a callback.
pub trait Call: Send + 'static {
    /// Value produced on success.
    type Output: Send + 'static;
    /// Error produced on failure.
    type Error: Send + 'static;

    /// Start the call. The callback must eventually receive at most one
    /// terminal signal.
    fn enqueue(&mut self, callback: CallCallback<Self::Output, Self::Error>);

    /// Abort the call. Repeated calls are no-ops.
    fn cancel(&self);

    /// Whether the call has been cancelled.
    fn is_cancelled(&self) -> bool;
}

/// Error hook invoked with every failure before it is delivered.
pub type ErrorHook<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Terminal outcome other than a value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError<E> {
    /// The call failed.
    #[error("call failed: {0}")]
    Failed(E),

    /// The call was cancelled before it completed.
    #[error("call cancelled")]
    Cancelled,

    /// The call dropped its callback without signalling.
    #[error("call abandoned without a result")]
    Abandoned,
}

// =============================================================================
// Call Context
// =============================================================================

const ACTIVE: u8 = 0;
const COMPLETED: u8 = 1;
const CANCELLED: u8 = 2;

/// Shared state of one outstanding call. Leaves `Active` exactly once.
#[derive(Debug, Default)]
pub struct CallContext {
    state: AtomicU8,
}

impl CallContext {
    /// Claim the completion. Returns `false` if cancel or completion won.
    pub fn try_complete(&self) -> bool {
        self.transition(COMPLETED)
    }

    /// Claim the cancellation. Returns `false` if completion or cancel won.
    pub fn try_cancel(&self) -> bool {
        self.transition(CANCELLED)
    }

    /// Whether the call is still outstanding.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state.load(Ordering::Acquire) == ACTIVE
    }

    /// Whether cancellation won.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    fn transition(&self, to: u8) -> bool {
        self.state
            .compare_exchange(ACTIVE, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

// =============================================================================
// Callback
// =============================================================================

/// One-shot completion handle given to [`Call::enqueue`].
pub struct CallCallback<T, E> {
    context: Arc<CallContext>,
    tx: oneshot::Sender<Result<T, CallError<E>>>,
    error_hook: Option<ErrorHook<E>>,
}

impl<T, E> fmt::Debug for CallCallback<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallCallback")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

impl<T, E> CallCallback<T, E> {
    /// Deliver the value. Returns whether it was delivered rather than
    /// discarded after a cancel.
    pub fn on_success(self, value: T) -> bool {
        if !self.context.try_complete() {
            return false;
        }
        self.tx.send(Ok(value)).is_ok()
    }

    /// Deliver the error, after running the error hook.
    pub fn on_failure(self, error: E) -> bool {
        if !self.context.try_complete() {
            return false;
        }
        if let Some(hook) = &self.error_hook {
            if catch_unwind(AssertUnwindSafe(|| hook(&error))).is_err() {
                tracing::error!("Call error hook panicked; delivering the original error");
            }
        }
        self.tx.send(Err(CallError::Failed(error))).is_ok()
    }

    /// Whether the consumer cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.context.is_cancelled()
    }
}

// =============================================================================
// Future
// =============================================================================

enum Stage<T, E> {
    Idle,
    Waiting(oneshot::Receiver<Result<T, CallError<E>>>),
    Done,
}

/// Future over one [`Call`].
pub struct CallFuture<C: Call> {
    call: C,
    context: Arc<CallContext>,
    stage: Stage<C::Output, C::Error>,
    error_hook: Option<ErrorHook<C::Error>>,
}

impl<C: Call> fmt::Debug for CallFuture<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self.stage {
            Stage::Idle => "idle",
            Stage::Waiting(_) => "waiting",
            Stage::Done => "done",
        };
        f.debug_struct("CallFuture")
            .field("stage", &stage)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

impl<C: Call> CallFuture<C> {
    /// Cancel the call. Only the first cancel reaches the underlying call,
    /// and only while no result has been delivered.
    pub fn cancel(&self) {
        if self.context.try_cancel() {
            tracing::debug!("Cancelling call");
            self.call.cancel();
        }
    }

    /// Whether the call was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.context.is_cancelled()
    }
}

impl<C: Call + Unpin> Future for CallFuture<C> {
    type Output = Result<C::Output, CallError<C::Error>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if this.context.is_cancelled() {
            this.stage = Stage::Done;
            return Poll::Ready(Err(CallError::Cancelled));
        }

        if matches!(this.stage, Stage::Idle) {
            let (tx, rx) = oneshot::channel();
            this.stage = Stage::Waiting(rx);
            this.call.enqueue(CallCallback {
                context: Arc::clone(&this.context),
                tx,
                error_hook: this.error_hook.clone(),
            });
        }

        let Stage::Waiting(rx) = &mut this.stage else {
            return Poll::Ready(Err(CallError::Abandoned));
        };

        let outcome = match Pin::new(rx).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Ok(outcome)) => outcome,
            Poll::Ready(Err(_)) if this.context.is_cancelled() => Err(CallError::Cancelled),
            Poll::Ready(Err(_)) => Err(CallError::Abandoned),
        };
        this.stage = Stage::Done;
        Poll::Ready(outcome)
    }
}

impl<C: Call> Drop for CallFuture<C> {
    fn drop(&mut self) {
        if matches!(self.stage, Stage::Waiting(_)) {
            self.cancel();
        }
    }
}

// =============================================================================
// Adapter
// =============================================================================

/// Builds [`CallFuture`]s, sharing one optional error hook.
pub struct CallAdapter<E> {
    error_hook: Option<ErrorHook<E>>,
}

impl<E> Default for CallAdapter<E> {
    fn default() -> Self {
        Self { error_hook: None }
    }
}

impl<E> Clone for CallAdapter<E> {
    fn clone(&self) -> Self {
        Self {
            error_hook: self.error_hook.clone(),
        }
    }
}

impl<E> fmt::Debug for CallAdapter<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallAdapter")
            .field("error_hook", &self.error_hook.is_some())
            .finish()
    }
}

impl<E: Send + 'static> CallAdapter<E> {
    /// Adapter without an error hook.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Observe every failure before it is delivered.
    #[must_use]
    pub fn with_error_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.error_hook = Some(Arc::new(hook));
        self
    }

    /// Wrap a call. Nothing happens until the future is polled.
    pub fn adapt<C>(&self, call: C) -> CallFuture<C>
    where
        C: Call<Error = E>,
    {
        CallFuture {
            call,
            context: Arc::new(CallContext::default()),
            stage: Stage::Idle,
            error_hook: self.error_hook.clone(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    use parking_lot::Mutex;
    use tokio_test::{assert_pending, assert_ready, assert_ready_eq, task};

    use super::*;

    #[derive(Default)]
    struct CallLog {
        enqueued: AtomicUsize,
        cancels: AtomicUsize,
        callback: Mutex<Option<CallCallback<u32, String>>>,
    }

    impl CallLog {
        fn callback(&self) -> CallCallback<u32, String> {
            self.callback.lock().take().unwrap()
        }
    }

    struct ScriptedCall {
        call_log: Arc<CallLog>,
        cancelled: AtomicBool,
    }

    impl Call for ScriptedCall {
        type Output = u32;
        type Error = String;

        fn enqueue(&mut self, callback: CallCallback<u32, String>) {
            self.call_log.enqueued.fetch_add(1, Ordering::SeqCst);
            *self.call_log.callback.lock() = Some(callback);
        }

        fn cancel(&self) {
            self.call_log.cancels.fetch_add(1, Ordering::SeqCst);
            self.cancelled.store(true, Ordering::SeqCst);
        }

        fn is_cancelled(&self) -> bool {
            self.cancelled.load(Ordering::SeqCst)
        }
    }

    fn scripted() -> (ScriptedCall, Arc<CallLog>) {
        let call_log = Arc::new(CallLog::default());
        (
            ScriptedCall {
                call_log: Arc::clone(&call_log),
                cancelled: AtomicBool::new(false),
            },
            call_log,
        )
    }

    #[test]
    fn enqueues_lazily_and_once() {
        let (call, call_log) = scripted();
        let mut future = task::spawn(CallAdapter::new().adapt(call));
        assert_eq!(call_log.enqueued.load(Ordering::SeqCst), 0);

        assert_pending!(future.poll());
        assert_pending!(future.poll());
        assert_eq!(call_log.enqueued.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delivers_value() {
        let (call, call_log) = scripted();
        let mut future = task::spawn(CallAdapter::new().adapt(call));
        assert_pending!(future.poll());

        assert!(call_log.callback().on_success(7));
        assert!(future.is_woken());
        assert_ready_eq!(future.poll(), Ok(7));
    }

    #[test]
    fn delivers_error() {
        let (call, call_log) = scripted();
        let mut future = task::spawn(CallAdapter::new().adapt(call));
        assert_pending!(future.poll());

        call_log.callback().on_failure("boom".to_string());
        assert_ready_eq!(future.poll(), Err(CallError::Failed("boom".to_string())));
    }

    #[test]
    fn cancel_reaches_call_exactly_once_and_discards_late_value() {
        let (call, call_log) = scripted();
        let mut future = task::spawn(CallAdapter::new().adapt(call));
        assert_pending!(future.poll());

        future.cancel();
        future.cancel();
        assert!(future.is_cancelled());
        assert_eq!(call_log.cancels.load(Ordering::SeqCst), 1);

        let callback = call_log.callback();
        assert!(callback.is_cancelled());
        assert!(!callback.on_success(7));

        assert_ready_eq!(future.poll(), Err(CallError::Cancelled));
        drop(future);
        assert_eq!(call_log.cancels.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn completion_beats_later_cancel() {
        let (call, call_log) = scripted();
        let mut future = task::spawn(CallAdapter::new().adapt(call));
        assert_pending!(future.poll());

        assert!(call_log.callback().on_success(1));
        future.cancel();
        assert_eq!(call_log.cancels.load(Ordering::SeqCst), 0);
        assert_ready_eq!(future.poll(), Ok(1));
    }

    #[test]
    fn dropping_started_future_cancels() {
        let (call, call_log) = scripted();
        let mut future = task::spawn(CallAdapter::new().adapt(call));
        assert_pending!(future.poll());

        drop(future);
        assert_eq!(call_log.cancels.load(Ordering::SeqCst), 1);
        assert!(!call_log.callback().on_failure("late".to_string()));
    }

    #[test]
    fn dropping_unpolled_or_finished_future_does_not_cancel() {
        let (call, call_log) = scripted();
        drop(CallAdapter::<String>::new().adapt(call));
        assert_eq!(call_log.cancels.load(Ordering::SeqCst), 0);

        let (call, call_log) = scripted();
        let mut future = task::spawn(CallAdapter::new().adapt(call));
        assert_pending!(future.poll());
        call_log.callback().on_success(3);
        assert_ready!(future.poll()).unwrap();
        drop(future);
        assert_eq!(call_log.cancels.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dropped_callback_abandons() {
        let (call, call_log) = scripted();
        let mut future = task::spawn(CallAdapter::new().adapt(call));
        assert_pending!(future.poll());

        drop(call_log.callback());
        assert_ready_eq!(future.poll(), Err(CallError::Abandoned));
    }

    #[test]
    fn panicking_error_hook_still_delivers() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in_hook = Arc::clone(&seen);
        let adapter = CallAdapter::new().with_error_hook(move |error: &String| {
            seen_in_hook.fetch_add(1, Ordering::SeqCst);
            panic!("hook failed on {error}");
        });

        let (call, call_log) = scripted();
        let mut future = task::spawn(adapter.adapt(call));
        assert_pending!(future.poll());

        assert!(call_log.callback().on_failure("original".to_string()));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_ready_eq!(
            future.poll(),
            Err(CallError::Failed("original".to_string()))
        );
    }

    #[test]
    fn cancel_and_complete_race_has_one_winner() {
        for _ in 0..200 {
            let context = Arc::new(CallContext::default());
            let completer = {
                let context = Arc::clone(&context);
                std::thread::spawn(move || context.try_complete())
            };
            let cancelled = context.try_cancel();
            let completed = completer.join().unwrap();

            assert!(cancelled ^ completed);
            assert!(!context.is_active());
        }
    }

    #[tokio::test]
    async fn resolves_when_completed_from_another_task() {
        let (call, call_log) = scripted();
        let future = CallAdapter::new().adapt(call);

        let completer = tokio::spawn(async move {
            loop {
                let callback = call_log.callback.lock().take();
                if let Some(callback) = callback {
                    callback.on_success(42);
                    break;
                }
                tokio::task::yield_now().await;
            }
        });

        assert_eq!(future.await, Ok(42));
        completer.await.unwrap();
    }
}

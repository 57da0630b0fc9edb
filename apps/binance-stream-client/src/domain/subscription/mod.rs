//! Subscription Registry
//!
//! Domain types for tracking subscription control requests sent over the
//! stream connection, and the registry that decides which of them go out,
//! which are answered locally, and which must be replayed after a reconnect.
//!
//! # Design
//!
//! Every request the registry admits is kept for the registry's lifetime,
//! keyed by its id. A request is in exactly one of these phases:
//!
//! - **awaiting send**: created while disconnected, or queued for replay
//! - **in flight**: written to the connection, no acknowledgement yet
//! - **acknowledged**: the server confirmed it on the current connection
//!
//! A disconnect moves every acknowledged and in-flight request back to
//! awaiting send; the next successful open replays them in id order.
//!
//! Deduplication is approximate: a request is answered locally when an
//! earlier request of the same method already covers all of its topics,
//! regardless of what happened to those topics since.

use std::collections::BTreeMap;
use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::topic::Topic;

/// Upper bound on acknowledged topics per connection.
pub const DEFAULT_MAX_TOPICS: usize = 1024;

/// Identifier assigned to each admitted request.
pub type RequestId = u64;

// =============================================================================
// Types
// =============================================================================

/// Control request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SubscriptionMethod {
    /// Start receiving the listed topics.
    Subscribe,
    /// Stop receiving the listed topics.
    Unsubscribe,
}

impl SubscriptionMethod {
    /// Wire name of the method.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
        }
    }
}

impl fmt::Display for SubscriptionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A subscribe or unsubscribe control request.
///
/// Serializes to the wire form `{"method":"SUBSCRIBE","params":[...],"id":7}`.
/// The lifecycle flags are local bookkeeping and never leave the process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    method: SubscriptionMethod,
    #[serde(rename = "params")]
    topics: Vec<Topic>,
    id: RequestId,
    #[serde(skip)]
    acknowledged: bool,
    #[serde(skip)]
    awaiting_send: bool,
    #[serde(skip)]
    rejected: bool,
}

impl SubscriptionRequest {
    /// Create a request. Duplicate topics are dropped, first occurrence wins.
    #[must_use]
    pub fn new(
        method: SubscriptionMethod,
        topics: impl IntoIterator<Item = Topic>,
        id: RequestId,
    ) -> Self {
        Self {
            method,
            topics: dedup_topics(topics),
            id,
            acknowledged: false,
            awaiting_send: false,
            rejected: false,
        }
    }

    /// Request method.
    #[must_use]
    pub const fn method(&self) -> SubscriptionMethod {
        self.method
    }

    /// Topics carried by the request, in request order.
    #[must_use]
    pub fn topics(&self) -> &[Topic] {
        &self.topics
    }

    /// Request id, unique per registry.
    #[must_use]
    pub const fn id(&self) -> RequestId {
        self.id
    }

    /// Whether the server acknowledged the request on the current connection.
    #[must_use]
    pub const fn is_acknowledged(&self) -> bool {
        self.acknowledged
    }

    /// Whether the request is queued for the next successful connection.
    #[must_use]
    pub const fn is_awaiting_send(&self) -> bool {
        self.awaiting_send
    }

    /// Whether the server answered the request with an error.
    #[must_use]
    pub const fn is_rejected(&self) -> bool {
        self.rejected
    }

    /// Whether every topic in `topics` is covered by this request.
    #[must_use]
    pub fn covers(&self, topics: &[Topic]) -> bool {
        topics.iter().all(|topic| self.topics.contains(topic))
    }
}

fn dedup_topics(topics: impl IntoIterator<Item = Topic>) -> Vec<Topic> {
    let mut unique: Vec<Topic> = Vec::new();
    for topic in topics {
        if !unique.contains(&topic) {
            unique.push(topic);
        }
    }
    unique
}

// =============================================================================
// Errors
// =============================================================================

/// Reasons a request is refused before reaching the wire.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionError {
    /// Admitting the request could push acknowledged topics past the cap.
    #[error(
        "subscription capacity exceeded: {requested} requested, {acknowledged} acknowledged, limit {limit}"
    )]
    CapacityExceeded {
        /// Topics in the refused request.
        requested: usize,
        /// Topics currently acknowledged.
        acknowledged: usize,
        /// Configured topic cap.
        limit: usize,
    },

    /// Request carried no topics.
    #[error("subscription request has no topics")]
    EmptyTopics,
}

// =============================================================================
// Admission
// =============================================================================

/// Outcome of admitting a request into the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// An earlier request of the same method already covers the topics.
    Existing(SubscriptionRequest),
    /// New request created while disconnected; it goes out on the next open.
    Queued(SubscriptionRequest),
    /// New request created while connected; the caller must send it now.
    Dispatch(SubscriptionRequest),
}

impl Admission {
    /// The request this admission resolved to.
    #[must_use]
    pub const fn request(&self) -> &SubscriptionRequest {
        match self {
            Self::Existing(request) | Self::Queued(request) | Self::Dispatch(request) => request,
        }
    }

    /// Consume the admission, returning its request.
    #[must_use]
    pub fn into_request(self) -> SubscriptionRequest {
        match self {
            Self::Existing(request) | Self::Queued(request) | Self::Dispatch(request) => request,
        }
    }

    /// Whether the caller is responsible for sending the request now.
    #[must_use]
    pub const fn should_dispatch(&self) -> bool {
        matches!(self, Self::Dispatch(_))
    }
}

// =============================================================================
// Registry
// =============================================================================

#[derive(Debug, Default)]
struct RegistryState {
    requests: BTreeMap<RequestId, SubscriptionRequest>,
    last_id: RequestId,
    connected: bool,
}

impl RegistryState {
    fn acknowledged_topic_count(&self) -> usize {
        self.requests
            .values()
            .filter(|request| request.acknowledged)
            .map(|request| request.topics.len())
            .sum()
    }
}

/// Thread-safe registry of subscription requests.
///
/// # Example
///
/// ```rust
/// use binance_stream_client::domain::subscription::{Admission, SubscriptionRegistry};
/// use binance_stream_client::domain::topic::Topic;
///
/// let registry = SubscriptionRegistry::new(1024);
///
/// // Disconnected: the request waits for the next open
/// let admission = registry.subscribe([Topic::trade("btcusdt")]).unwrap();
/// assert!(matches!(admission, Admission::Queued(_)));
///
/// // The open replays it
/// let replay = registry.take_replay();
/// assert_eq!(replay.len(), 1);
/// ```
#[derive(Debug)]
pub struct SubscriptionRegistry {
    max_topics: usize,
    state: Mutex<RegistryState>,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TOPICS)
    }
}

impl SubscriptionRegistry {
    /// Create an empty, disconnected registry with the given topic cap.
    #[must_use]
    pub fn new(max_topics: usize) -> Self {
        Self {
            max_topics,
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Configured topic cap.
    #[must_use]
    pub const fn max_topics(&self) -> usize {
        self.max_topics
    }

    /// Admit a subscribe request.
    ///
    /// # Errors
    ///
    /// See [`SubscriptionRegistry::submit`].
    pub fn subscribe(
        &self,
        topics: impl IntoIterator<Item = Topic>,
    ) -> Result<Admission, SubscriptionError> {
        self.submit(SubscriptionMethod::Subscribe, topics)
    }

    /// Admit an unsubscribe request.
    ///
    /// # Errors
    ///
    /// See [`SubscriptionRegistry::submit`].
    pub fn unsubscribe(
        &self,
        topics: impl IntoIterator<Item = Topic>,
    ) -> Result<Admission, SubscriptionError> {
        self.submit(SubscriptionMethod::Unsubscribe, topics)
    }

    /// Admit a request.
    ///
    /// The cap is checked first, against acknowledged topics only. Then an
    /// earlier request of the same method covering every topic is returned
    /// as-is. Otherwise a new request with the next id is recorded.
    ///
    /// # Errors
    ///
    /// Returns `EmptyTopics` for an empty topic list and `CapacityExceeded`
    /// when the request could push acknowledged topics past the cap.
    pub fn submit(
        &self,
        method: SubscriptionMethod,
        topics: impl IntoIterator<Item = Topic>,
    ) -> Result<Admission, SubscriptionError> {
        let topics = dedup_topics(topics);
        if topics.is_empty() {
            return Err(SubscriptionError::EmptyTopics);
        }

        let mut state = self.state.lock();

        let acknowledged = state.acknowledged_topic_count();
        if topics.len() + acknowledged > self.max_topics {
            return Err(SubscriptionError::CapacityExceeded {
                requested: topics.len(),
                acknowledged,
                limit: self.max_topics,
            });
        }

        if let Some(existing) = state
            .requests
            .values()
            .find(|request| {
                request.method == method && !request.rejected && request.covers(&topics)
            })
        {
            return Ok(Admission::Existing(existing.clone()));
        }

        state.last_id += 1;
        let mut request = SubscriptionRequest::new(method, topics, state.last_id);
        request.awaiting_send = !state.connected;
        state.requests.insert(request.id, request.clone());

        if state.connected {
            Ok(Admission::Dispatch(request))
        } else {
            Ok(Admission::Queued(request))
        }
    }

    /// Record the server's acknowledgement of `id`.
    ///
    /// Returns the updated request, or `None` for an unknown id.
    pub fn on_acknowledge(&self, id: RequestId) -> Option<SubscriptionRequest> {
        let mut state = self.state.lock();
        let request = state.requests.get_mut(&id)?;
        request.acknowledged = true;
        request.awaiting_send = false;
        Some(request.clone())
    }

    /// Record that the server answered `id` with an error.
    ///
    /// Rejected requests are never replayed and never satisfy deduplication.
    pub fn on_reject(&self, id: RequestId) -> Option<SubscriptionRequest> {
        let mut state = self.state.lock();
        let request = state.requests.get_mut(&id)?;
        request.acknowledged = false;
        request.awaiting_send = false;
        request.rejected = true;
        Some(request.clone())
    }

    /// The connection dropped.
    ///
    /// Acknowledged and in-flight requests are queued for replay. Returns
    /// the number of requests now awaiting send.
    pub fn mark_disconnected(&self) -> usize {
        let mut state = self.state.lock();
        state.connected = false;

        let mut queued = 0;
        for request in state.requests.values_mut().filter(|r| !r.rejected) {
            request.acknowledged = false;
            request.awaiting_send = true;
            queued += 1;
        }
        queued
    }

    /// A connection opened.
    ///
    /// Marks the registry connected and hands back every queued request, in
    /// id order, with its awaiting flag cleared. The caller sends them.
    pub fn take_replay(&self) -> Vec<SubscriptionRequest> {
        let mut state = self.state.lock();
        state.connected = true;

        state
            .requests
            .values_mut()
            .filter(|request| request.awaiting_send)
            .map(|request| {
                request.awaiting_send = false;
                request.clone()
            })
            .collect()
    }

    /// Whether the registry believes a connection is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    /// Look up a request by id.
    #[must_use]
    pub fn get(&self, id: RequestId) -> Option<SubscriptionRequest> {
        self.state.lock().requests.get(&id).cloned()
    }

    /// Snapshot of every request, in id order.
    #[must_use]
    pub fn requests(&self) -> Vec<SubscriptionRequest> {
        self.state.lock().requests.values().cloned().collect()
    }

    /// Sum of topics over acknowledged requests.
    #[must_use]
    pub fn acknowledged_topic_count(&self) -> usize {
        self.state.lock().acknowledged_topic_count()
    }

    /// Aggregate counts for health reporting.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let state = self.state.lock();
        let mut stats = RegistryStats {
            max_topics: self.max_topics,
            ..RegistryStats::default()
        };

        for request in state.requests.values() {
            stats.total_requests += 1;
            if request.acknowledged {
                stats.acknowledged_requests += 1;
                stats.acknowledged_topics += request.topics.len();
            } else if request.awaiting_send {
                stats.awaiting_send += 1;
            } else if request.rejected {
                stats.rejected += 1;
            } else {
                stats.in_flight += 1;
            }
        }
        stats
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    /// Requests ever admitted.
    pub total_requests: usize,
    /// Requests acknowledged on the current connection.
    pub acknowledged_requests: usize,
    /// Topics across acknowledged requests.
    pub acknowledged_topics: usize,
    /// Requests queued for the next open.
    pub awaiting_send: usize,
    /// Requests sent and not yet acknowledged.
    pub in_flight: usize,
    /// Requests the server answered with an error.
    pub rejected: usize,
    /// Configured topic cap.
    pub max_topics: usize,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::domain::topic::Interval;

    fn topics(names: &[&str]) -> Vec<Topic> {
        names.iter().map(|name| Topic::parse(name).unwrap()).collect()
    }

    fn connected_registry(max_topics: usize) -> SubscriptionRegistry {
        let registry = SubscriptionRegistry::new(max_topics);
        assert!(registry.take_replay().is_empty());
        registry
    }

    #[test]
    fn wire_format_matches_control_frame() {
        let request = SubscriptionRequest::new(
            SubscriptionMethod::Subscribe,
            topics(&["btcusdt@aggTrade", "btcusdt@depth"]),
            7,
        );
        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(
            json,
            r#"{"method":"SUBSCRIBE","params":["btcusdt@aggTrade","btcusdt@depth"],"id":7}"#
        );

        let decoded: SubscriptionRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, request);
        assert!(!decoded.is_acknowledged());
        assert!(!decoded.is_awaiting_send());
    }

    #[test]
    fn new_request_drops_duplicate_topics() {
        let request = SubscriptionRequest::new(
            SubscriptionMethod::Unsubscribe,
            topics(&["a@trade", "b@trade", "a@trade"]),
            1,
        );
        assert_eq!(request.topics(), topics(&["a@trade", "b@trade"]).as_slice());
    }

    #[test]
    fn ids_increase_monotonically() {
        let registry = SubscriptionRegistry::default();
        let first = registry.subscribe(topics(&["a@trade"])).unwrap().into_request();
        let second = registry.subscribe(topics(&["b@trade"])).unwrap().into_request();
        let third = registry.unsubscribe(topics(&["a@trade"])).unwrap().into_request();
        assert_eq!(first.id(), 1);
        assert_eq!(second.id(), 2);
        assert_eq!(third.id(), 3);
    }

    #[test]
    fn disconnected_requests_wait_for_open() {
        let registry = SubscriptionRegistry::default();
        let admission = registry.subscribe(topics(&["a@trade"])).unwrap();
        assert!(matches!(admission, Admission::Queued(_)));
        assert!(admission.request().is_awaiting_send());
        assert!(!admission.should_dispatch());
    }

    #[test]
    fn connected_requests_dispatch_immediately() {
        let registry = connected_registry(DEFAULT_MAX_TOPICS);
        let admission = registry.subscribe(topics(&["a@trade"])).unwrap();
        assert!(admission.should_dispatch());
        assert!(!admission.request().is_awaiting_send());
    }

    #[test]
    fn superset_request_deduplicates() {
        let registry = connected_registry(DEFAULT_MAX_TOPICS);
        let first = registry
            .subscribe(topics(&["a@trade", "b@trade"]))
            .unwrap()
            .into_request();

        let second = registry.subscribe(topics(&["a@trade"])).unwrap();
        assert_eq!(second, Admission::Existing(first.clone()));

        // Nothing new was recorded
        assert_eq!(registry.requests().len(), 1);
    }

    #[test]
    fn dedup_is_per_method() {
        let registry = connected_registry(DEFAULT_MAX_TOPICS);
        let _ = registry.subscribe(topics(&["a@trade"])).unwrap();
        let admission = registry.unsubscribe(topics(&["a@trade"])).unwrap();
        assert!(admission.should_dispatch());
        assert_eq!(admission.request().method(), SubscriptionMethod::Unsubscribe);
    }

    #[test]
    fn partial_overlap_creates_new_request() {
        let registry = connected_registry(DEFAULT_MAX_TOPICS);
        let _ = registry.subscribe(topics(&["a@trade"])).unwrap();
        let admission = registry.subscribe(topics(&["a@trade", "b@trade"])).unwrap();
        assert!(admission.should_dispatch());
        assert_eq!(admission.request().id(), 2);
    }

    #[test]
    fn empty_topics_rejected() {
        let registry = SubscriptionRegistry::default();
        assert_eq!(
            registry.subscribe(Vec::new()).unwrap_err(),
            SubscriptionError::EmptyTopics
        );
    }

    #[test]
    fn cap_counts_only_acknowledged_topics() {
        let registry = connected_registry(3);

        // Unacknowledged topics do not count toward the cap
        let a = registry.subscribe(topics(&["a@trade", "b@trade"])).unwrap();
        let b = registry.subscribe(topics(&["c@trade", "d@trade"])).unwrap();
        assert!(a.should_dispatch());
        assert!(b.should_dispatch());

        registry.on_acknowledge(a.request().id());
        assert_eq!(registry.acknowledged_topic_count(), 2);

        let err = registry.subscribe(topics(&["e@trade", "f@trade"])).unwrap_err();
        assert_eq!(
            err,
            SubscriptionError::CapacityExceeded {
                requested: 2,
                acknowledged: 2,
                limit: 3
            }
        );

        // Exactly at the cap is allowed
        assert!(registry.subscribe(topics(&["e@trade"])).is_ok());
    }

    #[test]
    fn cap_checked_before_dedup() {
        let registry = connected_registry(2);
        let request = registry
            .subscribe(topics(&["a@trade", "b@trade"]))
            .unwrap()
            .into_request();
        registry.on_acknowledge(request.id());

        // Would deduplicate, but the cap check runs first
        let err = registry.subscribe(topics(&["a@trade"])).unwrap_err();
        assert!(matches!(err, SubscriptionError::CapacityExceeded { .. }));
    }

    #[test]
    fn acknowledge_marks_request() {
        let registry = connected_registry(DEFAULT_MAX_TOPICS);
        let id = registry.subscribe(topics(&["a@trade"])).unwrap().request().id();

        let acked = registry.on_acknowledge(id).unwrap();
        assert!(acked.is_acknowledged());
        assert!(!acked.is_awaiting_send());
        assert!(registry.get(id).unwrap().is_acknowledged());

        assert!(registry.on_acknowledge(999).is_none());
    }

    #[test]
    fn disconnect_queues_acknowledged_and_in_flight() {
        let registry = connected_registry(DEFAULT_MAX_TOPICS);
        let acked = registry.subscribe(topics(&["a@trade"])).unwrap().into_request();
        let in_flight = registry.subscribe(topics(&["b@trade"])).unwrap().into_request();
        registry.on_acknowledge(acked.id());

        assert_eq!(registry.mark_disconnected(), 2);
        assert!(!registry.is_connected());
        for request in registry.requests() {
            assert!(!request.is_acknowledged());
            assert!(request.is_awaiting_send());
        }
        assert_eq!(registry.acknowledged_topic_count(), 0);

        let replay = registry.take_replay();
        let ids: Vec<_> = replay.iter().map(SubscriptionRequest::id).collect();
        assert_eq!(ids, vec![acked.id(), in_flight.id()]);
        assert!(replay.iter().all(|r| !r.is_awaiting_send()));
        assert!(registry.is_connected());

        // A second open has nothing left to replay
        assert!(registry.take_replay().is_empty());
    }

    #[test]
    fn rejected_requests_are_not_replayed() {
        let registry = connected_registry(DEFAULT_MAX_TOPICS);
        let bad = registry.subscribe(topics(&["bad@nothing"])).unwrap().into_request();
        let good = registry.subscribe(topics(&["a@trade"])).unwrap().into_request();

        assert!(registry.on_reject(bad.id()).unwrap().is_rejected());
        registry.mark_disconnected();

        let replay = registry.take_replay();
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].id(), good.id());

        // A rejected request never satisfies dedup
        let retry = registry.subscribe(topics(&["bad@nothing"])).unwrap();
        assert!(retry.should_dispatch());
    }

    #[test]
    fn replay_may_exceed_cap_transiently() {
        let registry = connected_registry(2);
        let first = registry.subscribe(topics(&["a@trade", "b@trade"])).unwrap();
        let second = registry.subscribe(topics(&["c@trade", "d@trade"])).unwrap();
        registry.on_acknowledge(first.request().id());

        registry.mark_disconnected();
        let replay = registry.take_replay();
        assert_eq!(replay.len(), 2);

        // The server acknowledges both on the new connection
        registry.on_acknowledge(first.request().id());
        registry.on_acknowledge(second.request().id());
        assert_eq!(registry.acknowledged_topic_count(), 4);

        // Further requests are refused until the overshoot drains
        assert!(matches!(
            registry.subscribe(topics(&["e@trade"])),
            Err(SubscriptionError::CapacityExceeded { .. })
        ));
    }

    #[test]
    fn stats_partition_requests() {
        let registry = connected_registry(10);
        let a = registry.subscribe([Topic::kline("btcusdt", Interval::OneMinute)]).unwrap();
        let _b = registry.subscribe(topics(&["b@trade"])).unwrap();
        let c = registry.subscribe(topics(&["c@trade"])).unwrap();
        registry.on_acknowledge(a.request().id());
        registry.on_reject(c.request().id());

        let stats = registry.stats();
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.acknowledged_requests, 1);
        assert_eq!(stats.acknowledged_topics, 1);
        assert_eq!(stats.in_flight, 1);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.awaiting_send, 0);
        assert_eq!(stats.max_topics, 10);
    }

    #[test]
    fn concurrent_submissions_get_unique_ids() {
        let registry = Arc::new(SubscriptionRegistry::new(100_000));
        let mut handles = vec![];

        for worker in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(thread::spawn(move || {
                (0..100)
                    .map(|i| {
                        registry
                            .subscribe([Topic::trade(&format!("s{worker}x{i}"))])
                            .unwrap()
                            .request()
                            .id()
                    })
                    .collect::<Vec<_>>()
            }));
        }

        let mut ids: Vec<RequestId> = handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 800);
        assert_eq!(ids.first(), Some(&1));
        assert_eq!(ids.last(), Some(&800));
    }
}

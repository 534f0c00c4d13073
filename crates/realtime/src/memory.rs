//! In-process transport with scriptable subscribe outcomes.
//!
//! Used by the test suite and the probe app. Each subscribe attempt pops
//! the next scripted outcome for its topic (falling back to the default
//! outcome); `None` leaves the attempt pending until [`MemoryTransport::emit_status`]
//! is called. Every channel creation, subscribe attempt, removal and auth
//! refresh is recorded for inspection.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use crate::transport::{
    EventFilter, EventKind, PayloadCallback, RawChannel, RealtimeTransport, StatusCallback,
};
use crate::types::{RemoveOutcome, SubscribeStatus};

type SharedStatusCallback = Arc<dyn Fn(SubscribeStatus) + Send + Sync>;
type Bindings = Arc<Mutex<Vec<(EventKind, EventFilter, PayloadCallback)>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct StatusSlot {
    callback: Option<SharedStatusCallback>,
    removed: bool,
}

struct LiveChannel {
    id: u64,
    topic: String,
    slot: Arc<Mutex<StatusSlot>>,
    bindings: Bindings,
}

struct MemoryState {
    default_outcome: Option<SubscribeStatus>,
    scripts: HashMap<String, VecDeque<Option<SubscribeStatus>>>,
    remove_outcome: RemoveOutcome,
    live: Vec<LiveChannel>,
    created: HashMap<String, usize>,
    removed: HashMap<String, usize>,
    attempts: HashMap<String, Vec<Instant>>,
    auth_refreshes: usize,
    auth_delay: Duration,
}

/// Transport that keeps every channel in memory.
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
    next_id: AtomicU64,
}

/// Raw channel handed out by [`MemoryTransport`].
pub struct MemoryChannel {
    id: u64,
    topic: String,
    slot: Arc<Mutex<StatusSlot>>,
    bindings: Bindings,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTransport {
    /// Creates a transport whose subscribe attempts succeed by default.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                default_outcome: Some(SubscribeStatus::Subscribed),
                scripts: HashMap::new(),
                remove_outcome: RemoveOutcome::Ok,
                live: Vec::new(),
                created: HashMap::new(),
                removed: HashMap::new(),
                attempts: HashMap::new(),
                auth_refreshes: 0,
                auth_delay: Duration::ZERO,
            })),
            next_id: AtomicU64::new(1),
        }
    }

    /// Outcome used when a topic has no scripted outcome left.
    /// `None` leaves attempts pending.
    pub fn set_default_outcome(&self, outcome: Option<SubscribeStatus>) {
        lock(&self.state).default_outcome = outcome;
    }

    /// Queues outcomes for the next subscribe attempts on `topic`.
    pub fn push_outcomes(
        &self,
        topic: &str,
        outcomes: impl IntoIterator<Item = Option<SubscribeStatus>>,
    ) {
        lock(&self.state)
            .scripts
            .entry(topic.to_string())
            .or_default()
            .extend(outcomes);
    }

    /// Makes every `set_auth` call take `delay` before settling.
    pub fn set_auth_delay(&self, delay: Duration) {
        lock(&self.state).auth_delay = delay;
    }

    /// Outcome code returned by later `remove_channel` calls.
    pub fn set_remove_outcome(&self, outcome: RemoveOutcome) {
        lock(&self.state).remove_outcome = outcome;
    }

    /// Reports `status` on the newest subscribed channel for `topic`.
    /// Returns `false` if no such channel is live.
    pub fn emit_status(&self, topic: &str, status: SubscribeStatus) -> bool {
        let callback = {
            let state = lock(&self.state);
            state
                .live
                .iter()
                .rev()
                .filter(|c| c.topic == topic)
                .find_map(|c| lock(&c.slot).callback.clone())
        };
        match callback {
            Some(cb) => {
                trace!(topic, ?status, "memory transport emitting status");
                cb(status);
                true
            }
            None => false,
        }
    }

    /// Delivers a payload to every live binding of `kind` on `topic`.
    /// Returns the number of callbacks invoked.
    pub fn emit_payload(&self, topic: &str, kind: EventKind, payload: &serde_json::Value) -> usize {
        let callbacks: Vec<PayloadCallback> = {
            let state = lock(&self.state);
            state
                .live
                .iter()
                .filter(|c| c.topic == topic)
                .flat_map(|c| {
                    lock(&c.bindings)
                        .iter()
                        .filter(|(k, _, _)| *k == kind)
                        .map(|(_, _, cb)| cb.clone())
                        .collect::<Vec<_>>()
                })
                .collect()
        };
        for cb in &callbacks {
            cb(payload);
        }
        callbacks.len()
    }

    /// Raw channels created for `topic` so far.
    pub fn created_count(&self, topic: &str) -> usize {
        lock(&self.state).created.get(topic).copied().unwrap_or(0)
    }

    /// Raw channels removed for `topic` so far.
    pub fn removed_count(&self, topic: &str) -> usize {
        lock(&self.state).removed.get(topic).copied().unwrap_or(0)
    }

    /// Number of subscribe attempts made on `topic`.
    pub fn subscribe_count(&self, topic: &str) -> usize {
        self.subscribe_times(topic).len()
    }

    /// Instants at which each subscribe attempt on `topic` started.
    pub fn subscribe_times(&self, topic: &str) -> Vec<Instant> {
        lock(&self.state)
            .attempts
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Channels created and not yet removed, across all topics.
    pub fn live_count(&self) -> usize {
        lock(&self.state).live.len()
    }

    pub fn auth_refresh_count(&self) -> usize {
        lock(&self.state).auth_refreshes
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl RealtimeTransport for MemoryTransport {
    type Channel = MemoryChannel;

    fn channel(&self, topic: &str) -> MemoryChannel {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(Mutex::new(StatusSlot::default()));
        let bindings: Bindings = Arc::new(Mutex::new(Vec::new()));

        let mut state = lock(&self.state);
        *state.created.entry(topic.to_string()).or_default() += 1;
        state.live.push(LiveChannel {
            id,
            topic: topic.to_string(),
            slot: slot.clone(),
            bindings: bindings.clone(),
        });

        MemoryChannel {
            id,
            topic: topic.to_string(),
            slot,
            bindings,
            state: self.state.clone(),
        }
    }

    fn remove_channel(&self, channel: &MemoryChannel) -> impl Future<Output = RemoveOutcome> + Send {
        let outcome = {
            let mut slot = lock(&channel.slot);
            slot.removed = true;
            slot.callback = None;
            drop(slot);

            let mut state = lock(&self.state);
            state.live.retain(|c| c.id != channel.id);
            *state.removed.entry(channel.topic.clone()).or_default() += 1;
            state.remove_outcome
        };
        async move { outcome }
    }

    fn set_auth(&self) -> impl Future<Output = ()> + Send {
        let delay = {
            let mut state = lock(&self.state);
            state.auth_refreshes += 1;
            state.auth_delay
        };
        async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }
}

impl MemoryChannel {
    /// Transport-unique channel id.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn binding_count(&self) -> usize {
        lock(&self.bindings).len()
    }

    /// Invokes this channel's bindings of `kind` with `payload`.
    pub fn dispatch(&self, kind: EventKind, payload: &serde_json::Value) {
        let callbacks: Vec<PayloadCallback> = lock(&self.bindings)
            .iter()
            .filter(|(k, _, _)| *k == kind)
            .map(|(_, _, cb)| cb.clone())
            .collect();
        for cb in callbacks {
            cb(payload);
        }
    }
}

impl RawChannel for MemoryChannel {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn on(&mut self, kind: EventKind, filter: &EventFilter, callback: PayloadCallback) {
        lock(&self.bindings).push((kind, filter.clone(), callback));
    }

    fn subscribe(&self, on_status: StatusCallback) {
        let on_status: SharedStatusCallback = Arc::from(on_status);
        {
            let mut slot = lock(&self.slot);
            if slot.removed {
                trace!(topic = %self.topic, "subscribe on removed memory channel ignored");
                return;
            }
            slot.callback = Some(on_status.clone());
        }

        let outcome = {
            let mut state = lock(&self.state);
            state
                .attempts
                .entry(self.topic.clone())
                .or_default()
                .push(Instant::now());
            let default = state.default_outcome.clone();
            match state.scripts.get_mut(&self.topic).and_then(VecDeque::pop_front) {
                Some(scripted) => scripted,
                None => default,
            }
        };

        if let Some(status) = outcome {
            on_status(status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_outcomes_then_default() {
        let transport = MemoryTransport::new();
        transport.push_outcomes("a", [Some(SubscribeStatus::TimedOut), None]);

        let seen = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..3 {
            let channel = transport.channel("a");
            let seen = seen.clone();
            channel.subscribe(Box::new(move |s| lock(&seen).push(s)));
        }

        assert_eq!(
            *lock(&seen),
            vec![SubscribeStatus::TimedOut, SubscribeStatus::Subscribed]
        );
        assert_eq!(transport.subscribe_count("a"), 3);
    }

    #[tokio::test]
    async fn emit_status_reaches_pending_channel() {
        let transport = MemoryTransport::new();
        transport.set_default_outcome(None);

        let channel = transport.channel("a");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        channel.subscribe(Box::new(move |status| lock(&s).push(status)));
        assert!(lock(&seen).is_empty());

        assert!(transport.emit_status("a", SubscribeStatus::Subscribed));
        assert!(!transport.emit_status("b", SubscribeStatus::Subscribed));
        assert_eq!(*lock(&seen), vec![SubscribeStatus::Subscribed]);
    }

    #[tokio::test]
    async fn removal_drops_callback_and_is_counted() {
        let transport = MemoryTransport::new();
        transport.set_default_outcome(None);
        transport.set_remove_outcome(RemoveOutcome::TimedOut);

        let channel = transport.channel("a");
        channel.subscribe(Box::new(|_| {}));
        assert_eq!(transport.live_count(), 1);

        assert_eq!(transport.remove_channel(&channel).await, RemoveOutcome::TimedOut);
        assert_eq!(transport.removed_count("a"), 1);
        assert_eq!(transport.live_count(), 0);
        assert!(!transport.emit_status("a", SubscribeStatus::Subscribed));
    }

    #[tokio::test]
    async fn payloads_reach_matching_bindings() {
        let transport = MemoryTransport::new();
        let mut channel = transport.channel("a");
        let hits = Arc::new(AtomicU64::new(0));
        let h = hits.clone();
        channel.on(
            EventKind::Broadcast,
            &EventFilter::event("balance"),
            Arc::new(move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let payload = serde_json::json!({"amount": 21});
        assert_eq!(transport.emit_payload("a", EventKind::Broadcast, &payload), 1);
        assert_eq!(transport.emit_payload("a", EventKind::Presence, &payload), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn set_auth_waits_for_configured_delay() {
        let transport = MemoryTransport::new();
        transport.set_auth_delay(Duration::from_millis(50));

        let start = Instant::now();
        transport.set_auth().await;

        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(transport.auth_refresh_count(), 1);
    }

    #[tokio::test]
    async fn set_auth_is_counted() {
        let transport = MemoryTransport::new();
        transport.set_auth().await;
        transport.set_auth().await;
        assert_eq!(transport.auth_refresh_count(), 2);
    }
}

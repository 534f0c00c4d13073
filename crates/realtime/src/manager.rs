//! Realtime channel manager.
//!
//! Owns every channel's state, reference-counts subscribers per topic,
//! routes transport status callbacks into status transitions, and fans
//! those transitions out to listeners and the event stream.

use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::builder::ChannelBuilder;
use crate::config::RealtimeConfig;
use crate::error::RealtimeError;
use crate::handle::ChannelHandle;
use crate::listeners::{StatusListeners, StatusSubscription};
use crate::scheduler::{ResubscribeQueue, RetryScope};
use crate::transport::{RawChannel, RealtimeTransport};
use crate::types::{
    ChannelStatus, ConnectedCallback, RealtimeEvent, RemoveOutcome, StatusListener,
    SubscribeStatus,
};

/// Per-topic state. Only the manager touches it.
pub(crate) struct ChannelState<C> {
    /// Unique per registration; a topic removed and added again gets a new id.
    pub(crate) id: u64,
    pub(crate) builder: ChannelBuilder,
    /// `None` after the channel was closed at the transport while offline.
    pub(crate) raw_channel: Option<Arc<C>>,
    /// Generation of the latest subscribe attempt. Status callbacks from
    /// older attempts are ignored.
    pub(crate) generation: u64,
    status: ChannelStatus,
    pub(crate) last_error: Option<RealtimeError>,
    pub(crate) retry_timer: Option<CancellationToken>,
    pub(crate) connected_callbacks: Vec<ConnectedCallback>,
    pub(crate) subscriber_count: usize,
}

impl<C> ChannelState<C> {
    fn new(id: u64, builder: ChannelBuilder, raw_channel: C) -> Self {
        Self {
            id,
            builder,
            raw_channel: Some(Arc::new(raw_channel)),
            generation: 0,
            status: ChannelStatus::Idle,
            last_error: None,
            retry_timer: None,
            connected_callbacks: Vec::new(),
            subscriber_count: 0,
        }
    }

    pub(crate) fn status(&self) -> ChannelStatus {
        self.status
    }
}

/// Everything behind the manager's lock.
pub(crate) struct Registry<C> {
    pub(crate) channels: HashMap<String, ChannelState<C>>,
    pub(crate) queue: ResubscribeQueue,
    pub(crate) is_processing_queue: bool,
    pub(crate) is_online: bool,
    pub(crate) is_active: bool,
    next_generation: u64,
    next_state_id: u64,
    /// Status changes awaiting delivery, in the order they were applied.
    pending: VecDeque<(String, ChannelStatus)>,
    delivering: bool,
}

impl<C> Registry<C> {
    fn new() -> Self {
        Self {
            channels: HashMap::new(),
            queue: ResubscribeQueue::default(),
            is_processing_queue: false,
            is_online: true,
            is_active: true,
            next_generation: 0,
            next_state_id: 0,
            pending: VecDeque::new(),
            delivering: false,
        }
    }

    /// Sole writer of `ChannelState::status`. A change is queued for
    /// delivery; the caller must call
    /// [`RealtimeManager::flush_status_changes`] once the lock is released.
    pub(crate) fn set_status(&mut self, topic: &str, status: ChannelStatus) {
        if let Some(state) = self.channels.get_mut(topic)
            && state.status != status
        {
            state.status = status;
            self.pending.push_back((topic.to_string(), status));
        }
    }

    /// Whether `generation` is the latest attempt on `topic`.
    fn is_current(&self, topic: &str, generation: u64) -> bool {
        self.channels
            .get(topic)
            .is_some_and(|s| s.generation == generation)
    }

    pub(crate) fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// The state for `topic`, if it is still the registration `id`.
    pub(crate) fn state_for(&mut self, topic: &str, id: u64) -> Option<&mut ChannelState<C>> {
        self.channels.get_mut(topic).filter(|s| s.id == id)
    }
}

pub(crate) struct Inner<T: RealtimeTransport> {
    pub(crate) transport: Arc<T>,
    pub(crate) config: RealtimeConfig,
    registry: Mutex<Registry<T::Channel>>,
    listeners: StatusListeners,
    events_tx: mpsc::Sender<RealtimeEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<RealtimeEvent>>>,
}

/// Multiplexes ref-counted channels over one shared transport.
///
/// Cloning is cheap; clones share the same state. Must be used from within
/// a Tokio runtime: retries run on a spawned task.
///
/// Status listeners see every change in the order it was applied, on any
/// runtime flavor. A change made while another thread is delivering is
/// handed to that thread, so it may reach listeners after the call that
/// made it returns.
pub struct RealtimeManager<T: RealtimeTransport> {
    pub(crate) inner: Arc<Inner<T>>,
}

impl<T: RealtimeTransport> Clone for RealtimeManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: RealtimeTransport> RealtimeManager<T> {
    /// Creates a manager over `transport`. Starts online and active.
    pub fn new(transport: Arc<T>, config: RealtimeConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                registry: Mutex::new(Registry::new()),
                listeners: StatusListeners::new(),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
            }),
        }
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&self) -> Option<mpsc::Receiver<RealtimeEvent>> {
        self.inner
            .events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.inner.config
    }

    /// Starts describing a channel for `topic`.
    pub fn channel(&self, topic: &str) -> ChannelBuilder {
        ChannelBuilder::new(topic)
    }

    /// Registers a channel, or returns a handle to the existing one for the
    /// same topic without building anything.
    pub fn add_channel(&self, builder: ChannelBuilder) -> ChannelHandle<T> {
        let topic = builder.topic().to_string();
        {
            let mut reg = self.registry();
            if reg.channels.contains_key(&topic) {
                debug!(topic = %topic, "channel already registered, reusing");
            } else {
                let raw = builder.build(self.inner.transport.as_ref());
                reg.next_state_id += 1;
                let id = reg.next_state_id;
                reg.channels
                    .insert(topic.clone(), ChannelState::new(id, builder, raw));
                debug!(topic = %topic, "channel registered");
            }
        }
        ChannelHandle::new(topic, self.clone())
    }

    /// Adds a subscriber to `topic` and joins the channel unless it is
    /// already subscribed or on its way there.
    ///
    /// Resolves on the first terminal outcome of the join. Connection
    /// failures are not returned; they show up as status transitions and
    /// through [`get_channel_error`](Self::get_channel_error).
    pub async fn subscribe(
        &self,
        topic: &str,
        on_connected: Option<ConnectedCallback>,
    ) -> Result<(), RealtimeError> {
        {
            let mut reg = self.registry();
            let state = reg
                .channels
                .get_mut(topic)
                .ok_or_else(|| RealtimeError::NotFound {
                    topic: topic.to_string(),
                })?;

            if let Some(cb) = on_connected
                && !state.connected_callbacks.iter().any(|c| Arc::ptr_eq(c, &cb))
            {
                state.connected_callbacks.push(cb);
            }
            state.subscriber_count += 1;

            let status = state.status();
            if status.is_live() {
                debug!(
                    topic,
                    %status,
                    subscribers = state.subscriber_count,
                    "channel already live"
                );
                return Ok(());
            }
            reg.set_status(topic, ChannelStatus::Subscribing);
        }
        self.flush_status_changes();

        self.attempt_subscribe(topic, None).await;
        Ok(())
    }

    /// Drops a subscriber from `topic`. The channel is torn down once the
    /// last subscriber is gone.
    pub async fn remove_channel(&self, topic: &str, on_connected: Option<&ConnectedCallback>) {
        let raw = {
            let mut reg = self.registry();
            let Some(state) = reg.channels.get_mut(topic) else {
                debug!(topic, "remove for unknown channel ignored");
                return;
            };

            if let Some(cb) = on_connected {
                state.connected_callbacks.retain(|c| !Arc::ptr_eq(c, cb));
            }
            state.subscriber_count = state.subscriber_count.saturating_sub(1);
            if state.subscriber_count > 0 {
                debug!(
                    topic,
                    subscribers = state.subscriber_count,
                    "channel still has subscribers"
                );
                return;
            }

            if let Some(timer) = state.retry_timer.take() {
                timer.cancel();
            }
            reg.queue.remove(topic);
            // Drop the entry before awaiting teardown so a concurrent
            // add_channel builds a fresh channel instead of reusing this one.
            reg.channels.remove(topic).and_then(|s| s.raw_channel)
        };

        match raw {
            Some(raw) => {
                let outcome = self.inner.transport.remove_channel(&raw).await;
                log_remove_outcome(topic, outcome);
            }
            None => debug!(topic, "channel removed, transport side already closed"),
        }
    }

    pub fn get_channel_status(&self, topic: &str) -> Option<ChannelStatus> {
        self.registry().channels.get(topic).map(ChannelState::status)
    }

    pub fn get_channel_error(&self, topic: &str) -> Option<RealtimeError> {
        self.registry()
            .channels
            .get(topic)
            .and_then(|s| s.last_error.clone())
    }

    /// Watches status changes of `topic`. The topic need not be registered
    /// yet.
    pub fn subscribe_to_channel_status_change(
        &self,
        topic: &str,
        listener: StatusListener,
    ) -> StatusSubscription {
        self.inner.listeners.add(topic, listener)
    }

    /// Current subscriber count, or `None` for an unknown topic.
    pub fn subscriber_count(&self, topic: &str) -> Option<usize> {
        self.registry()
            .channels
            .get(topic)
            .map(|s| s.subscriber_count)
    }

    /// Registered topics, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.registry().channels.keys().cloned().collect();
        topics.sort_unstable();
        topics
    }

    /// Topics waiting in (or at the head of) the resubscribe queue.
    pub fn queued_topics(&self) -> Vec<String> {
        self.registry().queue.topics()
    }

    /// Whether `topic` has a backoff sequence that can still be cancelled.
    pub fn has_pending_retry(&self, topic: &str) -> bool {
        self.registry()
            .channels
            .get(topic)
            .is_some_and(|s| s.retry_timer.is_some())
    }

    // -----------------------------------------------------------------------
    // Internals shared with the scheduler and activity modules
    // -----------------------------------------------------------------------

    pub(crate) fn registry(&self) -> MutexGuard<'_, Registry<T::Channel>> {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies a status and notifies if it changed.
    #[cfg(test)]
    pub(crate) fn update_status(&self, topic: &str, status: ChannelStatus) {
        self.registry().set_status(topic, status);
        self.flush_status_changes();
    }

    /// Delivers queued status changes to listeners and the event stream.
    /// Called without the registry lock held.
    ///
    /// One caller drains at a time. Others, including listeners that change
    /// a status from inside their callback, only enqueue and return.
    pub(crate) fn flush_status_changes(&self) {
        {
            let mut reg = self.registry();
            if reg.delivering || reg.pending.is_empty() {
                return;
            }
            reg.delivering = true;
        }
        loop {
            let (topic, status) = {
                let mut reg = self.registry();
                match reg.pending.pop_front() {
                    Some(change) => change,
                    None => {
                        reg.delivering = false;
                        return;
                    }
                }
            };
            trace!(topic = %topic, %status, "channel status changed");
            self.inner.listeners.notify(&topic, status);
            self.emit(RealtimeEvent::StatusChanged { topic, status });
        }
    }

    pub(crate) fn emit(&self, event: RealtimeEvent) {
        if let Err(e) = self.inner.events_tx.try_send(event) {
            trace!("dropping realtime event: {e}");
        }
    }

    /// Runs one subscribe attempt against the current raw channel, building
    /// it first if the previous one was closed. Returns on the attempt's
    /// first terminal status, or when the retry scope is cancelled.
    ///
    /// A retry attempt only touches the registration its sequence started
    /// on, and does nothing once cancelled.
    pub(crate) async fn attempt_subscribe(&self, topic: &str, retry: Option<&RetryScope>) {
        if self.inner.config.refresh_auth {
            self.inner.transport.set_auth().await;
        }

        let (raw, generation) = {
            let mut reg = self.registry();
            if let Some(retry) = retry
                && retry.cancel.is_cancelled()
            {
                debug!(topic, "retry cancelled during auth refresh");
                return;
            }
            let generation = reg.next_generation();
            let state = match retry {
                Some(retry) => reg.state_for(topic, retry.state_id),
                None => reg.channels.get_mut(topic),
            };
            let Some(state) = state else {
                debug!(topic, "channel removed before subscribe attempt");
                return;
            };
            if state.raw_channel.is_none() {
                debug!(topic, "rebuilding closed channel");
                let raw = state.builder.build(self.inner.transport.as_ref());
                state.raw_channel = Some(Arc::new(raw));
            }
            state.generation = generation;
            (state.raw_channel.clone(), generation)
        };
        let Some(raw) = raw else {
            return;
        };

        let (tx, rx) = oneshot::channel();
        let first = Mutex::new(Some(tx));
        let weak = Arc::downgrade(&self.inner);
        let cb_topic = topic.to_string();
        raw.subscribe(Box::new(move |status| {
            if let Some(inner) = weak.upgrade() {
                RealtimeManager { inner }.handle_status(&cb_topic, generation, status.clone());
            }
            let tx = first.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(tx) = tx {
                let _ = tx.send(status);
            }
        }));

        let outcome = match retry {
            Some(retry) => tokio::select! {
                _ = retry.cancel.cancelled() => None,
                status = rx => status.ok(),
            },
            None => rx.await.ok(),
        };
        trace!(topic, generation, ?outcome, "subscribe attempt settled");
    }

    /// Routes a transport status for `topic` into the state machine.
    fn handle_status(&self, topic: &str, generation: u64, status: SubscribeStatus) {
        match status {
            SubscribeStatus::Subscribed => self.on_subscribed(topic, generation),
            SubscribeStatus::Closed => {
                {
                    let mut reg = self.registry();
                    if !reg.is_current(topic, generation) {
                        debug!(topic, generation, "ignoring close from superseded attempt");
                        return;
                    }
                    reg.set_status(topic, ChannelStatus::Closed);
                }
                debug!(topic, "channel closed by transport");
                self.flush_status_changes();
            }
            SubscribeStatus::ChannelError(_) | SubscribeStatus::TimedOut => {
                let message = status.error_message().unwrap_or_default();
                self.on_channel_error(topic, generation, message);
            }
        }
    }

    /// Marks the channel joined. A retry sequence still running for it is
    /// cancelled and dequeued here, whether the join came from its own
    /// attempt or from the transport rejoining on its own.
    fn on_subscribed(&self, topic: &str, generation: u64) {
        let (callbacks, recovered) = {
            let mut reg = self.registry();
            let Some(state) = reg
                .channels
                .get_mut(topic)
                .filter(|s| s.generation == generation)
            else {
                debug!(topic, generation, "ignoring join from superseded attempt");
                return;
            };
            let recovered = state
                .last_error
                .take()
                .is_some_and(|e| e.is_transient());
            if let Some(timer) = state.retry_timer.take() {
                timer.cancel();
            }
            let callbacks = state.connected_callbacks.clone();
            reg.queue.remove(topic);
            reg.set_status(topic, ChannelStatus::Subscribed);
            (callbacks, recovered)
        };
        self.flush_status_changes();
        info!(
            topic,
            recovered,
            callbacks = callbacks.len(),
            "channel subscribed"
        );
        self.emit(RealtimeEvent::Connected {
            topic: topic.to_string(),
        });

        for cb in callbacks {
            if catch_unwind(AssertUnwindSafe(|| cb())).is_err() {
                error!(topic, "connected callback panicked");
            }
        }
    }

    fn on_channel_error(&self, topic: &str, generation: u64, message: String) {
        let mut reg = self.registry();
        if !reg.is_current(topic, generation) {
            debug!(topic, generation, "ignoring error from superseded attempt");
            return;
        }

        if !(reg.is_online && reg.is_active) {
            // Retrying in the background is wasted effort; keep the state so
            // the next online+active transition picks it up.
            let raw = reg.channels.get_mut(topic).and_then(|state| {
                if let Some(timer) = state.retry_timer.take() {
                    timer.cancel();
                }
                state.raw_channel.take()
            });
            reg.queue.remove(topic);
            reg.set_status(topic, ChannelStatus::Closed);
            drop(reg);

            info!(topic, error = %message, "channel error while offline or inactive, closing");
            self.flush_status_changes();
            if let Some(raw) = raw {
                self.spawn_teardown(topic, raw);
            }
            return;
        }

        if let Some(state) = reg.channels.get_mut(topic) {
            state.last_error = Some(RealtimeError::Connection {
                topic: topic.to_string(),
                message: message.clone(),
            });
        }
        drop(reg);

        warn!(topic, error = %message, "channel error, scheduling resubscribe");
        self.resubscribe(topic);
    }

    pub(crate) fn spawn_teardown(&self, topic: &str, raw: Arc<T::Channel>) {
        let transport = self.inner.transport.clone();
        let topic = topic.to_string();
        tokio::spawn(async move {
            let outcome = transport.remove_channel(&raw).await;
            log_remove_outcome(&topic, outcome);
        });
    }
}

fn log_remove_outcome(topic: &str, outcome: RemoveOutcome) {
    match outcome {
        RemoveOutcome::Ok => debug!(topic, "transport channel removed"),
        other => warn!(topic, outcome = ?other, "transport channel removal did not complete cleanly"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::memory::MemoryTransport;

    fn manager() -> (RealtimeManager<MemoryTransport>, Arc<MemoryTransport>) {
        let transport = Arc::new(MemoryTransport::new());
        (
            RealtimeManager::new(transport.clone(), RealtimeConfig::default()),
            transport,
        )
    }

    fn counter() -> (ConnectedCallback, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let cb: ConnectedCallback = Arc::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        (cb, hits)
    }

    #[tokio::test]
    async fn add_channel_starts_idle() {
        let (mgr, transport) = manager();
        let handle = mgr.add_channel(mgr.channel("balances"));

        assert_eq!(handle.topic(), "balances");
        assert_eq!(mgr.get_channel_status("balances"), Some(ChannelStatus::Idle));
        assert_eq!(mgr.subscriber_count("balances"), Some(0));
        assert_eq!(transport.created_count("balances"), 1);
    }

    #[tokio::test]
    async fn add_channel_is_idempotent() {
        let (mgr, transport) = manager();
        let first = mgr.add_channel(mgr.channel("quotes"));
        let second = mgr.add_channel(mgr.channel("quotes"));

        assert_eq!(first.topic(), second.topic());
        assert_eq!(transport.created_count("quotes"), 1);
        assert_eq!(mgr.topics(), vec!["quotes".to_string()]);
    }

    #[tokio::test]
    async fn subscribe_unknown_topic_fails() {
        let (mgr, _) = manager();
        let err = mgr.subscribe("missing", None).await.unwrap_err();
        assert_eq!(
            err,
            RealtimeError::NotFound {
                topic: "missing".into()
            }
        );
    }

    #[tokio::test]
    async fn subscribe_joins_and_runs_connected_callback() {
        let (mgr, transport) = manager();
        mgr.add_channel(mgr.channel("proofs"));
        let (cb, hits) = counter();

        mgr.subscribe("proofs", Some(cb)).await.unwrap();

        assert_eq!(mgr.get_channel_status("proofs"), Some(ChannelStatus::Subscribed));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(transport.auth_refresh_count(), 1);
        assert_eq!(mgr.get_channel_error("proofs"), None);
    }

    #[tokio::test]
    async fn second_subscriber_does_not_rejoin() {
        let (mgr, transport) = manager();
        mgr.add_channel(mgr.channel("proofs"));
        mgr.subscribe("proofs", None).await.unwrap();
        mgr.subscribe("proofs", None).await.unwrap();

        assert_eq!(transport.subscribe_count("proofs"), 1);
        assert_eq!(mgr.subscriber_count("proofs"), Some(2));
    }

    #[tokio::test]
    async fn auth_refresh_can_be_disabled() {
        let transport = Arc::new(MemoryTransport::new());
        let config = RealtimeConfig {
            refresh_auth: false,
            ..RealtimeConfig::default()
        };
        let mgr = RealtimeManager::new(transport.clone(), config);
        mgr.add_channel(mgr.channel("a"));
        mgr.subscribe("a", None).await.unwrap();

        assert_eq!(transport.auth_refresh_count(), 0);
    }

    #[tokio::test]
    async fn transport_close_marks_channel_closed() {
        let (mgr, transport) = manager();
        transport.push_outcomes("a", [Some(SubscribeStatus::Closed)]);
        mgr.add_channel(mgr.channel("a"));

        mgr.subscribe("a", None).await.unwrap();

        assert_eq!(mgr.get_channel_status("a"), Some(ChannelStatus::Closed));
        assert!(mgr.queued_topics().is_empty());
    }

    #[tokio::test]
    async fn panicking_connected_callback_is_isolated() {
        let (mgr, transport) = manager();
        transport.set_default_outcome(None);
        mgr.add_channel(mgr.channel("a"));

        let m = mgr.clone();
        let first = tokio::spawn(async move {
            m.subscribe("a", Some(Arc::new(|| panic!("observer bug"))))
                .await
        });
        tokio::task::yield_now().await;
        assert_eq!(mgr.get_channel_status("a"), Some(ChannelStatus::Subscribing));

        let (cb, hits) = counter();
        mgr.subscribe("a", Some(cb)).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        assert!(transport.emit_status("a", SubscribeStatus::Subscribed));
        first.await.unwrap().unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(mgr.get_channel_status("a"), Some(ChannelStatus::Subscribed));
    }

    #[tokio::test]
    async fn stale_generation_is_ignored() {
        let (mgr, _) = manager();
        mgr.add_channel(mgr.channel("a"));
        mgr.subscribe("a", None).await.unwrap();

        mgr.handle_status("a", 0, SubscribeStatus::Closed);
        assert_eq!(mgr.get_channel_status("a"), Some(ChannelStatus::Subscribed));
    }

    #[tokio::test]
    async fn duplicate_connected_callback_registered_once() {
        let (mgr, _) = manager();
        mgr.add_channel(mgr.channel("a"));
        let (cb, _) = counter();
        mgr.subscribe("a", Some(cb.clone())).await.unwrap();
        mgr.subscribe("a", Some(cb.clone())).await.unwrap();

        assert_eq!(mgr.registry().channels["a"].connected_callbacks.len(), 1);
        assert_eq!(mgr.subscriber_count("a"), Some(2));
    }

    #[tokio::test]
    async fn remove_unknown_topic_is_noop() {
        let (mgr, transport) = manager();
        mgr.remove_channel("missing", None).await;
        assert_eq!(transport.removed_count("missing"), 0);
    }

    #[tokio::test]
    async fn remove_without_subscribe_tears_down() {
        let (mgr, transport) = manager();
        mgr.add_channel(mgr.channel("a"));
        mgr.remove_channel("a", None).await;

        assert_eq!(mgr.get_channel_status("a"), None);
        assert_eq!(transport.removed_count("a"), 1);
    }

    #[tokio::test]
    async fn status_listener_sees_each_change_once() {
        let (mgr, _) = manager();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let sub = mgr.subscribe_to_channel_status_change(
            "a",
            Arc::new(move |status| s.lock().unwrap().push(status)),
        );
        mgr.add_channel(mgr.channel("a"));
        mgr.subscribe("a", None).await.unwrap();
        mgr.update_status("a", ChannelStatus::Subscribed);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![ChannelStatus::Subscribing, ChannelStatus::Subscribed]
        );

        sub.unsubscribe();
        mgr.update_status("a", ChannelStatus::Closed);
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn status_changes_reach_listeners_in_order() {
        let (mgr, _) = manager();
        mgr.add_channel(mgr.channel("a"));

        // The first listener changes the status again from inside its callback.
        let m = mgr.clone();
        let _first = mgr.subscribe_to_channel_status_change(
            "a",
            Arc::new(move |status| {
                if status == ChannelStatus::Subscribing {
                    m.update_status("a", ChannelStatus::Error);
                }
            }),
        );
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let _second = mgr.subscribe_to_channel_status_change(
            "a",
            Arc::new(move |status| s.lock().unwrap().push(status)),
        );

        mgr.update_status("a", ChannelStatus::Subscribing);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![ChannelStatus::Subscribing, ChannelStatus::Error]
        );
        assert_eq!(mgr.get_channel_status("a"), Some(ChannelStatus::Error));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_changes_are_delivered_in_applied_order() {
        let (mgr, _) = manager();
        let mut events = mgr.take_events().unwrap();
        mgr.add_channel(mgr.channel("a"));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let _sub = mgr.subscribe_to_channel_status_change(
            "a",
            Arc::new(move |status| s.lock().unwrap().push(status)),
        );

        let statuses = [ChannelStatus::Subscribing, ChannelStatus::Closed];
        let tasks: Vec<_> = (0..4)
            .map(|i| {
                let m = mgr.clone();
                tokio::spawn(async move {
                    for n in 0..50 {
                        m.update_status("a", statuses[(i + n) % 2]);
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let seen = seen.lock().unwrap().clone();
        let mut streamed = Vec::new();
        while let Ok(RealtimeEvent::StatusChanged { status, .. }) = events.try_recv() {
            streamed.push(status);
        }
        // Every delivered change differs from the one before it, and the
        // last one matches the stored status.
        assert!(seen.windows(2).all(|w| w[0] != w[1]));
        assert_eq!(seen.last().copied(), mgr.get_channel_status("a"));
        assert_eq!(seen, streamed);
    }

    #[tokio::test]
    async fn events_report_status_and_connect() {
        let (mgr, _) = manager();
        let mut events = mgr.take_events().unwrap();
        assert!(mgr.take_events().is_none());

        mgr.add_channel(mgr.channel("a"));
        mgr.subscribe("a", None).await.unwrap();

        assert_eq!(
            events.recv().await,
            Some(RealtimeEvent::StatusChanged {
                topic: "a".into(),
                status: ChannelStatus::Subscribing,
            })
        );
        assert_eq!(
            events.recv().await,
            Some(RealtimeEvent::StatusChanged {
                topic: "a".into(),
                status: ChannelStatus::Subscribed,
            })
        );
        assert_eq!(
            events.recv().await,
            Some(RealtimeEvent::Connected { topic: "a".into() })
        );
    }
}

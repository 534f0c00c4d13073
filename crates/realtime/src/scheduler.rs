//! Resubscribe scheduling with a fixed backoff table.
//!
//! Failed channels are queued FIFO and retried by a single processor task,
//! one topic at a time across the whole manager. Concurrent reconnects over
//! the one shared socket tend to fail together, so the second failing
//! channel waits until the first succeeds or runs out of attempts.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::RealtimeError;
use crate::manager::RealtimeManager;
use crate::transport::RealtimeTransport;
use crate::types::{ChannelStatus, RealtimeEvent};

/// FIFO of topics awaiting a retry sequence. Holds each topic at most once.
#[derive(Debug, Default)]
pub(crate) struct ResubscribeQueue {
    items: VecDeque<String>,
}

impl ResubscribeQueue {
    pub(crate) fn contains(&self, topic: &str) -> bool {
        self.items.iter().any(|t| t == topic)
    }

    /// Appends `topic` unless already queued. Returns `true` if added.
    pub(crate) fn push(&mut self, topic: &str) -> bool {
        if self.contains(topic) {
            return false;
        }
        self.items.push_back(topic.to_string());
        true
    }

    /// Removes `topic` wherever it sits. Returns `true` if it was queued.
    pub(crate) fn remove(&mut self, topic: &str) -> bool {
        let before = self.items.len();
        self.items.retain(|t| t != topic);
        self.items.len() != before
    }

    pub(crate) fn front(&self) -> Option<&str> {
        self.items.front().map(String::as_str)
    }

    pub(crate) fn topics(&self) -> Vec<String> {
        self.items.iter().cloned().collect()
    }
}

/// Ties one retry sequence to the registration it started on.
pub(crate) struct RetryScope {
    pub(crate) cancel: CancellationToken,
    pub(crate) state_id: u64,
}

/// How a retry sequence ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SequenceEnd {
    Subscribed,
    /// Torn down, closed while offline, or joined elsewhere; whoever
    /// cancelled already cleaned up.
    Cancelled,
    /// Channel vanished without a cancel.
    Gone,
    Exhausted { attempts: u32 },
}

impl<T: RealtimeTransport> RealtimeManager<T> {
    /// Queues `topic` for a backoff retry sequence.
    ///
    /// No-op if the topic is already queued or not registered. Starts the
    /// queue processor if it is idle.
    pub fn resubscribe(&self, topic: &str) {
        let start = {
            let mut reg = self.registry();
            if !reg.channels.contains_key(topic) {
                debug!(topic, "resubscribe for unknown channel ignored");
                return;
            }
            if !reg.queue.push(topic) {
                debug!(topic, "resubscribe already queued");
                return;
            }
            reg.set_status(topic, ChannelStatus::Reconnecting);
            let start = !reg.is_processing_queue;
            reg.is_processing_queue = true;
            start
        };

        self.flush_status_changes();
        if start {
            let manager = self.clone();
            tokio::spawn(async move { manager.process_queue().await });
        }
    }

    /// Drains the queue one topic at a time.
    async fn process_queue(self) {
        loop {
            let topic = {
                let mut reg = self.registry();
                let next = reg.queue.front().map(str::to_string);
                match next {
                    Some(topic) => topic,
                    None => {
                        reg.is_processing_queue = false;
                        debug!("resubscribe queue drained");
                        return;
                    }
                }
            };
            self.run_retry_sequence(&topic).await;
        }
    }

    async fn run_retry_sequence(&self, topic: &str) {
        let cancel = CancellationToken::new();
        let state_id = {
            let mut reg = self.registry();
            match reg.channels.get_mut(topic) {
                Some(state) => {
                    state.retry_timer = Some(cancel.clone());
                    state.id
                }
                None => {
                    reg.queue.remove(topic);
                    return;
                }
            }
        };

        let scope = RetryScope { cancel, state_id };
        let end = self.retry_attempts(topic, &scope).await;
        debug!(topic, ?end, "resubscribe sequence finished");
        if end == SequenceEnd::Cancelled {
            return;
        }
        self.finish_sequence(topic, &scope, end);
    }

    /// Status of `topic` while it is still the scope's registration.
    fn scoped_status(&self, topic: &str, scope: &RetryScope) -> Option<ChannelStatus> {
        self.registry()
            .state_for(topic, scope.state_id)
            .map(|s| s.status())
    }

    async fn retry_attempts(&self, topic: &str, scope: &RetryScope) -> SequenceEnd {
        let cancel = &scope.cancel;
        let mut attempts = 0;
        for attempt in 1..=self.inner.config.max_retries() {
            if cancel.is_cancelled() {
                return SequenceEnd::Cancelled;
            }
            let status = self.scoped_status(topic, scope);
            match status {
                None => return SequenceEnd::Gone,
                Some(ChannelStatus::Subscribed) => return SequenceEnd::Subscribed,
                Some(_) => {}
            }

            let Some(delay) = self.inner.config.delay_for_attempt(attempt) else {
                break;
            };
            info!(
                topic,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "resubscribing"
            );
            self.emit(RealtimeEvent::Reconnecting {
                topic: topic.to_string(),
                attempt,
                delay,
            });

            tokio::select! {
                _ = cancel.cancelled() => return SequenceEnd::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.rebuild_channel(topic, scope) {
                Some(Some(old)) => self.spawn_teardown(topic, old),
                Some(None) => {}
                None if cancel.is_cancelled() => return SequenceEnd::Cancelled,
                None => return SequenceEnd::Gone,
            }
            attempts = attempt;
            self.attempt_subscribe(topic, Some(scope)).await;

            if cancel.is_cancelled() {
                return SequenceEnd::Cancelled;
            }
        }

        if self.scoped_status(topic, scope) == Some(ChannelStatus::Subscribed) {
            SequenceEnd::Subscribed
        } else {
            SequenceEnd::Exhausted { attempts }
        }
    }

    /// Replaces the raw channel with a fresh build and hands back the old
    /// one for teardown. `None` if the sequence was cancelled or its
    /// registration is gone. Late callbacks from the old channel are
    /// filtered by generation.
    fn rebuild_channel(&self, topic: &str, scope: &RetryScope) -> Option<Option<Arc<T::Channel>>> {
        let mut reg = self.registry();
        if scope.cancel.is_cancelled() {
            return None;
        }
        let state = reg.state_for(topic, scope.state_id)?;
        let raw = state.builder.build(self.inner.transport.as_ref());
        Some(state.raw_channel.replace(Arc::new(raw)))
    }

    /// Dequeues `topic` and marks it `error` unless it got subscribed.
    fn finish_sequence(&self, topic: &str, scope: &RetryScope, end: SequenceEnd) {
        let exhausted = {
            let mut reg = self.registry();
            if reg.channels.get(topic).is_some_and(|s| s.id != scope.state_id) {
                // A new registration owns the topic and any queue entry.
                return;
            }
            reg.queue.remove(topic);
            let Some(state) = reg.state_for(topic, scope.state_id) else {
                return;
            };
            state.retry_timer = None;
            if state.status() == ChannelStatus::Subscribed {
                return;
            }

            let attempts = match end {
                SequenceEnd::Exhausted { attempts } => attempts,
                _ => 0,
            };
            let last = match &state.last_error {
                Some(RealtimeError::Connection { message, .. }) => Some(message.clone()),
                _ => None,
            };
            state.last_error = Some(RealtimeError::RetriesExhausted {
                topic: topic.to_string(),
                attempts,
                last,
            });
            reg.set_status(topic, ChannelStatus::Error);
            attempts
        };

        warn!(topic, attempts = exhausted, "resubscribe gave up");
        self.flush_status_changes();
        self.emit(RealtimeEvent::RetriesExhausted {
            topic: topic.to_string(),
            attempts: exhausted,
        });
    }
}

//! Per-topic status listener registry.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::error;
use uuid::Uuid;

use crate::types::{ChannelStatus, StatusListener};

type ListenerMap = HashMap<String, Vec<(Uuid, StatusListener)>>;

fn lock(map: &Mutex<ListenerMap>) -> MutexGuard<'_, ListenerMap> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Listener sets keyed by topic.
///
/// Listeners outlive channel teardown: a caller may watch a topic before
/// it is added and keep watching across remove/add cycles.
#[derive(Default)]
pub(crate) struct StatusListeners {
    map: Arc<Mutex<ListenerMap>>,
}

impl StatusListeners {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&self, topic: &str, listener: StatusListener) -> StatusSubscription {
        let id = Uuid::new_v4();
        lock(&self.map)
            .entry(topic.to_string())
            .or_default()
            .push((id, listener));
        StatusSubscription {
            topic: topic.to_string(),
            id,
            map: Arc::downgrade(&self.map),
        }
    }

    /// Calls every listener for `topic`. A panicking listener is logged and
    /// skipped; the rest still run.
    pub(crate) fn notify(&self, topic: &str, status: ChannelStatus) {
        let listeners: Vec<StatusListener> = match lock(&self.map).get(topic) {
            Some(set) => set.iter().map(|(_, l)| l.clone()).collect(),
            None => return,
        };
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(status))).is_err() {
                error!(topic, %status, "status listener panicked");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn count(&self, topic: &str) -> usize {
        lock(&self.map).get(topic).map_or(0, Vec::len)
    }

    #[cfg(test)]
    pub(crate) fn topic_count(&self) -> usize {
        lock(&self.map).len()
    }
}

/// Registration returned by
/// [`RealtimeManager::subscribe_to_channel_status_change`](crate::RealtimeManager::subscribe_to_channel_status_change).
///
/// The listener stays registered until [`unsubscribe`](Self::unsubscribe)
/// is called; dropping the value does not remove it.
#[derive(Debug)]
pub struct StatusSubscription {
    topic: String,
    id: Uuid,
    map: Weak<Mutex<ListenerMap>>,
}

impl StatusSubscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Removes the listener. The topic's set is dropped once empty.
    pub fn unsubscribe(self) {
        let Some(map) = self.map.upgrade() else {
            return;
        };
        let mut map = lock(&map);
        if let Some(set) = map.get_mut(&self.topic) {
            set.retain(|(id, _)| *id != self.id);
            if set.is_empty() {
                map.remove(&self.topic);
            }
        }
    }
}

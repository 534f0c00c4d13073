//! Caller-facing channel handles.

use std::fmt;

use crate::error::RealtimeError;
use crate::listeners::StatusSubscription;
use crate::manager::RealtimeManager;
use crate::transport::RealtimeTransport;
use crate::types::{ChannelStatus, ConnectedCallback, StatusListener};

/// Reference to a managed channel by topic.
///
/// Holds no channel state itself; every call goes through the manager, so a
/// handle whose channel was torn down simply sees `None` / `NotFound`.
pub struct ChannelHandle<T: RealtimeTransport> {
    topic: String,
    manager: RealtimeManager<T>,
}

impl<T: RealtimeTransport> ChannelHandle<T> {
    pub(crate) fn new(topic: String, manager: RealtimeManager<T>) -> Self {
        Self { topic, manager }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// See [`RealtimeManager::subscribe`].
    pub async fn subscribe(&self, on_connected: Option<ConnectedCallback>) -> Result<(), RealtimeError> {
        self.manager.subscribe(&self.topic, on_connected).await
    }

    /// See [`RealtimeManager::remove_channel`].
    pub async fn unsubscribe(&self, on_connected: Option<&ConnectedCallback>) {
        self.manager.remove_channel(&self.topic, on_connected).await
    }

    pub fn status(&self) -> Option<ChannelStatus> {
        self.manager.get_channel_status(&self.topic)
    }

    pub fn error(&self) -> Option<RealtimeError> {
        self.manager.get_channel_error(&self.topic)
    }

    pub fn on_status_change(&self, listener: StatusListener) -> StatusSubscription {
        self.manager
            .subscribe_to_channel_status_change(&self.topic, listener)
    }
}

impl<T: RealtimeTransport> Clone for ChannelHandle<T> {
    fn clone(&self) -> Self {
        Self {
            topic: self.topic.clone(),
            manager: self.manager.clone(),
        }
    }
}

impl<T: RealtimeTransport> fmt::Debug for ChannelHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("topic", &self.topic)
            .finish()
    }
}

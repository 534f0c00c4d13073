//! Seam to the realtime transport connection.
//!
//! The manager never speaks a wire protocol itself. A transport hands out
//! raw channels for topics, reports one terminal status per subscribe
//! attempt, refreshes its session on request, and tears channels down.

use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::types::{RemoveOutcome, SubscribeStatus};

/// Callback receiving a change payload for a registered binding.
pub type PayloadCallback = Arc<dyn Fn(&serde_json::Value) + Send + Sync>;

/// Callback receiving the terminal statuses of a subscribe attempt.
pub type StatusCallback = Box<dyn Fn(SubscribeStatus) + Send + Sync>;

/// Kind of event a binding listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PostgresChanges,
    Broadcast,
    Presence,
    System,
}

/// Filter attached to a binding. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

impl EventFilter {
    /// Row changes on `schema.table`, e.g. `("UPDATE", "wallet", "quotes")`.
    pub fn table(event: &str, schema: &str, table: &str) -> Self {
        Self {
            event: Some(event.into()),
            schema: Some(schema.into()),
            table: Some(table.into()),
            filter: None,
        }
    }

    /// Named broadcast event.
    pub fn event(event: &str) -> Self {
        Self {
            event: Some(event.into()),
            ..Self::default()
        }
    }

    /// Adds a row filter expression such as `user_id=eq.42`.
    pub fn with_filter(mut self, filter: &str) -> Self {
        self.filter = Some(filter.into());
        self
    }
}

/// A channel object owned by the transport.
pub trait RawChannel: Send + Sync + 'static {
    /// Topic this channel was created for.
    fn topic(&self) -> &str;

    /// Registers a payload listener. Called before `subscribe`.
    fn on(&mut self, kind: EventKind, filter: &EventFilter, callback: PayloadCallback);

    /// Starts joining the topic. The transport reports every terminal
    /// status of the join through `on_status`, possibly synchronously.
    fn subscribe(&self, on_status: StatusCallback);
}

/// The shared realtime session carrying every channel.
pub trait RealtimeTransport: Send + Sync + 'static {
    type Channel: RawChannel;

    /// Creates a fresh raw channel for `topic`.
    fn channel(&self, topic: &str) -> Self::Channel;

    /// Tears a channel down. Always settles with an outcome code.
    fn remove_channel(&self, channel: &Self::Channel)
    -> impl Future<Output = RemoveOutcome> + Send;

    /// Refreshes the session token if it is stale.
    fn set_auth(&self) -> impl Future<Output = ()> + Send;
}

//! Public types for the realtime channel manager.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a managed channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStatus {
    /// Registered but never subscribed.
    Idle,
    /// Subscribe attempt in flight.
    Subscribing,
    /// Joined and receiving changes.
    Subscribed,
    /// Closed by the transport, or closed locally while offline/inactive.
    Closed,
    /// Retry budget exhausted. Terminal until an external resubscribe.
    Error,
    /// Queued for, or inside, a backoff retry sequence.
    Reconnecting,
}

impl ChannelStatus {
    /// Returns `true` if the channel is connected or on its way there.
    ///
    /// Such channels are skipped by `subscribe` and by the resubscribe
    /// sweep that runs when the app comes back online and active.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            ChannelStatus::Subscribed | ChannelStatus::Subscribing | ChannelStatus::Reconnecting
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChannelStatus::Idle => "idle",
            ChannelStatus::Subscribing => "subscribing",
            ChannelStatus::Subscribed => "subscribed",
            ChannelStatus::Closed => "closed",
            ChannelStatus::Error => "error",
            ChannelStatus::Reconnecting => "reconnecting",
        }
    }
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome reported by the transport for one subscribe attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeStatus {
    Subscribed,
    Closed,
    ChannelError(Option<String>),
    TimedOut,
}

impl SubscribeStatus {
    /// Human-readable error detail for `ChannelError` / `TimedOut`.
    pub fn error_message(&self) -> Option<String> {
        match self {
            SubscribeStatus::ChannelError(Some(msg)) => Some(msg.clone()),
            SubscribeStatus::ChannelError(None) => Some("channel error".into()),
            SubscribeStatus::TimedOut => Some("subscribe timed out".into()),
            SubscribeStatus::Subscribed | SubscribeStatus::Closed => None,
        }
    }
}

/// Outcome code of a transport channel removal. Removal never fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Ok,
    TimedOut,
    Error,
}

/// Invoked each time a channel becomes fully connected.
///
/// Connected callbacks form a set keyed by pointer identity, so keep the
/// `Arc` around to unregister it later via `remove_channel`.
pub type ConnectedCallback = Arc<dyn Fn() + Send + Sync>;

/// Invoked when a channel's status changes.
pub type StatusListener = Arc<dyn Fn(ChannelStatus) + Send + Sync>;

/// Events emitted by the realtime manager.
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEvent {
    /// A channel moved to a new status.
    StatusChanged {
        topic: String,
        status: ChannelStatus,
    },
    /// A channel reported `SUBSCRIBED` (initial join or reconnect).
    Connected { topic: String },
    /// A retry attempt is about to wait `delay` and then rebuild.
    Reconnecting {
        topic: String,
        attempt: u32,
        delay: Duration,
    },
    /// The backoff table ran out without a successful subscribe.
    RetriesExhausted { topic: String, attempts: u32 },
    /// Manager-wide activity flags changed.
    ActivityChanged { online: bool, active: bool },
}

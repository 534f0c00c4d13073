//! Realtime channel manager for the wallet app.
//!
//! Multiplexes ref-counted channel subscriptions over one shared realtime
//! transport, retries failed channels one at a time with a backoff table,
//! and pauses recovery while the app is offline or backgrounded.

pub mod activity;
pub mod builder;
pub mod config;
pub mod error;
pub mod handle;
mod listeners;
pub mod manager;
pub mod memory;
mod scheduler;
pub mod transport;
pub mod types;

pub use activity::{ActivityMonitor, ActivitySignal};
pub use builder::ChannelBuilder;
pub use config::RealtimeConfig;
pub use error::{ConfigError, RealtimeError};
pub use handle::ChannelHandle;
pub use listeners::StatusSubscription;
pub use manager::RealtimeManager;
pub use memory::{MemoryChannel, MemoryTransport};
pub use transport::{EventFilter, EventKind, PayloadCallback, RawChannel, RealtimeTransport, StatusCallback};
pub use types::{
    ChannelStatus, ConnectedCallback, RealtimeEvent, RemoveOutcome, StatusListener,
    SubscribeStatus,
};

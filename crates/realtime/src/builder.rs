//! Declarative channel descriptors.

use std::fmt;

use crate::transport::{EventFilter, EventKind, PayloadCallback, RawChannel, RealtimeTransport};

#[derive(Clone)]
struct Binding {
    kind: EventKind,
    filter: EventFilter,
    callback: PayloadCallback,
}

/// Describes a topic and its payload bindings.
///
/// A builder can be built any number of times; every build yields an
/// independent raw channel with all bindings applied. The manager takes
/// ownership on `add_channel`, so later registrations on a clone never
/// reach channels it builds.
#[derive(Clone)]
pub struct ChannelBuilder {
    topic: String,
    bindings: Vec<Binding>,
}

impl ChannelBuilder {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            bindings: Vec::new(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Number of registered bindings.
    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    /// Registers a payload listener.
    pub fn on(mut self, kind: EventKind, filter: EventFilter, callback: PayloadCallback) -> Self {
        self.bindings.push(Binding {
            kind,
            filter,
            callback,
        });
        self
    }

    /// Materialises a raw channel on `transport` with every binding applied.
    pub fn build<T: RealtimeTransport>(&self, transport: &T) -> T::Channel {
        let mut channel = transport.channel(&self.topic);
        for binding in &self.bindings {
            channel.on(binding.kind, &binding.filter, binding.callback.clone());
        }
        channel
    }
}

impl fmt::Debug for ChannelBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelBuilder")
            .field("topic", &self.topic)
            .field("bindings", &self.bindings.len())
            .finish()
    }
}

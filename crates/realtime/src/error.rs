//! Error types for the realtime manager.

/// Errors produced by the realtime manager.
///
/// Only [`RealtimeError::NotFound`] is ever returned from a call. The
/// connection variants are recorded per channel and read back through
/// `get_channel_error`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RealtimeError {
    #[error("channel not found: {topic}")]
    NotFound { topic: String },

    #[error("channel {topic} connection error: {message}")]
    Connection { topic: String, message: String },

    #[error("channel {topic} gave up after {attempts} attempts")]
    RetriesExhausted {
        topic: String,
        attempts: u32,
        last: Option<String>,
    },
}

impl RealtimeError {
    /// Returns `true` for errors the scheduler retries on its own.
    pub fn is_transient(&self) -> bool {
        matches!(self, RealtimeError::Connection { .. })
    }
}

/// Errors from loading or validating a [`RealtimeConfig`](crate::RealtimeConfig).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("backoff table is empty")]
    EmptyBackoff,

    #[error("backoff table must be ascending (index {index})")]
    BackoffNotAscending { index: usize },
}

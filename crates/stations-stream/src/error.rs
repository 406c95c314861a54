use thiserror::Error;

/// An input station does not have exactly one line flag set.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MalformedRecordError {
    #[error("Station {stop_id} has none of blue/green/red set")]
    NoLine { stop_id: i64 },

    #[error("Station {stop_id} has {count} line flags set")]
    MultipleLines { stop_id: i64, count: usize },
}

/// The changelog could not record or return table updates.
#[derive(Debug, Error)]
pub enum DurabilityError {
    #[error("Changelog append for key {key} failed: {reason}")]
    Append { key: i64, reason: String },

    #[error("Changelog replay failed: {0}")]
    Replay(String),

    #[error("Changelog entry at offset {offset} is unreadable: {reason}")]
    Decode { offset: i64, reason: String },

    #[error("Changelog client error: {0}")]
    Client(String),

    #[error("Failed to encode changelog entry: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Malformed(#[from] MalformedRecordError),

    #[error(transparent)]
    Durability(#[from] DurabilityError),

    #[error("Source consumer error: {0}")]
    Source(String),
}

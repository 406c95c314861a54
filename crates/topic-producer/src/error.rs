use std::time::Duration;

use thiserror::Error;

/// Topic metadata query or creation failed. Never fatal for the process:
/// the caller logs it and a later call retries.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProvisionError {
    #[error("Invalid topic spec for {topic}: {reason}")]
    InvalidSpec { topic: String, reason: String },

    #[error("Topic metadata query failed: {0}")]
    Metadata(String),

    #[error("Broker did not answer within {0:?}")]
    Timeout(Duration),

    #[error("Broker rejected creation of topic {topic}: {reason}")]
    Rejected { topic: String, reason: String },

    /// Another process won the creation race. The provisioner treats this as success.
    #[error("Topic {0} already exists")]
    AlreadyExists(String),

    #[error("Admin client error: {0}")]
    Client(String),
}

#[derive(Debug, Error)]
pub enum SchemaRegistryError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Schema conflict for {subject} (code {code}): {message}")]
    Conflict {
        subject: String,
        code: i32,
        message: String,
    },

    #[error("Schema Registry returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Value does not match schema {schema}")]
    SchemaMismatch { schema: String },

    #[error("Avro error: {0}")]
    Avro(#[from] apache_avro::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Payload is not in Confluent wire format: {0}")]
    Framing(&'static str),
}

/// Failure of a single `publish` call or of the final `close`.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Record does not match the schema bound to {topic}: {source}")]
    SchemaMismatch {
        topic: String,
        #[source]
        source: CodecError,
    },

    #[error("Failed to encode record for {topic}: {source}")]
    Encode {
        topic: String,
        #[source]
        source: CodecError,
    },

    #[error("Broker client refused record for {topic}: {reason}")]
    Enqueue { topic: String, reason: String },

    #[error("{failed} record(s) for {topic} were not delivered: {reason}")]
    Delivery {
        topic: String,
        failed: usize,
        reason: String,
    },

    #[error("Flush of {topic} failed: {reason}")]
    Flush { topic: String, reason: String },
}

impl PublishError {
    pub(crate) fn from_codec(topic: &str, source: CodecError) -> Self {
        match source {
            CodecError::SchemaMismatch { .. } => Self::SchemaMismatch {
                topic: topic.to_string(),
                source,
            },
            source => Self::Encode {
                topic: topic.to_string(),
                source,
            },
        }
    }
}

/// Producer construction failed; the producer is unusable for that topic.
#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("Topic provisioning failed: {0}")]
    Provision(#[from] ProvisionError),

    #[error("Schema registration failed for {subject}: {source}")]
    Schema {
        subject: String,
        #[source]
        source: SchemaRegistryError,
    },
}

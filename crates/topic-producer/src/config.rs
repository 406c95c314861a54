use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerConfig {
    /// Kafka bootstrap servers, comma separated.
    #[serde(default = "default_brokers")]
    pub brokers: String,

    /// Base URL of the Confluent-compatible Schema Registry.
    #[serde(default = "default_schema_registry_url")]
    pub schema_registry_url: String,

    /// Ceiling for topic metadata queries and topic creation.
    #[serde(default = "default_metadata_timeout_ms")]
    pub metadata_timeout_ms: u64,

    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u32,

    /// Upper bound for the final transport flush on `close`.
    #[serde(default = "default_flush_timeout_ms")]
    pub flush_timeout_ms: u64,

    #[serde(default = "default_queue_buffering_max_messages")]
    pub queue_buffering_max_messages: u32,

    #[serde(default = "default_partitions")]
    pub default_partitions: i32,

    #[serde(default = "default_replicas")]
    pub default_replicas: i32,
}

fn default_brokers() -> String {
    "PLAINTEXT://localhost:9092,PLAINTEXT://localhost:9093,PLAINTEXT://localhost:9094".to_string()
}

fn default_schema_registry_url() -> String { "http://localhost:8081".to_string() }

fn default_metadata_timeout_ms() -> u64 { 5000 }

fn default_message_timeout_ms() -> u32 { 5000 }

fn default_flush_timeout_ms() -> u64 { 30_000 }

fn default_queue_buffering_max_messages() -> u32 { 100000 }

fn default_partitions() -> i32 { 1 }

fn default_replicas() -> i32 { 1 }

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            brokers: default_brokers(),
            schema_registry_url: default_schema_registry_url(),
            metadata_timeout_ms: default_metadata_timeout_ms(),
            message_timeout_ms: default_message_timeout_ms(),
            flush_timeout_ms: default_flush_timeout_ms(),
            queue_buffering_max_messages: default_queue_buffering_max_messages(),
            default_partitions: default_partitions(),
            default_replicas: default_replicas(),
        }
    }
}

impl ProducerConfig {
    pub fn new(brokers: impl Into<String>) -> Self {
        Self {
            brokers: brokers.into(),
            ..Default::default()
        }
    }

    pub fn metadata_timeout(&self) -> Duration { Duration::from_millis(self.metadata_timeout_ms) }

    pub fn message_timeout(&self) -> Duration { Duration::from_millis(u64::from(self.message_timeout_ms)) }

    pub fn flush_timeout(&self) -> Duration { Duration::from_millis(self.flush_timeout_ms) }
}

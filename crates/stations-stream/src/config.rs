use std::time::Duration;

use cta_topic_producer::{ProducerConfig, TopicSpec};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_source_topic")]
    pub source_topic: String,

    /// Partition count of the source topic. One worker is started per partition.
    #[serde(default = "default_source_partitions")]
    pub source_partitions: i32,

    #[serde(default = "default_table_name")]
    pub table_name: String,

    /// Compacted, single-partition topic backing the materialized table.
    #[serde(default = "default_changelog_topic")]
    pub changelog_topic: String,

    #[serde(default = "default_group_id")]
    pub group_id: String,

    /// Per-worker channel capacity.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Ceiling for each metadata, watermark and poll call during changelog replay.
    #[serde(default = "default_replay_timeout_ms")]
    pub replay_timeout_ms: u64,
}

fn default_source_topic() -> String { "raw.cta.stations".to_string() }

fn default_source_partitions() -> i32 { 1 }

fn default_table_name() -> String { "converted_stations".to_string() }

fn default_changelog_topic() -> String { "cta.stations.converted".to_string() }

fn default_group_id() -> String { "stations-stream".to_string() }

fn default_buffer_size() -> usize { 100 }

fn default_replay_timeout_ms() -> u64 { 5000 }

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            source_topic: default_source_topic(),
            source_partitions: default_source_partitions(),
            table_name: default_table_name(),
            changelog_topic: default_changelog_topic(),
            group_id: default_group_id(),
            buffer_size: default_buffer_size(),
            replay_timeout_ms: default_replay_timeout_ms(),
        }
    }
}

impl StreamConfig {
    pub fn replay_timeout(&self) -> Duration { Duration::from_millis(self.replay_timeout_ms) }

    pub fn workers(&self) -> usize { self.source_partitions.max(1) as usize }

    pub fn source_spec(&self, producer: &ProducerConfig) -> TopicSpec {
        TopicSpec::with_defaults(&self.source_topic, producer).partitions(self.source_partitions)
    }

    pub fn changelog_spec(&self, producer: &ProducerConfig) -> TopicSpec {
        TopicSpec::with_defaults(&self.changelog_topic, producer)
            .partitions(1)
            .compacted()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn changelog_topic_is_single_partition_and_compacted() {
        let producer = ProducerConfig {
            default_partitions: 6,
            default_replicas: 3,
            ..Default::default()
        };
        let spec = StreamConfig::default().changelog_spec(&producer);

        assert_eq!(spec.name, "cta.stations.converted");
        assert_eq!(spec.partitions, 1);
        assert_eq!(spec.replicas, 3);
        assert!(spec.config.contains(&("cleanup.policy".to_string(), "compact".to_string())));
    }

    #[test]
    fn workers_follow_source_partitions() {
        let config: StreamConfig = serde_json::from_str(r#"{"source_partitions": 4}"#).unwrap();
        assert_eq!(config.workers(), 4);
        assert_eq!(config.source_topic, "raw.cta.stations");
    }
}

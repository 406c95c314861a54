//! Durable log of materialized-table updates.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use cta_topic_producer::{create_producer, FutureProducer, ProducerConfig};
use parking_lot::Mutex;
use rdkafka::{
    consumer::{BaseConsumer, Consumer},
    producer::FutureRecord,
    ClientConfig, Message, Offset, TopicPartitionList,
};
use serde::{Deserialize, Serialize};

use crate::{config::StreamConfig, error::DurabilityError, model::TransformedStation};

/// One table write, in the order it was applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangelogRecord {
    pub key: i64,
    pub value: TransformedStation,
}

/// Sole writer of a table's changelog.
pub trait ChangelogWriter: Send + Sync {
    /// Returns once the entry is durable.
    fn append(&self, record: &ChangelogRecord) -> impl Future<Output = Result<(), DurabilityError>> + Send;

    /// Every entry, in append order.
    fn replay(&self) -> impl Future<Output = Result<Vec<ChangelogRecord>, DurabilityError>> + Send;
}

/// In-process changelog. Clones share the same log, so a table rebuilt over
/// a clone sees everything written through the original.
#[derive(Debug, Clone, Default)]
pub struct MemoryChangelog {
    entries: Arc<Mutex<Vec<ChangelogRecord>>>,
    failing: Arc<AtomicBool>,
}

impl MemoryChangelog {
    /// Make every following append fail until reset.
    pub fn fail_appends(&self, failing: bool) { self.failing.store(failing, Ordering::SeqCst); }

    pub fn entries(&self) -> Vec<ChangelogRecord> { self.entries.lock().clone() }
}

impl ChangelogWriter for MemoryChangelog {
    async fn append(&self, record: &ChangelogRecord) -> Result<(), DurabilityError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DurabilityError::Append {
                key: record.key,
                reason: "changelog unavailable".to_string(),
            });
        }
        self.entries.lock().push(record.clone());
        Ok(())
    }

    async fn replay(&self) -> Result<Vec<ChangelogRecord>, DurabilityError> { Ok(self.entries()) }
}

/// Changelog kept in a compacted Kafka topic.
/// Record key is the decimal table key, payload the JSON-encoded value.
#[derive(Clone)]
pub struct KafkaChangelog {
    producer: FutureProducer,
    brokers: String,
    topic: String,
    group_id: String,
    send_timeout: Duration,
    timeout: Duration,
}

impl std::fmt::Debug for KafkaChangelog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaChangelog")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

impl KafkaChangelog {
    pub fn new(producer_config: &ProducerConfig, config: &StreamConfig) -> Result<Self, DurabilityError> {
        let producer = create_producer(producer_config).map_err(|e| DurabilityError::Client(e.to_string()))?;

        Ok(Self {
            producer,
            brokers: producer_config.brokers.clone(),
            topic: config.changelog_topic.clone(),
            group_id: format!("{}-changelog-reader", config.group_id),
            send_timeout: producer_config.message_timeout(),
            timeout: config.replay_timeout(),
        })
    }

    pub fn topic(&self) -> &str { &self.topic }

    /// How long an append may wait for room in the producer queue.
    pub fn send_timeout(&self) -> Duration { self.send_timeout }
}

impl ChangelogWriter for KafkaChangelog {
    async fn append(&self, record: &ChangelogRecord) -> Result<(), DurabilityError> {
        let payload = serde_json::to_vec(&record.value)?;
        let key = record.key.to_string();

        self.producer
            .send(
                FutureRecord::to(&self.topic).payload(&payload).key(&key),
                self.send_timeout,
            )
            .await
            .map_err(|(e, _)| DurabilityError::Append {
                key: record.key,
                reason: e.to_string(),
            })?;

        Ok(())
    }

    async fn replay(&self) -> Result<Vec<ChangelogRecord>, DurabilityError> {
        let brokers = self.brokers.clone();
        let topic = self.topic.clone();
        let group_id = self.group_id.clone();
        let timeout = self.timeout;

        tokio::task::spawn_blocking(move || read_changelog(&brokers, &group_id, &topic, timeout))
            .await
            .map_err(|e| DurabilityError::Replay(e.to_string()))?
    }
}

/// Read every partition of `topic` from the beginning up to its high watermark.
fn read_changelog(
    brokers: &str,
    group_id: &str,
    topic: &str,
    timeout: Duration,
) -> Result<Vec<ChangelogRecord>, DurabilityError> {
    let replay_err = |e: rdkafka::error::KafkaError| DurabilityError::Replay(e.to_string());

    let consumer: BaseConsumer = ClientConfig::new()
        .set("bootstrap.servers", brokers)
        .set("group.id", group_id)
        .set("enable.auto.commit", "false")
        .create()
        .map_err(replay_err)?;

    let metadata = consumer
        .fetch_metadata(Some(topic), timeout)
        .map_err(replay_err)?;

    let Some(topic_metadata) = metadata.topics().iter().find(|t| t.name() == topic) else {
        tracing::info!(topic, "Changelog topic not found - starting with an empty table");
        return Ok(Vec::new());
    };

    let mut records = Vec::new();

    for partition in topic_metadata.partitions() {
        let partition_id = partition.id();

        let (low, high) = consumer
            .fetch_watermarks(topic, partition_id, timeout)
            .map_err(replay_err)?;

        if high <= low {
            continue; // Empty partition
        }

        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(topic, partition_id, Offset::Beginning)
            .map_err(replay_err)?;
        consumer.assign(&tpl).map_err(replay_err)?;

        // Compaction leaves gaps, so stop on offset rather than on a count.
        let mut next = low;
        while next < high {
            match consumer.poll(timeout) {
                Some(Ok(msg)) => {
                    next = msg.offset() + 1;
                    if let Some(record) = decode_entry(&msg)? {
                        records.push(record);
                    }
                },
                Some(Err(e)) => return Err(replay_err(e)),
                None => {
                    return Err(DurabilityError::Replay(format!(
                        "timed out reading {topic}[{partition_id}] at offset {next}, high watermark {high}"
                    )));
                },
            }
        }

        tracing::debug!(topic, partition = partition_id, low, high, "Changelog partition replayed");
    }

    Ok(records)
}

/// Tombstones (no payload) carry no state and are skipped.
fn decode_entry<M: Message>(msg: &M) -> Result<Option<ChangelogRecord>, DurabilityError> {
    let Some(payload) = msg.payload() else {
        return Ok(None);
    };

    let decode_err = |reason: String| DurabilityError::Decode {
        offset: msg.offset(),
        reason,
    };

    let key = msg
        .key()
        .and_then(|k| std::str::from_utf8(k).ok())
        .and_then(|k| k.parse::<i64>().ok())
        .ok_or_else(|| decode_err("missing or non-numeric key".to_string()))?;
    let value = serde_json::from_slice(payload).map_err(|e| decode_err(e.to_string()))?;

    Ok(Some(ChangelogRecord { key, value }))
}

#[cfg(test)]
mod tests {
    use cta_topic_producer::ProducerConfig;
    use rdkafka::message::{OwnedMessage, Timestamp};

    use super::*;
    use crate::model::Line;

    fn message(key: Option<&str>, payload: Option<&str>, offset: i64) -> OwnedMessage {
        OwnedMessage::new(
            payload.map(|p| p.as_bytes().to_vec()),
            key.map(|k| k.as_bytes().to_vec()),
            "cta.stations.converted".to_string(),
            Timestamp::NotAvailable,
            0,
            offset,
            None,
        )
    }

    fn record(key: i64, line: Line) -> ChangelogRecord {
        ChangelogRecord {
            key,
            value: TransformedStation {
                station_id: 1,
                station_name: "Clark/Lake".to_string(),
                order: 0,
                line,
            },
        }
    }

    #[tokio::test]
    async fn memory_changelog_replays_in_append_order() {
        let changelog = MemoryChangelog::default();
        changelog.append(&record(1, Line::Red)).await.unwrap();
        changelog.append(&record(2, Line::Blue)).await.unwrap();
        changelog.append(&record(1, Line::Green)).await.unwrap();

        let keys: Vec<_> = changelog
            .replay()
            .await
            .unwrap()
            .iter()
            .map(|r| (r.key, r.value.line))
            .collect();
        assert_eq!(keys, vec![(1, Line::Red), (2, Line::Blue), (1, Line::Green)]);
    }

    #[tokio::test]
    async fn failing_append_records_nothing() {
        let changelog = MemoryChangelog::default();
        changelog.fail_appends(true);

        let err = changelog.append(&record(7, Line::Red)).await.unwrap_err();
        assert!(matches!(err, DurabilityError::Append { key: 7, .. }));
        assert!(changelog.entries().is_empty());
    }

    #[test]
    fn changelog_value_is_plain_json() {
        let json = serde_json::to_value(&record(40010, Line::Red).value).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "station_id": 1,
                "station_name": "Clark/Lake",
                "order": 0,
                "line": "red"
            })
        );
    }

    #[test]
    fn tombstone_carries_no_entry() {
        assert_eq!(decode_entry(&message(Some("40010"), None, 3)).unwrap(), None);
    }

    #[test]
    fn non_numeric_or_missing_key_is_a_decode_error() {
        let payload = r#"{"station_id":1,"station_name":"Clark/Lake","order":0,"line":"red"}"#;

        let err = decode_entry(&message(Some("abc"), Some(payload), 7)).unwrap_err();
        assert!(matches!(err, DurabilityError::Decode { offset: 7, .. }));

        let err = decode_entry(&message(None, Some(payload), 8)).unwrap_err();
        assert!(matches!(err, DurabilityError::Decode { offset: 8, .. }));
    }

    #[test]
    fn unreadable_value_is_a_decode_error() {
        let err = decode_entry(&message(Some("40010"), Some(r#"{"line":"purple"}"#), 2)).unwrap_err();
        assert!(matches!(err, DurabilityError::Decode { offset: 2, .. }));
    }

    #[test]
    fn appended_payload_decodes_back_to_the_record() {
        let original = record(40010, Line::Red);
        let payload = serde_json::to_string(&original.value).unwrap();

        let decoded = decode_entry(&message(Some("40010"), Some(&payload), 0)).unwrap();
        assert_eq!(decoded, Some(original));
    }

    #[test]
    fn append_timeout_follows_producer_message_timeout() {
        let producer = ProducerConfig {
            message_timeout_ms: 750,
            ..ProducerConfig::new("localhost:1")
        };
        let changelog = KafkaChangelog::new(&producer, &StreamConfig::default()).unwrap();

        assert_eq!(changelog.send_timeout(), Duration::from_millis(750));
        assert_eq!(changelog.topic(), "cta.stations.converted");
    }
}

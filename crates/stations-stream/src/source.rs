//! Kafka consumer for the station source topic.
//!
//! Messages are decoded and routed by partition to a fixed set of worker
//! channels, so records from one partition always reach the same
//! transformer in arrival order. Offsets are stored only when a worker
//! acknowledges a record, see [`KafkaOffsets`].

use std::{sync::Arc, time::Duration};

use apache_avro::Schema;
use cta_topic_producer::{decode_avro, parse_schema, CodecError, ProducerConfig};
use rdkafka::{
    consumer::{Consumer, StreamConsumer},
    message::BorrowedMessage,
    ClientConfig, Message,
};
use tokio::sync::mpsc;

use crate::{
    config::StreamConfig,
    error::StreamError,
    model::{Station, STATION_VALUE_SCHEMA},
    offsets::KafkaOffsets,
};

const RECV_BACKOFF_BASE: Duration = Duration::from_millis(100);
const RECV_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// A decoded station and its position on the source topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRecord {
    pub partition: i32,
    pub offset: i64,
    pub station: Station,
}

pub struct StationSource {
    consumer: Arc<StreamConsumer>,
    value_schema: Schema,
    workers: Vec<mpsc::Sender<SourceRecord>>,
    topic: String,
}

impl std::fmt::Debug for StationSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StationSource")
            .field("topic", &self.topic)
            .field("workers", &self.workers.len())
            .finish()
    }
}

/// Worker index for a source partition.
pub fn route(partition: i32, workers: usize) -> usize { partition.rem_euclid(workers.max(1) as i32) as usize }

pub fn decode_station(schema: &Schema, payload: &[u8]) -> Result<Station, CodecError> {
    decode_avro(schema, payload).map(|(_, station)| station)
}

/// Delay before the next `recv` after `failures` consecutive errors.
fn recv_backoff(failures: u32) -> Duration {
    let doublings = failures.saturating_sub(1).min(16);
    RECV_BACKOFF_BASE
        .saturating_mul(1 << doublings)
        .min(RECV_BACKOFF_MAX)
}

impl StationSource {
    /// Subscribe to the source topic and create one channel per worker.
    pub fn create(
        producer: &ProducerConfig,
        config: &StreamConfig,
    ) -> Result<(Self, Vec<mpsc::Receiver<SourceRecord>>), StreamError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &producer.brokers)
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(|e| StreamError::Source(format!("Failed to create consumer: {e}")))?;

        consumer
            .subscribe(&[config.source_topic.as_str()])
            .map_err(|e| StreamError::Source(format!("Failed to subscribe to {}: {e}", config.source_topic)))?;

        let value_schema = parse_schema(STATION_VALUE_SCHEMA).map_err(|e| StreamError::Source(e.to_string()))?;

        let (workers, receivers) = (0..config.workers())
            .map(|_| mpsc::channel(config.buffer_size))
            .unzip();

        Ok((
            Self {
                consumer: Arc::new(consumer),
                value_schema,
                workers,
                topic: config.source_topic.clone(),
            },
            receivers,
        ))
    }

    /// Acknowledgement handle for the transformers.
    pub fn offsets(&self) -> KafkaOffsets { KafkaOffsets::new(Arc::clone(&self.consumer), self.topic.clone()) }

    /// Receive until every worker has gone away.
    pub async fn run(self) -> Result<(), StreamError> {
        tracing::info!(topic = %self.topic, workers = self.workers.len(), "Station source started");

        let mut failures = 0_u32;

        loop {
            // The borrowed message must not be held across an await.
            let received = match self.consumer.recv().await {
                Ok(msg) => Ok(self.decode(&msg)),
                Err(e) => Err(e),
            };

            let record = match received {
                Ok(Some(record)) => {
                    failures = 0;
                    record
                },
                Ok(None) => {
                    failures = 0;
                    continue;
                },
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = recv_backoff(failures);
                    tracing::error!(?e, topic = %self.topic, failures, retry_in = ?delay, "Error receiving message from Kafka");
                    tokio::time::sleep(delay).await;
                    continue;
                },
            };

            let worker = route(record.partition, self.workers.len());
            if let Err(e) = self.workers[worker].send(record).await {
                tracing::warn!(
                    worker,
                    stop_id = e.0.station.stop_id,
                    offset = e.0.offset,
                    "Transformer stopped, shutting down station source"
                );
                return Ok(());
            }
        }
    }

    fn decode(&self, msg: &BorrowedMessage<'_>) -> Option<SourceRecord> {
        let Some(payload) = msg.payload() else {
            tracing::debug!(partition = msg.partition(), offset = msg.offset(), "Skipping empty message");
            return None;
        };

        match decode_station(&self.value_schema, payload) {
            Ok(station) => {
                tracing::trace!(
                    partition = msg.partition(),
                    offset = msg.offset(),
                    stop_id = station.stop_id,
                    "Received station"
                );
                Some(SourceRecord {
                    partition: msg.partition(),
                    offset: msg.offset(),
                    station,
                })
            },
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    partition = msg.partition(),
                    offset = msg.offset(),
                    "Skipping undecodable station record"
                );
                None
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use cta_topic_producer::RegisteredSchema;

    use super::*;

    #[test]
    fn partitions_map_to_stable_workers() {
        assert_eq!(route(0, 1), 0);
        assert_eq!(route(5, 1), 0);
        assert_eq!(route(5, 3), 2);
        assert_eq!(route(3, 3), 0);
        assert_eq!(route(2, 0), 0);
    }

    #[test]
    fn receive_backoff_doubles_up_to_a_ceiling() {
        assert_eq!(recv_backoff(1), Duration::from_millis(100));
        assert_eq!(recv_backoff(2), Duration::from_millis(200));
        assert_eq!(recv_backoff(4), Duration::from_millis(800));
        assert_eq!(recv_backoff(10), RECV_BACKOFF_MAX);
        assert_eq!(recv_backoff(u32::MAX), RECV_BACKOFF_MAX);
    }

    #[test]
    fn decodes_avro_framed_station() {
        let schema = parse_schema(STATION_VALUE_SCHEMA).unwrap();
        let station = Station {
            stop_id: 30074,
            direction_id: "S".to_string(),
            stop_name: "Clark/Lake (Forest Pk-bound)".to_string(),
            station_name: "Clark/Lake".to_string(),
            station_descriptive_name: "Clark/Lake (Blue, Brown, Green, Orange, Purple & Pink lines)".to_string(),
            station_id: 40380,
            order: 21,
            red: false,
            blue: true,
            green: false,
        };
        let payload = RegisteredSchema::new("raw.cta.stations-value", 7, schema.clone())
            .encode(&station)
            .unwrap();

        assert_eq!(decode_station(&schema, &payload).unwrap(), station);
        assert!(decode_station(&schema, br#"{"stop_id": 1}"#).is_err());
    }
}

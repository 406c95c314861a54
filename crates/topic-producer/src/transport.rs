use std::{future::Future, time::Duration};

use futures::future::BoxFuture;
use rdkafka::{
    error::KafkaError,
    producer::{FutureProducer, FutureRecord, Producer},
    ClientConfig,
};

use crate::{config::ProducerConfig, error::PublishError};

/// Resolves once the broker acknowledged (or definitively failed) one record.
pub type PendingDelivery = BoxFuture<'static, Result<(), String>>;

/// The buffered, asynchronous send path underneath a producer.
pub trait Transport: Send + Sync {
    /// Hand a record to the client buffer. Fails only if the client refuses it outright.
    fn enqueue(&self, topic: &str, key: &[u8], payload: &[u8]) -> Result<PendingDelivery, PublishError>;

    /// Wait until the client buffer is empty or `timeout` elapses.
    fn flush(&self, timeout: Duration) -> impl Future<Output = Result<(), String>> + Send;
}

pub fn create_producer(config: &ProducerConfig) -> Result<FutureProducer, KafkaError> {
    ClientConfig::new()
        .set("bootstrap.servers", &config.brokers)
        .set("message.timeout.ms", config.message_timeout_ms.to_string())
        .set(
            "queue.buffering.max.messages",
            config.queue_buffering_max_messages.to_string(),
        )
        .set("acks", "all")
        .create()
}

/// [`Transport`] over an rdkafka `FutureProducer`.
#[derive(Clone)]
pub struct KafkaTransport {
    producer: FutureProducer,
}

impl std::fmt::Debug for KafkaTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaTransport").finish_non_exhaustive()
    }
}

impl KafkaTransport {
    pub fn new(config: &ProducerConfig) -> Result<Self, KafkaError> {
        Ok(Self {
            producer: create_producer(config)?,
        })
    }
}

impl Transport for KafkaTransport {
    fn enqueue(&self, topic: &str, key: &[u8], payload: &[u8]) -> Result<PendingDelivery, PublishError> {
        match self
            .producer
            .send_result(FutureRecord::to(topic).key(key).payload(payload))
        {
            Ok(delivery) => Ok(Box::pin(async move {
                match delivery.await {
                    Ok(Ok(_)) => Ok(()),
                    Ok(Err((e, _))) => Err(e.to_string()),
                    Err(_) => Err("delivery canceled, producer was dropped".to_string()),
                }
            })),
            Err((e, _)) => Err(PublishError::Enqueue {
                topic: topic.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn flush(&self, timeout: Duration) -> Result<(), String> {
        // Producer::flush blocks the calling thread for up to `timeout`.
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(timeout))
            .await
            .map_err(|e| e.to_string())?
            .map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn flush_with_nothing_queued_returns_without_broker() {
        let transport = KafkaTransport::new(&ProducerConfig::new("localhost:1")).unwrap();

        transport.flush(Duration::from_millis(100)).await.unwrap();
    }
}

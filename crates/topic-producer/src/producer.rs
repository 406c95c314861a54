//! Schema-governed producer bound to a single provisioned topic.

use std::time::{SystemTime, UNIX_EPOCH};

use apache_avro::Schema;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinSet;

use crate::{
    admin::BrokerAdmin,
    codec::{encode_json, parse_schema, RegisteredSchema},
    config::ProducerConfig,
    error::{CodecError, ProducerError, PublishError},
    schema_registry::SchemaRegistry,
    topics::{ProvisionedTopic, TopicProvisioner, TopicSpec},
    transport::Transport,
};

/// Key schema and optional value schema, fixed for the producer's lifetime.
#[derive(Debug, Clone)]
pub struct SchemaPair {
    pub key: Schema,
    pub value: Option<Schema>,
}

impl SchemaPair {
    pub fn new(key: Schema, value: Option<Schema>) -> Self { Self { key, value } }

    pub fn parse(key: &str, value: Option<&str>) -> Result<Self, CodecError> {
        Ok(Self {
            key: parse_schema(key)?,
            value: value.map(parse_schema).transpose()?,
        })
    }
}

/// Wall-clock milliseconds since the Unix epoch.
/// Used as a record key, never for ordering.
pub fn current_time_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[derive(Default)]
struct Deliveries {
    in_flight: JoinSet<Result<(), String>>,
    delivered: usize,
    failures: Vec<String>,
}

impl Deliveries {
    fn record(&mut self, outcome: Result<Result<(), String>, tokio::task::JoinError>) {
        match outcome {
            Ok(Ok(())) => self.delivered += 1,
            Ok(Err(reason)) => self.failures.push(reason),
            Err(e) => self.failures.push(e.to_string()),
        }
    }

    /// Collect deliveries that already finished without waiting.
    fn reap(&mut self) {
        while let Some(outcome) = self.in_flight.try_join_next() {
            self.record(outcome);
        }
    }
}

/// Publishes key/value records to one topic.
///
/// Records are enqueued on the transport and delivered in the background;
/// [`RecordProducer::close`] waits for every one of them.
pub struct RecordProducer<T> {
    topic: ProvisionedTopic,
    key_schema: RegisteredSchema,
    value_schema: Option<RegisteredSchema>,
    transport: T,
    deliveries: Mutex<Deliveries>,
    flush_timeout: std::time::Duration,
}

impl<T> std::fmt::Debug for RecordProducer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordProducer")
            .field("topic", &self.topic.name())
            .field("key_schema_id", &self.key_schema.id())
            .field("value_schema_id", &self.value_schema.as_ref().map(|s| s.id()))
            .finish()
    }
}

impl<T: Transport> RecordProducer<T> {
    /// Provision the topic, then build the producer.
    pub async fn connect<A, R>(
        provisioner: &TopicProvisioner<A>,
        registry: &R,
        transport: T,
        spec: TopicSpec,
        schemas: SchemaPair,
        config: &ProducerConfig,
    ) -> Result<Self, ProducerError>
    where
        A: BrokerAdmin,
        R: SchemaRegistry,
    {
        let topic = provisioner.provision(spec).await.inspect_err(|e| {
            tracing::error!(error = %e, "Producer unusable, topic provisioning failed");
        })?;
        Self::new(topic, registry, transport, schemas, config).await
    }

    /// Register the schemas for an already provisioned topic.
    pub async fn new<R: SchemaRegistry>(
        topic: ProvisionedTopic,
        registry: &R,
        transport: T,
        schemas: SchemaPair,
        config: &ProducerConfig,
    ) -> Result<Self, ProducerError> {
        let key_schema = register(registry, format!("{}-key", topic.name()), schemas.key).await?;
        let value_schema = match schemas.value {
            Some(schema) => Some(register(registry, format!("{}-value", topic.name()), schema).await?),
            None => None,
        };

        tracing::info!(
            topic = topic.name(),
            partitions = topic.spec().partitions,
            key_schema_id = key_schema.id(),
            value_schema_id = ?value_schema.as_ref().map(RegisteredSchema::id),
            "Producer ready"
        );

        Ok(Self {
            topic,
            key_schema,
            value_schema,
            transport,
            deliveries: Mutex::new(Deliveries::default()),
            flush_timeout: config.flush_timeout(),
        })
    }

    pub fn topic(&self) -> &str { self.topic.name() }

    /// Records enqueued whose delivery outcome is not yet known.
    pub fn pending(&self) -> usize {
        let mut deliveries = self.deliveries.lock();
        deliveries.reap();
        deliveries.in_flight.len()
    }

    pub fn current_time_millis(&self) -> i64 { current_time_millis() }

    /// Serialize against the bound schemas and enqueue for delivery.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn publish<K, V>(&self, key: &K, value: &V) -> Result<(), PublishError>
    where
        K: Serialize + ?Sized,
        V: Serialize + ?Sized,
    {
        let topic = self.topic();
        let key = self
            .key_schema
            .encode(key)
            .map_err(|e| PublishError::from_codec(topic, e))?;
        let payload = match &self.value_schema {
            Some(schema) => schema.encode(value),
            None => encode_json(value),
        }
        .map_err(|e| PublishError::from_codec(topic, e))?;

        let delivery = self.transport.enqueue(topic, &key, &payload)?;

        let mut deliveries = self.deliveries.lock();
        deliveries.reap();
        deliveries.in_flight.spawn(delivery);
        Ok(())
    }

    /// Wait for every enqueued record to be acknowledged, then flush the client.
    ///
    /// Returns the number of records delivered over the producer's lifetime.
    /// If any delivery failed the error carries the failure count.
    pub async fn close(self) -> Result<usize, PublishError> {
        let topic = self.topic.name().to_string();
        let mut deliveries = self.deliveries.into_inner();

        tracing::debug!(topic, in_flight = deliveries.in_flight.len(), "Closing producer");

        while let Some(outcome) = deliveries.in_flight.join_next().await {
            deliveries.record(outcome);
        }

        self.transport
            .flush(self.flush_timeout)
            .await
            .map_err(|reason| PublishError::Flush {
                topic: topic.clone(),
                reason,
            })?;

        if let Some(reason) = deliveries.failures.first() {
            tracing::error!(
                topic,
                failed = deliveries.failures.len(),
                delivered = deliveries.delivered,
                error = %reason,
                "Records were not delivered"
            );
            return Err(PublishError::Delivery {
                topic,
                failed: deliveries.failures.len(),
                reason: reason.clone(),
            });
        }

        tracing::info!(topic, delivered = deliveries.delivered, "Producer closed");
        Ok(deliveries.delivered)
    }
}

async fn register<R: SchemaRegistry>(
    registry: &R,
    subject: String,
    schema: Schema,
) -> Result<RegisteredSchema, ProducerError> {
    match registry.register(&subject, &schema).await {
        Ok(id) => Ok(RegisteredSchema::new(subject, id, schema)),
        Err(source) => {
            tracing::warn!(subject = %subject, error = %source, "Failed to register schema");
            Err(ProducerError::Schema { subject, source })
        },
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde::Deserialize;

    use super::*;
    use crate::{
        codec::decode_avro,
        error::ProvisionError,
        testing::{MemoryRegistry, MemoryTransport, MockAdmin},
    };

    const KEY_SCHEMA: &str = r#"{
        "type": "record",
        "name": "arrival_key",
        "namespace": "com.cta",
        "fields": [{"name": "timestamp", "type": "long"}]
    }"#;

    const VALUE_SCHEMA: &str = r#"{
        "type": "record",
        "name": "turnstile",
        "namespace": "com.cta",
        "fields": [
            {"name": "station_id", "type": "long"},
            {"name": "station_name", "type": "string"}
        ]
    }"#;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Key {
        timestamp: i64,
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Turnstile {
        station_id: i64,
        station_name: String,
    }

    fn schemas() -> SchemaPair { SchemaPair::parse(KEY_SCHEMA, Some(VALUE_SCHEMA)).unwrap() }

    async fn producer(transport: MemoryTransport) -> RecordProducer<MemoryTransport> {
        let provisioner = TopicProvisioner::with_timeout(MockAdmin::default(), Duration::from_secs(1));
        RecordProducer::connect(
            &provisioner,
            &MemoryRegistry::default(),
            transport,
            TopicSpec::new("cta.turnstiles"),
            schemas(),
            &ProducerConfig::default(),
        )
        .await
        .unwrap()
    }

    fn turnstile() -> Turnstile {
        Turnstile {
            station_id: 40380,
            station_name: "Clark/Lake".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn close_waits_for_every_published_record() {
        let transport = MemoryTransport::with_delay(Duration::from_millis(200));
        let producer = producer(transport.clone()).await;

        for timestamp in 0..3 {
            producer.publish(&Key { timestamp }, &turnstile()).unwrap();
        }
        assert!(transport.delivered().is_empty());

        assert_eq!(producer.close().await.unwrap(), 3);

        let delivered = transport.delivered();
        assert_eq!(delivered.len(), 3);
        assert_eq!(transport.flushes(), 1);

        let schemas = schemas();
        let (_, value): (u32, Turnstile) =
            decode_avro(schemas.value.as_ref().unwrap(), &delivered[0].payload).unwrap();
        assert_eq!(value, turnstile());
    }

    #[tokio::test]
    async fn close_without_publishing_is_ok() {
        let transport = MemoryTransport::default();
        let producer = producer(transport.clone()).await;

        assert_eq!(producer.close().await.unwrap(), 0);
        assert_eq!(transport.flushes(), 1);
    }

    #[tokio::test]
    async fn failed_delivery_surfaces_on_close() {
        let transport = MemoryTransport::default();
        transport.fail_deliveries(true);
        let producer = producer(transport.clone()).await;

        producer.publish(&Key { timestamp: 1 }, &turnstile()).unwrap();
        producer.publish(&Key { timestamp: 2 }, &turnstile()).unwrap();

        let err = producer.close().await.unwrap_err();
        assert!(matches!(err, PublishError::Delivery { failed: 2, .. }));
    }

    #[tokio::test]
    async fn value_violating_schema_is_a_publish_error() {
        let transport = MemoryTransport::default();
        let producer = producer(transport.clone()).await;

        let err = producer
            .publish(&Key { timestamp: 1 }, &Key { timestamp: 2 })
            .unwrap_err();

        assert!(matches!(err, PublishError::SchemaMismatch { ref topic, .. } if topic == "cta.turnstiles"));
        assert_eq!(producer.pending(), 0);
        assert_eq!(producer.close().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn value_without_schema_is_published_as_json() {
        let provisioner = TopicProvisioner::with_timeout(MockAdmin::default(), Duration::from_secs(1));
        let transport = MemoryTransport::default();
        let producer = RecordProducer::connect(
            &provisioner,
            &MemoryRegistry::default(),
            transport.clone(),
            TopicSpec::new("cta.weather"),
            SchemaPair::parse(KEY_SCHEMA, None).unwrap(),
            &ProducerConfig::default(),
        )
        .await
        .unwrap();

        producer
            .publish(&Key { timestamp: producer.current_time_millis() }, &turnstile())
            .unwrap();
        producer.close().await.unwrap();

        let payload: Turnstile = serde_json::from_slice(&transport.delivered()[0].payload).unwrap();
        assert_eq!(payload, turnstile());
    }

    #[tokio::test]
    async fn producers_for_the_same_topic_provision_once() {
        let provisioner = TopicProvisioner::with_timeout(MockAdmin::default(), Duration::from_secs(1));
        let registry = MemoryRegistry::default();

        for _ in 0..3 {
            let producer = RecordProducer::connect(
                &provisioner,
                &registry,
                MemoryTransport::default(),
                TopicSpec::new("cta.turnstiles"),
                schemas(),
                &ProducerConfig::default(),
            )
            .await
            .unwrap();
            producer.close().await.unwrap();
        }

        assert_eq!(provisioner.admin().create_requests(), vec!["cta.turnstiles"]);
        assert_eq!(
            registry.subjects(),
            vec!["cta.turnstiles-key", "cta.turnstiles-value"]
        );
    }

    #[tokio::test]
    async fn construction_errors_are_distinguishable() {
        let provisioner = TopicProvisioner::with_timeout(MockAdmin::default(), Duration::from_secs(1));
        provisioner.admin().reject("cta.turnstiles", "no quota");
        let registry = MemoryRegistry::default();

        let err = RecordProducer::connect(
            &provisioner,
            &registry,
            MemoryTransport::default(),
            TopicSpec::new("cta.turnstiles"),
            schemas(),
            &ProducerConfig::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProducerError::Provision(ProvisionError::Rejected { .. })));

        provisioner.admin().allow("cta.turnstiles");
        registry.set_unavailable(true);

        let err = RecordProducer::connect(
            &provisioner,
            &registry,
            MemoryTransport::default(),
            TopicSpec::new("cta.turnstiles"),
            schemas(),
            &ProducerConfig::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProducerError::Schema { ref subject, .. } if subject == "cta.turnstiles-key"));
    }

    #[test]
    fn current_time_is_after_2020() {
        assert!(current_time_millis() > 1_577_836_800_000);
    }
}

pub mod admin;
pub mod codec;
pub mod config;
pub mod error;
pub mod producer;
pub mod schema_registry;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod topics;
pub mod transport;

// Re-export main types
pub use admin::{BrokerAdmin, KafkaAdmin};
pub use codec::{decode_avro, parse_schema, RegisteredSchema};
pub use config::ProducerConfig;
pub use error::{CodecError, ProducerError, ProvisionError, PublishError, SchemaRegistryError};
pub use producer::{current_time_millis, RecordProducer, SchemaPair};
pub use schema_registry::{HttpSchemaRegistry, SchemaRegistry};
pub use topics::{ProvisionedTopic, TopicProvisioner, TopicSpec, TopicState};
pub use transport::{create_producer, KafkaTransport, Transport};

// Re-export rdkafka types for convenience
pub use rdkafka::producer::FutureProducer;

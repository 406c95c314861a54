//! Station seeder - publishes a JSON file of raw station records.

use std::path::PathBuf;

use clap::Parser as _;
use cta_stations_stream::{Station, StationKey, STATION_KEY_SCHEMA, STATION_VALUE_SCHEMA};
use cta_topic_producer::{
    HttpSchemaRegistry, KafkaAdmin, KafkaTransport, ProducerConfig, RecordProducer, SchemaPair,
    TopicProvisioner, TopicSpec,
};
use tracing_subscriber::EnvFilter;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(clap::Parser)]
#[command(version, author, about = "Station seeder - publish raw CTA stations")]
pub struct Opts {
    /// JSON array of station records.
    #[arg(default_value = "demos/station-seeder/data/stations.json")]
    file: PathBuf,

    #[arg(long, default_value = "raw.cta.stations")]
    topic: String,

    #[arg(long, default_value_t = 1)]
    partitions: i32,

    #[arg(long, env = "KAFKA_BROKERS")]
    kafka_brokers: Option<String>,

    #[arg(long, env = "SCHEMA_REGISTRY_URL")]
    schema_registry_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("station_seeder=info".parse()?)
                .add_directive("cta_topic_producer=info".parse()?)
                .add_directive("rdkafka=warn".parse()?),
        )
        .init();

    let opts = Opts::parse();

    let mut config = ProducerConfig::default();
    if let Some(brokers) = opts.kafka_brokers {
        config.brokers = brokers;
    }
    if let Some(url) = opts.schema_registry_url {
        config.schema_registry_url = url;
    }

    let stations: Vec<Station> = serde_json::from_str(&std::fs::read_to_string(&opts.file)?)?;
    tracing::info!(file = %opts.file.display(), count = stations.len(), "Loaded stations");

    let registry = HttpSchemaRegistry::new(&config)?;
    if !registry.is_available().await {
        tracing::warn!(url = registry.base_url(), "Schema registry did not answer, trying anyway");
    }

    let provisioner = TopicProvisioner::new(KafkaAdmin::new(&config)?, &config);
    let producer = RecordProducer::connect(
        &provisioner,
        &registry,
        KafkaTransport::new(&config)?,
        TopicSpec::with_defaults(opts.topic, &config).partitions(opts.partitions),
        SchemaPair::parse(STATION_KEY_SCHEMA, Some(STATION_VALUE_SCHEMA))?,
        &config,
    )
    .await?;

    let mut rejected = 0usize;
    for station in &stations {
        let key = StationKey {
            timestamp: producer.current_time_millis(),
        };
        if let Err(e) = producer.publish(&key, station) {
            rejected += 1;
            tracing::error!(error = %e, stop_id = station.stop_id, "Failed to publish station");
        }
    }

    let topic = producer.topic().to_string();
    let delivered = producer.close().await?;
    tracing::info!(topic, delivered, rejected, "Seeding complete");

    Ok(())
}

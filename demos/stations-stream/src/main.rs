//! Stations stream - turns raw CTA station records into a line-tagged table.
//!
//! Provisions the source and changelog topics, rebuilds the table from its
//! changelog, then runs one transformer per source partition until ctrl-c.

use std::{path::PathBuf, sync::Arc};

use clap::Parser as _;
use cta_stations_stream::{
    KafkaChangelog, MaterializedTable, StationSource, StreamConfig, StreamTransformer,
};
use cta_topic_producer::{KafkaAdmin, ProducerConfig, TopicProvisioner};
use serde::Deserialize;
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(clap::Parser)]
#[command(version, author, about = "Stations stream - CTA stations to a line-tagged table")]
pub struct Opts {
    /// TOML file with `[producer]` and `[stream]` sections.
    #[arg(long, short)]
    config: Option<PathBuf>,

    #[arg(long, env = "KAFKA_BROKERS")]
    kafka_brokers: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AppConfig {
    #[serde(default)]
    producer: ProducerConfig,
    #[serde(default)]
    stream: StreamConfig,
}

fn load_config(opts: &Opts) -> Result<AppConfig, BoxError> {
    let mut config: AppConfig = match &opts.config {
        Some(path) => toml::from_str(&std::fs::read_to_string(path)?)?,
        None => AppConfig::default(),
    };

    if let Some(brokers) = &opts.kafka_brokers {
        config.producer.brokers = brokers.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("stations_stream=info".parse()?)
                .add_directive("cta_stations_stream=info".parse()?)
                .add_directive("cta_topic_producer=info".parse()?)
                .add_directive("rdkafka=warn".parse()?),
        )
        .init();

    let opts = Opts::parse();
    let AppConfig { producer, stream } = load_config(&opts)?;

    tracing::info!(
        brokers = %producer.brokers,
        source = %stream.source_topic,
        changelog = %stream.changelog_topic,
        "Starting stations stream"
    );

    let provisioner = TopicProvisioner::new(KafkaAdmin::new(&producer)?, &producer);
    for (topic, result) in provisioner
        .ensure_topics(&[stream.source_spec(&producer), stream.changelog_spec(&producer)])
        .await
    {
        if let Err(e) = result {
            tracing::warn!(topic, error = %e, "Continuing without confirmed topic");
        }
    }

    let changelog = KafkaChangelog::new(&producer, &stream)?;
    let table = Arc::new(MaterializedTable::new(&stream.table_name, changelog));
    table.rebuild_from_changelog().await?;

    let (source, receivers) = StationSource::create(&producer, &stream)?;

    let offsets = source.offsets();

    let mut workers = JoinSet::new();
    for (worker, rx) in receivers.into_iter().enumerate() {
        workers.spawn(StreamTransformer::new(Arc::clone(&table), worker).run(rx, offsets.clone()));
    }

    let mut failure: Option<BoxError> = None;

    tokio::select! {
        result = source.run() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Station source failed");
                failure = Some(e.into());
            }
        }
        Some(joined) = workers.join_next() => {
            // A worker only stops early on a durability failure.
            match joined {
                Ok(Ok(stats)) => tracing::warn!(?stats, "Transformer exited early"),
                Ok(Err(e)) => failure = Some(e.into()),
                Err(e) => failure = Some(e.into()),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown requested");
        }
    }

    // Dropping the source closed every worker channel.
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(Ok(stats)) => tracing::info!(applied = stats.applied, rejected = stats.rejected, "Transformer finished"),
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Transformer failed");
                failure.get_or_insert_with(|| e.into());
            },
            Err(e) => {
                failure.get_or_insert_with(|| e.into());
            },
        }
    }

    tracing::info!(keys = table.len().await, "Stations stream stopped");

    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

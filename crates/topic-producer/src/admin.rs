//! Broker control-plane access used by the provisioner.

use std::{collections::HashSet, future::Future, sync::Arc, time::Duration};

use rdkafka::{
    admin::{AdminClient, AdminOptions, NewTopic, TopicReplication},
    client::DefaultClientContext,
    error::KafkaError,
    types::RDKafkaErrorCode,
    ClientConfig,
};

use crate::{config::ProducerConfig, error::ProvisionError, topics::TopicSpec};

/// Per-topic outcome of a create request.
pub type TopicCreation = (String, Result<(), ProvisionError>);

/// Narrow view of the broker admin API.
pub trait BrokerAdmin: Send + Sync {
    /// Names of every topic the cluster currently knows about.
    fn topic_names(
        &self,
        timeout: Duration,
    ) -> impl Future<Output = Result<HashSet<String>, ProvisionError>> + Send;

    /// Issue one create request for all `topics`.
    /// The outer error means the request itself failed; per-topic failures are in the vec.
    fn create_topics(
        &self,
        topics: &[TopicSpec],
        timeout: Duration,
    ) -> impl Future<Output = Result<Vec<TopicCreation>, ProvisionError>> + Send;
}

/// [`BrokerAdmin`] backed by an rdkafka admin client.
#[derive(Clone)]
pub struct KafkaAdmin {
    admin: Arc<AdminClient<DefaultClientContext>>,
}

impl std::fmt::Debug for KafkaAdmin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaAdmin").finish_non_exhaustive()
    }
}

impl KafkaAdmin {
    pub fn new(config: &ProducerConfig) -> Result<Self, ProvisionError> {
        let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .create()
            .map_err(|e| ProvisionError::Client(e.to_string()))?;

        Ok(Self {
            admin: Arc::new(admin),
        })
    }
}

fn metadata_error(err: KafkaError, timeout: Duration) -> ProvisionError {
    match err.rdkafka_error_code() {
        Some(RDKafkaErrorCode::OperationTimedOut) => ProvisionError::Timeout(timeout),
        _ => ProvisionError::Metadata(err.to_string()),
    }
}

impl BrokerAdmin for KafkaAdmin {
    async fn topic_names(&self, timeout: Duration) -> Result<HashSet<String>, ProvisionError> {
        // fetch_metadata blocks the calling thread for up to `timeout`.
        let admin = Arc::clone(&self.admin);
        let metadata = tokio::task::spawn_blocking(move || admin.inner().fetch_metadata(None, timeout))
            .await
            .map_err(|e| ProvisionError::Client(e.to_string()))?
            .map_err(|e| metadata_error(e, timeout))?;

        Ok(metadata
            .topics()
            .iter()
            .map(|t| t.name().to_string())
            .collect())
    }

    async fn create_topics(
        &self,
        topics: &[TopicSpec],
        timeout: Duration,
    ) -> Result<Vec<TopicCreation>, ProvisionError> {
        let new_topics: Vec<NewTopic<'_>> = topics
            .iter()
            .map(|spec| {
                spec.config.iter().fold(
                    NewTopic::new(&spec.name, spec.partitions, TopicReplication::Fixed(spec.replicas)),
                    |topic, (key, value)| topic.set(key, value),
                )
            })
            .collect();

        let options = AdminOptions::new()
            .operation_timeout(Some(timeout))
            .request_timeout(Some(timeout));

        let results = self
            .admin
            .create_topics(new_topics.iter(), &options)
            .await
            .map_err(|e| metadata_error(e, timeout))?;

        Ok(results
            .into_iter()
            .map(|result| match result {
                Ok(topic) => (topic, Ok(())),
                Err((topic, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    let err = ProvisionError::AlreadyExists(topic.clone());
                    (topic, Err(err))
                },
                Err((topic, code)) => {
                    let err = ProvisionError::Rejected {
                        topic: topic.clone(),
                        reason: code.to_string(),
                    };
                    (topic, Err(err))
                },
            })
            .collect())
    }
}

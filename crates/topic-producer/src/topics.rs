use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::{admin::BrokerAdmin, config::ProducerConfig, error::ProvisionError};

/// Desired shape of a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSpec {
    pub name: String,
    pub partitions: i32,
    pub replicas: i32,
    /// Extra topic-level configuration, e.g. `cleanup.policy`.
    pub config: Vec<(String, String)>,
}

impl TopicSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            partitions: 1,
            replicas: 1,
            config: Vec::new(),
        }
    }

    /// Spec using the partition/replica defaults from `config`.
    pub fn with_defaults(name: impl Into<String>, config: &ProducerConfig) -> Self {
        Self::new(name)
            .partitions(config.default_partitions)
            .replicas(config.default_replicas)
    }

    pub fn partitions(mut self, partitions: i32) -> Self {
        self.partitions = partitions;
        self
    }

    pub fn replicas(mut self, replicas: i32) -> Self {
        self.replicas = replicas;
        self
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.push((key.into(), value.into()));
        self
    }

    pub fn compacted(self) -> Self { self.set("cleanup.policy", "compact") }

    pub fn validate(&self) -> Result<(), ProvisionError> {
        let reason = if self.name.is_empty() {
            "topic name is empty"
        } else if self.partitions < 1 {
            "partition count must be at least 1"
        } else if self.replicas < 1 {
            "replica count must be at least 1"
        } else {
            return Ok(());
        };

        Err(ProvisionError::InvalidSpec {
            topic: self.name.clone(),
            reason: reason.to_string(),
        })
    }
}

/// What this process knows about a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TopicState {
    #[default]
    Unknown,
    ConfirmedExisting,
    Created,
    CreationFailed,
}

impl TopicState {
    pub fn is_provisioned(self) -> bool { matches!(self, Self::ConfirmedExisting | Self::Created) }
}

/// Proof that a topic was provisioned by a [`TopicProvisioner`].
/// Producers can only be built from one of these.
#[derive(Debug, Clone)]
pub struct ProvisionedTopic {
    spec: TopicSpec,
}

impl ProvisionedTopic {
    pub fn name(&self) -> &str { &self.spec.name }

    pub fn spec(&self) -> &TopicSpec { &self.spec }
}

type TopicSlot = Arc<AsyncMutex<TopicState>>;

/// Creates topics if they don't exist, skips if they already exist.
///
/// One instance is shared (behind an `Arc`) by every producer in the process.
/// Each topic name has its own async lock, so at most one create request per
/// name is in flight at a time and a name that reached `Created` or
/// `ConfirmedExisting` is never sent to the broker again.
pub struct TopicProvisioner<A> {
    admin: A,
    timeout: Duration,
    registry: Mutex<HashMap<String, TopicSlot>>,
}

impl<A> std::fmt::Debug for TopicProvisioner<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicProvisioner")
            .field("timeout", &self.timeout)
            .field("tracked_topics", &self.registry.lock().len())
            .finish()
    }
}

impl<A: BrokerAdmin> TopicProvisioner<A> {
    pub fn new(admin: A, config: &ProducerConfig) -> Self {
        Self::with_timeout(admin, config.metadata_timeout())
    }

    pub fn with_timeout(admin: A, timeout: Duration) -> Self {
        Self {
            admin,
            timeout,
            registry: Mutex::new(HashMap::new()),
        }
    }

    pub fn admin(&self) -> &A { &self.admin }

    pub async fn state(&self, name: &str) -> TopicState {
        let slot = self.registry.lock().get(name).cloned();
        match slot {
            Some(slot) => *slot.lock().await,
            None => TopicState::Unknown,
        }
    }

    /// Ensure a single topic exists.
    pub async fn ensure_topic(&self, spec: &TopicSpec) -> Result<(), ProvisionError> {
        self.ensure_topics(std::slice::from_ref(spec))
            .await
            .into_iter()
            .map(|(_, result)| result)
            .next()
            .unwrap_or(Ok(()))
    }

    /// Ensure the topic exists and hand back a token for producer construction.
    pub async fn provision(&self, spec: TopicSpec) -> Result<ProvisionedTopic, ProvisionError> {
        self.ensure_topic(&spec).await?;
        Ok(ProvisionedTopic { spec })
    }

    /// Ensure every topic in `specs` exists.
    ///
    /// Returns one result per distinct topic name, in input order. A failure
    /// for one topic is logged and does not affect the others.
    pub async fn ensure_topics(&self, specs: &[TopicSpec]) -> Vec<(String, Result<(), ProvisionError>)> {
        let mut order = Vec::new();
        let mut seen = HashSet::new();
        let mut results: HashMap<String, Result<(), ProvisionError>> = HashMap::new();
        // Sorted so concurrent batches lock names in the same order.
        let mut pending: BTreeMap<&str, &TopicSpec> = BTreeMap::new();

        for spec in specs {
            if !seen.insert(spec.name.as_str()) {
                continue;
            }
            order.push(spec.name.clone());

            match spec.validate() {
                Ok(()) => {
                    pending.insert(&spec.name, spec);
                },
                Err(e) => {
                    tracing::warn!(topic = %spec.name, error = %e, "Refusing to provision topic");
                    results.insert(spec.name.clone(), Err(e));
                },
            }
        }

        let mut outstanding = Vec::new();
        for (name, spec) in pending {
            let guard = self.slot(name).lock_owned().await;
            if guard.is_provisioned() {
                tracing::trace!(topic = name, "Topic already provisioned");
                results.insert(name.to_string(), Ok(()));
                continue;
            }
            outstanding.push((spec, guard));
        }

        if !outstanding.is_empty() {
            self.provision_outstanding(outstanding, &mut results).await;
        }

        order
            .into_iter()
            .map(|name| {
                let result = results.remove(&name).unwrap_or(Ok(()));
                (name, result)
            })
            .collect()
    }

    fn slot(&self, name: &str) -> TopicSlot {
        let mut registry = self.registry.lock();
        Arc::clone(registry.entry(name.to_string()).or_default())
    }

    /// Query the broker once, then create whatever is missing in one request.
    /// Every guard is held until its topic's state is final.
    async fn provision_outstanding(
        &self,
        outstanding: Vec<(&TopicSpec, OwnedMutexGuard<TopicState>)>,
        results: &mut HashMap<String, Result<(), ProvisionError>>,
    ) {
        let existing = match self.admin.topic_names(self.timeout).await {
            Ok(names) => names,
            Err(e) => {
                // State is left as it was so a later call re-queries.
                for (spec, _guard) in outstanding {
                    tracing::warn!(topic = %spec.name, error = %e, "Failed to fetch topic metadata");
                    results.insert(spec.name.clone(), Err(e.clone()));
                }
                return;
            },
        };

        let mut missing = Vec::new();
        for (spec, mut guard) in outstanding {
            if existing.contains(&spec.name) {
                tracing::info!(topic = %spec.name, "Not recreating existing topic");
                *guard = TopicState::ConfirmedExisting;
                results.insert(spec.name.clone(), Ok(()));
            } else {
                missing.push((spec, guard));
            }
        }

        if missing.is_empty() {
            return;
        }

        let to_create: Vec<TopicSpec> = missing.iter().map(|(spec, _)| (*spec).clone()).collect();
        let mut created: HashMap<String, Result<(), ProvisionError>> =
            match self.admin.create_topics(&to_create, self.timeout).await {
                Ok(outcomes) => outcomes.into_iter().collect(),
                Err(e) => {
                    tracing::error!(error = %e, count = missing.len(), "Failed to create topics");
                    for (spec, mut guard) in missing {
                        *guard = TopicState::CreationFailed;
                        results.insert(spec.name.clone(), Err(e.clone()));
                    }
                    return;
                },
            };

        for (spec, mut guard) in missing {
            let outcome = created.remove(&spec.name).unwrap_or_else(|| {
                Err(ProvisionError::Rejected {
                    topic: spec.name.clone(),
                    reason: "broker returned no result for topic".to_string(),
                })
            });

            let result = match outcome {
                Ok(()) => {
                    tracing::info!(
                        topic = %spec.name,
                        partitions = spec.partitions,
                        replicas = spec.replicas,
                        "Topic created"
                    );
                    *guard = TopicState::Created;
                    Ok(())
                },
                Err(ProvisionError::AlreadyExists(_)) => {
                    tracing::debug!(topic = %spec.name, "Topic already exists");
                    *guard = TopicState::ConfirmedExisting;
                    Ok(())
                },
                Err(e) => {
                    tracing::warn!(topic = %spec.name, error = %e, "Failed to create topic");
                    *guard = TopicState::CreationFailed;
                    Err(e)
                },
            };
            results.insert(spec.name.clone(), result);
        }
    }
}

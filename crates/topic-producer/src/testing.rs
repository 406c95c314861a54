//! In-memory stand-ins for the broker, the schema registry and the producer
//! transport. Enabled for this crate's tests and behind the `testing` feature.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use apache_avro::Schema;
use parking_lot::Mutex;

use crate::{
    admin::{BrokerAdmin, TopicCreation},
    error::{ProvisionError, PublishError, SchemaRegistryError},
    schema_registry::SchemaRegistry,
    topics::TopicSpec,
    transport::{PendingDelivery, Transport},
};

/// Broker admin that keeps topics in a set and records every create request.
#[derive(Debug, Default)]
pub struct MockAdmin {
    existing: Mutex<HashSet<String>>,
    /// Topics another process created after our metadata query.
    elsewhere: Mutex<HashSet<String>>,
    rejected: Mutex<HashMap<String, String>>,
    requests: Mutex<Vec<String>>,
    pub metadata_calls: AtomicUsize,
    /// Number of upcoming metadata queries that time out.
    pub metadata_failures: AtomicUsize,
    pub create_batches: AtomicUsize,
}

impl MockAdmin {
    pub fn with_existing<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let admin = Self::default();
        admin
            .existing
            .lock()
            .extend(topics.into_iter().map(Into::into));
        admin
    }

    pub fn reject(&self, topic: &str, reason: &str) {
        self.rejected
            .lock()
            .insert(topic.to_string(), reason.to_string());
    }

    pub fn allow(&self, topic: &str) { self.rejected.lock().remove(topic); }

    pub fn create_elsewhere(&self, topic: &str) { self.elsewhere.lock().insert(topic.to_string()); }

    /// Topic names of every create request, in arrival order.
    pub fn create_requests(&self) -> Vec<String> { self.requests.lock().clone() }

    pub fn topics(&self) -> HashSet<String> { self.existing.lock().clone() }
}

impl BrokerAdmin for MockAdmin {
    async fn topic_names(&self, timeout: Duration) -> Result<HashSet<String>, ProvisionError> {
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .metadata_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ProvisionError::Timeout(timeout));
        }
        Ok(self.topics())
    }

    async fn create_topics(
        &self,
        topics: &[TopicSpec],
        _timeout: Duration,
    ) -> Result<Vec<TopicCreation>, ProvisionError> {
        self.create_batches.fetch_add(1, Ordering::SeqCst);
        // Give concurrent callers a chance to interleave.
        tokio::task::yield_now().await;

        let mut outcomes = Vec::with_capacity(topics.len());
        for spec in topics {
            self.requests.lock().push(spec.name.clone());

            let rejection = self.rejected.lock().get(&spec.name).cloned();
            let outcome = if let Some(reason) = rejection {
                Err(ProvisionError::Rejected {
                    topic: spec.name.clone(),
                    reason,
                })
            } else if self.elsewhere.lock().remove(&spec.name) || self.existing.lock().contains(&spec.name) {
                self.existing.lock().insert(spec.name.clone());
                Err(ProvisionError::AlreadyExists(spec.name.clone()))
            } else {
                self.existing.lock().insert(spec.name.clone());
                Ok(())
            };
            outcomes.push((spec.name.clone(), outcome));
        }
        Ok(outcomes)
    }
}

/// Schema registry handing out sequential ids per distinct subject/schema pair.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    subjects: Mutex<HashMap<(String, String), u32>>,
    unavailable: AtomicBool,
}

impl MemoryRegistry {
    pub fn set_unavailable(&self, unavailable: bool) { self.unavailable.store(unavailable, Ordering::SeqCst); }

    pub fn subjects(&self) -> Vec<String> {
        let mut subjects: Vec<_> = self
            .subjects
            .lock()
            .keys()
            .map(|(subject, _)| subject.clone())
            .collect();
        subjects.sort();
        subjects
    }
}

impl SchemaRegistry for MemoryRegistry {
    async fn register(&self, subject: &str, schema: &Schema) -> Result<u32, SchemaRegistryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SchemaRegistryError::Status {
                status: 503,
                body: "registry unavailable".to_string(),
            });
        }

        let mut subjects = self.subjects.lock();
        let next = subjects.len() as u32 + 1;
        Ok(*subjects
            .entry((subject.to_string(), schema.canonical_form()))
            .or_insert(next))
    }
}

/// A record that reached the in-memory broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentRecord {
    pub topic: String,
    pub key: Vec<u8>,
    pub payload: Vec<u8>,
}

/// Transport whose deliveries complete after `delay`.
/// Delivered records are visible through [`MemoryTransport::delivered`].
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    delivered: Arc<Mutex<Vec<SentRecord>>>,
    delay: Duration,
    fail_deliveries: Arc<AtomicBool>,
    flushes: Arc<AtomicUsize>,
}

impl MemoryTransport {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn fail_deliveries(&self, fail: bool) { self.fail_deliveries.store(fail, Ordering::SeqCst); }

    pub fn delivered(&self) -> Vec<SentRecord> { self.delivered.lock().clone() }

    pub fn flushes(&self) -> usize { self.flushes.load(Ordering::SeqCst) }
}

impl Transport for MemoryTransport {
    fn enqueue(&self, topic: &str, key: &[u8], payload: &[u8]) -> Result<PendingDelivery, PublishError> {
        let record = SentRecord {
            topic: topic.to_string(),
            key: key.to_vec(),
            payload: payload.to_vec(),
        };
        let delivered = Arc::clone(&self.delivered);
        let fail = self.fail_deliveries.load(Ordering::SeqCst);
        let delay = self.delay;

        Ok(Box::pin(async move {
            tokio::time::sleep(delay).await;
            if fail {
                return Err("Message timed out".to_string());
            }
            delivered.lock().push(record);
            Ok(())
        }))
    }

    async fn flush(&self, _timeout: Duration) -> Result<(), String> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

//! Schema Registry client for registering Avro schemas.
//!
//! Uses the Confluent Schema Registry REST API (compatible with Redpanda).

use std::{collections::HashMap, future::Future, time::Duration};

use apache_avro::Schema;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{config::ProducerConfig, error::SchemaRegistryError};

/// Resolves a schema to the id the registry assigned it under `subject`.
pub trait SchemaRegistry: Send + Sync {
    fn register(
        &self,
        subject: &str,
        schema: &Schema,
    ) -> impl Future<Output = Result<u32, SchemaRegistryError>> + Send;
}

#[derive(Serialize)]
struct RegisterSchemaRequest<'a> {
    #[serde(rename = "schemaType")]
    schema_type: &'a str,
    schema: &'a str,
}

#[derive(Deserialize)]
struct RegisterSchemaResponse {
    id: u32,
}

#[derive(Deserialize)]
struct RegistryErrorBody {
    error_code: i32,
    message: String,
}

/// HTTP client for a Confluent-compatible registry.
/// Ids are cached per subject and canonical schema for the life of the client.
#[derive(Debug)]
pub struct HttpSchemaRegistry {
    client: reqwest::Client,
    base_url: String,
    cache: Mutex<HashMap<(String, String), u32>>,
}

impl HttpSchemaRegistry {
    pub fn new(config: &ProducerConfig) -> Result<Self, SchemaRegistryError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: config.schema_registry_url.trim_end_matches('/').to_string(),
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn base_url(&self) -> &str { &self.base_url }

    /// Check if Schema Registry is available.
    pub async fn is_available(&self) -> bool {
        self.client
            .get(format!("{}/subjects", self.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    async fn post_schema(&self, subject: &str, canonical: &str) -> Result<u32, SchemaRegistryError> {
        let url = format!("{}/subjects/{}/versions", self.base_url, subject);

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/vnd.schemaregistry.v1+json")
            .json(&RegisterSchemaRequest {
                schema_type: "AVRO",
                schema: canonical,
            })
            .send()
            .await?;

        let status = response.status();

        if status.is_success() {
            let result: RegisterSchemaResponse = response.json().await?;
            Ok(result.id)
        } else if status.as_u16() == 409 {
            // Incompatible with the latest version under this subject
            let error: RegistryErrorBody = response.json().await?;
            Err(SchemaRegistryError::Conflict {
                subject: subject.to_string(),
                code: error.error_code,
                message: error.message,
            })
        } else {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            Err(SchemaRegistryError::Status {
                status: status.as_u16(),
                body,
            })
        }
    }
}

impl SchemaRegistry for HttpSchemaRegistry {
    async fn register(&self, subject: &str, schema: &Schema) -> Result<u32, SchemaRegistryError> {
        let key = (subject.to_string(), schema.canonical_form());
        let cached = self.cache.lock().get(&key).copied();
        if let Some(id) = cached {
            return Ok(id);
        }

        let id = self.post_schema(subject, &key.1).await?;
        tracing::info!(subject, schema_id = id, "Schema registered");

        self.cache.lock().insert(key, id);
        Ok(id)
    }
}

//! Schema registry clients
//!
//! Registration is out of band. The encode path only looks up the id of a
//! schema that an operator already registered, and the decode path fetches
//! schema text by the id carried in the wire frame.

use apache_avro::Schema;
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::error::{BrokerError, BrokerResult};

#[async_trait]
pub trait SchemaRegistry: Send + Sync {
    /// Id of `definition` under `subject`. Never registers.
    async fn lookup_id(&self, subject: &str, definition: &str) -> BrokerResult<u32>;

    /// Schema text registered under `id`
    async fn schema_by_id(&self, id: u32) -> BrokerResult<String>;
}

#[derive(Serialize)]
struct SchemaRequest<'a> {
    schema: &'a str,
}

#[derive(Deserialize)]
struct LookupResponse {
    id: u32,
}

#[derive(Deserialize)]
struct SchemaResponse {
    schema: String,
}

/// Client for a Confluent-compatible registry REST API
///
/// Both directions are cached for the life of the client; registered
/// schemas are immutable so entries never go stale.
pub struct HttpSchemaRegistry {
    base_url: Url,
    credentials: Option<(String, String)>,
    http_client: Client,
    ids: RwLock<HashMap<(String, String), u32>>,
    schemas: RwLock<HashMap<u32, String>>,
}

impl std::fmt::Debug for HttpSchemaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSchemaRegistry")
            .field("base_url", &self.base_url.as_str())
            .field("has_credentials", &self.credentials.is_some())
            .finish()
    }
}

impl HttpSchemaRegistry {
    pub fn new(base_url: impl Into<String>) -> BrokerResult<Self> {
        let raw = base_url.into();
        let base_url = Url::parse(&raw)
            .map_err(|e| BrokerError::Configuration(format!("invalid schema registry url '{raw}': {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(BrokerError::Configuration(format!(
                "schema registry url '{raw}' cannot carry a path"
            )));
        }

        let http_client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| BrokerError::Registry(e.to_string()))?;

        Ok(Self {
            base_url,
            credentials: None,
            http_client,
            ids: RwLock::new(HashMap::new()),
            schemas: RwLock::new(HashMap::new()),
        })
    }

    pub fn with_basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }

    /// Registry endpoint with each segment percent-encoded
    fn endpoint(&self, segments: &[&str]) -> BrokerResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| BrokerError::Configuration(format!("invalid schema registry url '{}'", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.credentials {
            Some((user, password)) => request.basic_auth(user, Some(password)),
            None => request,
        }
    }

    /// Convert a registry response into a value or a `Registry` error
    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
        context: &str,
    ) -> BrokerResult<T> {
        let status = response.status();

        if status.is_success() {
            response
                .json::<T>()
                .await
                .map_err(|e| BrokerError::Registry(format!("{context}: invalid response: {e}")))
        } else {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            Err(BrokerError::Registry(format!(
                "{context}: HTTP {}: {body}",
                status.as_u16()
            )))
        }
    }
}

#[async_trait]
impl SchemaRegistry for HttpSchemaRegistry {
    async fn lookup_id(&self, subject: &str, definition: &str) -> BrokerResult<u32> {
        let cache_key = (subject.to_string(), definition.to_string());
        if let Some(id) = self.ids.read().await.get(&cache_key) {
            return Ok(*id);
        }

        let url = self.endpoint(&["subjects", subject])?;
        let response = self
            .authorize(self.http_client.post(url))
            .json(&SchemaRequest { schema: definition })
            .send()
            .await
            .map_err(|e| BrokerError::Registry(e.to_string()))?;

        let context = format!("lookup of subject '{subject}'");
        let found: LookupResponse = Self::handle_response(response, &context).await?;

        tracing::debug!(subject = %subject, schema_id = found.id, "Resolved schema id");
        self.ids.write().await.insert(cache_key, found.id);
        Ok(found.id)
    }

    async fn schema_by_id(&self, id: u32) -> BrokerResult<String> {
        if let Some(schema) = self.schemas.read().await.get(&id) {
            return Ok(schema.clone());
        }

        let id_segment = id.to_string();
        let url = self.endpoint(&["schemas", "ids", &id_segment])?;
        let response = self
            .authorize(self.http_client.get(url))
            .send()
            .await
            .map_err(|e| BrokerError::Registry(e.to_string()))?;

        let context = format!("fetch of schema id {id}");
        let found: SchemaResponse = Self::handle_response(response, &context).await?;

        self.schemas.write().await.insert(id, found.schema.clone());
        Ok(found.schema)
    }
}

#[derive(Default)]
struct Registered {
    next_id: u32,
    by_subject: HashMap<(String, String), u32>,
    by_id: HashMap<u32, String>,
}

/// In-process registry for tests and local development
///
/// Definitions are compared by their Avro canonical form, so whitespace and
/// attribute order do not produce new ids.
#[derive(Default)]
pub struct InMemorySchemaRegistry {
    inner: RwLock<Registered>,
}

impl InMemorySchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a schema under a subject and return its id
    ///
    /// Registering the same schema twice returns the existing id.
    pub async fn register(&self, subject: &str, definition: &str) -> BrokerResult<u32> {
        let canonical = canonical_form(definition)?;
        let mut inner = self.inner.write().await;

        let key = (subject.to_string(), canonical);
        if let Some(id) = inner.by_subject.get(&key) {
            return Ok(*id);
        }

        inner.next_id += 1;
        let id = inner.next_id;
        inner.by_subject.insert(key, id);
        inner.by_id.insert(id, definition.to_string());
        Ok(id)
    }
}

fn canonical_form(definition: &str) -> BrokerResult<String> {
    Schema::parse_str(definition)
        .map(|schema| schema.canonical_form())
        .map_err(|e| BrokerError::Registry(format!("invalid schema: {e}")))
}

#[async_trait]
impl SchemaRegistry for InMemorySchemaRegistry {
    async fn lookup_id(&self, subject: &str, definition: &str) -> BrokerResult<u32> {
        let key = (subject.to_string(), canonical_form(definition)?);
        self.inner
            .read()
            .await
            .by_subject
            .get(&key)
            .copied()
            .ok_or_else(|| {
                BrokerError::Registry(format!("schema not registered under subject '{subject}'"))
            })
    }

    async fn schema_by_id(&self, id: u32) -> BrokerResult<String> {
        self.inner
            .read()
            .await
            .by_id
            .get(&id)
            .cloned()
            .ok_or_else(|| BrokerError::Registry(format!("unknown schema id {id}")))
    }
}

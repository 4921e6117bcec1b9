//! Schema resolution
//!
//! Maps an event type to the Avro schema text and registry subject used to
//! encode it. Resolution is a pure lookup; nothing is registered here.

use async_trait::async_trait;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;

use crate::config::{AvroOptions, MessageBrokerSettings, DEFAULT_SUBJECT_PREFIX};
use crate::error::{BrokerError, BrokerResult};

/// Schema text and the registry subject it is registered under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSchema {
    pub subject: String,
    pub definition: String,
}

/// Maps an event type to its schema
#[async_trait]
pub trait SchemaResolver: Send + Sync {
    async fn resolve(&self, event_type: &str) -> BrokerResult<ResolvedSchema>;
}

/// `<prefix>.<event_type>`, falling back to the default prefix when empty
pub fn subject_for(prefix: &str, event_type: &str) -> String {
    let prefix = if prefix.trim().is_empty() {
        DEFAULT_SUBJECT_PREFIX
    } else {
        prefix
    };
    format!("{prefix}.{event_type}")
}

/// Resolves schemas from files on disk
///
/// The file is read on every call so schema edits are picked up without a
/// restart.
#[derive(Debug, Clone)]
pub struct FileSchemaResolver {
    subject_prefix: String,
    schema_map: HashMap<String, PathBuf>,
}

impl FileSchemaResolver {
    pub fn new(options: &AvroOptions) -> Self {
        Self {
            subject_prefix: options.subject_prefix.clone(),
            schema_map: options
                .schema_map
                .iter()
                .map(|(event_type, path)| (event_type.clone(), PathBuf::from(path)))
                .collect(),
        }
    }

    pub fn from_settings(settings: &MessageBrokerSettings) -> BrokerResult<Self> {
        settings.avro.as_ref().map(Self::new).ok_or_else(|| {
            BrokerError::Configuration("avro options are required for schema resolution".into())
        })
    }
}

#[async_trait]
impl SchemaResolver for FileSchemaResolver {
    async fn resolve(&self, event_type: &str) -> BrokerResult<ResolvedSchema> {
        let path = self.schema_map.get(event_type).ok_or_else(|| {
            BrokerError::schema_resolution(event_type, "event type has no schema mapping")
        })?;

        let definition = tokio::fs::read_to_string(path).await.map_err(|e| {
            let reason = match e.kind() {
                ErrorKind::NotFound => format!("schema file not found: {}", path.display()),
                _ => format!("failed to read {}: {e}", path.display()),
            };
            BrokerError::schema_resolution(event_type, reason)
        })?;

        Ok(ResolvedSchema {
            subject: subject_for(&self.subject_prefix, event_type),
            definition,
        })
    }
}

/// Resolves schemas from definitions held in memory
#[derive(Debug, Clone, Default)]
pub struct InlineSchemaResolver {
    subject_prefix: String,
    schemas: HashMap<String, String>,
}

impl InlineSchemaResolver {
    pub fn new(subject_prefix: impl Into<String>) -> Self {
        Self {
            subject_prefix: subject_prefix.into(),
            schemas: HashMap::new(),
        }
    }

    pub fn with_schema(mut self, event_type: impl Into<String>, definition: impl Into<String>) -> Self {
        self.schemas.insert(event_type.into(), definition.into());
        self
    }
}

#[async_trait]
impl SchemaResolver for InlineSchemaResolver {
    async fn resolve(&self, event_type: &str) -> BrokerResult<ResolvedSchema> {
        let definition = self.schemas.get(event_type).ok_or_else(|| {
            BrokerError::schema_resolution(event_type, "event type has no schema mapping")
        })?;

        Ok(ResolvedSchema {
            subject: subject_for(&self.subject_prefix, event_type),
            definition: definition.clone(),
        })
    }
}

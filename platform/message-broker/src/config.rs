use serde::Deserialize;
use std::collections::HashMap;
use std::env;

use crate::error::{BrokerError, BrokerResult};

pub const DEFAULT_SUBJECT_PREFIX: &str = "events";

/// Which broker transport to build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusType {
    Nats,
    #[default]
    InMemory,
}

impl BusType {
    pub fn parse(value: &str) -> BrokerResult<Self> {
        match value.to_lowercase().as_str() {
            "nats" => Ok(BusType::Nats),
            "inmemory" => Ok(BusType::InMemory),
            other => Err(BrokerError::Configuration(format!(
                "invalid BUS_TYPE '{other}', must be 'inmemory' or 'nats'"
            ))),
        }
    }
}

/// Avro encoding settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AvroOptions {
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,
    /// Event type to schema file path
    #[serde(default)]
    pub schema_map: HashMap<String, String>,
}

/// Durable record store connection and table names
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DatabaseSettings {
    pub connection_string: String,
    #[serde(default = "default_db_schema")]
    pub schema: String,
    #[serde(default = "default_outbox_table")]
    pub outbox_table: String,
    #[serde(default = "default_inbox_table")]
    pub inbox_table: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl DatabaseSettings {
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            schema: default_db_schema(),
            outbox_table: default_outbox_table(),
            inbox_table: default_inbox_table(),
            max_connections: default_max_connections(),
        }
    }

    /// Schema-qualified, quoted outbox table name
    pub fn qualified_outbox_table(&self) -> BrokerResult<String> {
        qualify(&self.schema, &self.outbox_table)
    }

    /// Schema-qualified, quoted inbox table name
    pub fn qualified_inbox_table(&self) -> BrokerResult<String> {
        qualify(&self.schema, &self.inbox_table)
    }
}

/// Messaging configuration consumed at construction time
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MessageBrokerSettings {
    pub bootstrap_servers: String,
    pub group_id: String,
    pub topic: String,
    #[serde(default = "default_true")]
    pub enable_auto_commit: bool,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_security_protocol")]
    pub security_protocol: String,
    #[serde(default)]
    pub schema_registry_url: Option<String>,
    #[serde(default)]
    pub avro: Option<AvroOptions>,
    #[serde(default)]
    pub database: Option<DatabaseSettings>,
    #[serde(default)]
    pub bus_type: BusType,
}

impl MessageBrokerSettings {
    pub fn new(
        bootstrap_servers: impl Into<String>,
        group_id: impl Into<String>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            group_id: group_id.into(),
            topic: topic.into(),
            enable_auto_commit: true,
            username: None,
            password: None,
            security_protocol: default_security_protocol(),
            schema_registry_url: None,
            avro: None,
            database: None,
            bus_type: BusType::InMemory,
        }
    }

    /// Load settings from process environment variables
    pub fn from_env() -> BrokerResult<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load settings through an arbitrary variable lookup
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `BUS_TYPE` | `inmemory` |
    /// | `BROKER_BOOTSTRAP_SERVERS` | `nats://localhost:4222` |
    /// | `BROKER_GROUP_ID` | required |
    /// | `BROKER_TOPIC` | required |
    /// | `BROKER_ENABLE_AUTO_COMMIT` | `true` |
    /// | `BROKER_USERNAME`, `BROKER_PASSWORD` | unset |
    /// | `BROKER_SECURITY_PROTOCOL` | `Plaintext` |
    /// | `SCHEMA_REGISTRY_URL` | unset |
    /// | `AVRO_SUBJECT_PREFIX` | `events` |
    /// | `AVRO_SCHEMA_MAP` | unset, `type=path,type=path` |
    /// | `DATABASE_URL` | unset |
    /// | `DATABASE_SCHEMA`, `OUTBOX_TABLE`, `INBOX_TABLE` | `public`, `outbox_messages`, `inbox_messages` |
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> BrokerResult<Self> {
        let required = |name: &str| {
            lookup(name)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| BrokerError::Configuration(format!("{name} must be set")))
        };

        let bus_type = match lookup("BUS_TYPE") {
            Some(v) => BusType::parse(&v)?,
            None => BusType::InMemory,
        };

        let bootstrap_servers = lookup("BROKER_BOOTSTRAP_SERVERS")
            .unwrap_or_else(|| "nats://localhost:4222".to_string());
        let group_id = required("BROKER_GROUP_ID")?;
        let topic = required("BROKER_TOPIC")?;

        let enable_auto_commit = match lookup("BROKER_ENABLE_AUTO_COMMIT") {
            Some(v) => v.parse::<bool>().map_err(|_| {
                BrokerError::Configuration(
                    "BROKER_ENABLE_AUTO_COMMIT must be 'true' or 'false'".to_string(),
                )
            })?,
            None => true,
        };

        let avro = match lookup("AVRO_SCHEMA_MAP") {
            Some(raw) => Some(AvroOptions {
                subject_prefix: lookup("AVRO_SUBJECT_PREFIX")
                    .unwrap_or_else(default_subject_prefix),
                schema_map: parse_schema_map(&raw)?,
            }),
            None => None,
        };

        let database = lookup("DATABASE_URL").map(|url| DatabaseSettings {
            connection_string: url,
            schema: lookup("DATABASE_SCHEMA").unwrap_or_else(default_db_schema),
            outbox_table: lookup("OUTBOX_TABLE").unwrap_or_else(default_outbox_table),
            inbox_table: lookup("INBOX_TABLE").unwrap_or_else(default_inbox_table),
            max_connections: default_max_connections(),
        });

        let settings = Self {
            bootstrap_servers,
            group_id,
            topic,
            enable_auto_commit,
            username: lookup("BROKER_USERNAME"),
            password: lookup("BROKER_PASSWORD"),
            security_protocol: lookup("BROKER_SECURITY_PROTOCOL")
                .unwrap_or_else(default_security_protocol),
            schema_registry_url: lookup("SCHEMA_REGISTRY_URL"),
            avro,
            database,
            bus_type,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Fail fast on settings that can never work
    pub fn validate(&self) -> BrokerResult<()> {
        for (name, value) in [
            ("bootstrap_servers", &self.bootstrap_servers),
            ("group_id", &self.group_id),
            ("topic", &self.topic),
        ] {
            if value.trim().is_empty() {
                return Err(BrokerError::Configuration(format!(
                    "{name} cannot be empty"
                )));
            }
        }

        if self.username.is_some() != self.password.is_some() {
            return Err(BrokerError::Configuration(
                "username and password must be set together".to_string(),
            ));
        }

        if let Some(db) = &self.database {
            db.qualified_outbox_table()?;
            db.qualified_inbox_table()?;
        }

        Ok(())
    }

    /// Avro is used only when both a registry and schema options exist
    pub fn avro_enabled(&self) -> bool {
        self.schema_registry_url.is_some() && self.avro.is_some()
    }
}

/// Parse `type=path,type=path`
fn parse_schema_map(raw: &str) -> BrokerResult<HashMap<String, String>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            entry
                .split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .filter(|(k, v)| !k.is_empty() && !v.is_empty())
                .ok_or_else(|| {
                    BrokerError::Configuration(format!(
                        "invalid AVRO_SCHEMA_MAP entry '{entry}', expected type=path"
                    ))
                })
        })
        .collect()
}

fn is_sql_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn qualify(schema: &str, table: &str) -> BrokerResult<String> {
    for ident in [schema, table] {
        if !is_sql_identifier(ident) {
            return Err(BrokerError::Configuration(format!(
                "'{ident}' is not a valid SQL identifier"
            )));
        }
    }
    Ok(format!("\"{schema}\".\"{table}\""))
}

fn default_subject_prefix() -> String {
    DEFAULT_SUBJECT_PREFIX.to_string()
}

fn default_db_schema() -> String {
    "public".to_string()
}

fn default_outbox_table() -> String {
    "outbox_messages".to_string()
}

fn default_inbox_table() -> String {
    "inbox_messages".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_security_protocol() -> String {
    "Plaintext".to_string()
}

fn default_true() -> bool {
    true
}

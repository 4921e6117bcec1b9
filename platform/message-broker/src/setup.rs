//! Wiring helpers that turn settings into ready-to-use components

use std::sync::Arc;

use crate::codec::Codec;
use crate::config::{BusType, MessageBrokerSettings};
use crate::error::{BrokerError, BrokerResult};
use crate::registry::{HttpSchemaRegistry, SchemaRegistry};
use crate::schema::{FileSchemaResolver, SchemaResolver};
use crate::transport::{BrokerTransport, InMemoryTransport, NatsTransport};

/// Build the transport selected by `bus_type`
pub async fn connect_transport(settings: &MessageBrokerSettings) -> BrokerResult<Arc<dyn BrokerTransport>> {
    match settings.bus_type {
        BusType::InMemory => {
            tracing::info!("Using InMemory transport");
            Ok(Arc::new(InMemoryTransport::new()))
        }
        BusType::Nats => {
            tracing::info!(servers = %settings.bootstrap_servers, "Connecting to NATS");
            Ok(Arc::new(NatsTransport::connect(settings).await?))
        }
    }
}

/// Build the codec implied by the settings
///
/// A configured registry enables binary decoding. Binary encoding also needs
/// Avro options.
pub fn codec_from_settings(settings: &MessageBrokerSettings) -> BrokerResult<Codec> {
    let registry: Option<Arc<dyn SchemaRegistry>> = match &settings.schema_registry_url {
        Some(url) => {
            let mut registry = HttpSchemaRegistry::new(url.clone())?;
            if let (Some(user), Some(password)) = (&settings.username, &settings.password) {
                registry = registry.with_basic_auth(user.clone(), password.clone());
            }
            Some(Arc::new(registry))
        }
        None => None,
    };

    let resolver: Option<Arc<dyn SchemaResolver>> = settings
        .avro
        .as_ref()
        .map(|avro| Arc::new(FileSchemaResolver::new(avro)) as Arc<dyn SchemaResolver>);

    if resolver.is_some() && registry.is_none() {
        tracing::warn!("Avro options set without a schema registry; publishing JSON");
    }

    let codec = Codec::new(resolver, registry);
    tracing::info!(binary = codec.encodes_binary(), "Codec configured");
    Ok(codec)
}

/// Settings check shared by the binaries
pub fn require_database(settings: &MessageBrokerSettings) -> BrokerResult<&crate::config::DatabaseSettings> {
    settings
        .database
        .as_ref()
        .ok_or_else(|| BrokerError::Configuration("DATABASE_URL must be set".to_string()))
}

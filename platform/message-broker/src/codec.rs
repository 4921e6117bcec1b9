//! # Envelope codec
//!
//! Turns a [`CloudEvent`] into broker bytes and back. Two wire forms exist:
//!
//! - **Text**: the envelope serialized as JSON with `data` inline.
//! - **Binary**: the envelope header fields as JSON, with `data` replaced by
//!   `data_base64`, the base64 of a registry-framed Avro datum
//!   (`0x00`, 4-byte big-endian schema id, datum).
//!
//! The binary form is used for encoding only when both a schema resolver and
//! a registry are configured. Decoding picks the form from the bytes: a
//! `data_base64` field selects the binary path, which fails without a
//! configured registry.

use apache_avro::Schema;
use base64::prelude::{Engine as _, BASE64_STANDARD};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::avro;
use crate::consumer::ReceivedMessage;
use crate::envelope::{CloudEvent, Extensions, CONTENT_TYPE_AVRO};
use crate::error::{BrokerError, BrokerResult};
use crate::payload::Payload;
use crate::registry::SchemaRegistry;
use crate::schema::SchemaResolver;
use crate::transport::TransportMessage;

/// Field that carries the base64 Avro frame in the binary form
pub const DATA_BASE64_FIELD: &str = "data_base64";

/// Envelope header fields plus the encoded payload
#[derive(Debug, Serialize, Deserialize)]
struct BinaryEnvelope {
    #[serde(rename = "specversion")]
    spec_version: String,
    id: String,
    source: String,
    #[serde(rename = "type")]
    event_type: String,
    time: DateTime<Utc>,
    #[serde(rename = "dataContentType")]
    data_content_type: String,
    #[serde(default)]
    subject: Option<String>,
    data_base64: String,
    #[serde(default)]
    extensions: Option<Extensions>,
}

pub struct Codec {
    resolver: Option<Arc<dyn SchemaResolver>>,
    registry: Option<Arc<dyn SchemaRegistry>>,
    parsed: RwLock<HashMap<u32, Arc<Schema>>>,
}

impl Codec {
    /// Build a codec from whatever schema components are configured
    pub fn new(
        resolver: Option<Arc<dyn SchemaResolver>>,
        registry: Option<Arc<dyn SchemaRegistry>>,
    ) -> Self {
        Self {
            resolver,
            registry,
            parsed: RwLock::new(HashMap::new()),
        }
    }

    /// Text-only codec
    pub fn json() -> Self {
        Self::new(None, None)
    }

    /// Codec that encodes binary Avro and decodes both forms
    pub fn avro(resolver: Arc<dyn SchemaResolver>, registry: Arc<dyn SchemaRegistry>) -> Self {
        Self::new(Some(resolver), Some(registry))
    }

    /// True when `encode` produces the binary form
    pub fn encodes_binary(&self) -> bool {
        self.resolver.is_some() && self.registry.is_some()
    }

    /// Encode an envelope using the configured wire form
    pub async fn encode<T: Serialize + Sync>(&self, event: &CloudEvent<T>) -> BrokerResult<Vec<u8>> {
        match (&self.resolver, &self.registry) {
            (Some(resolver), Some(registry)) => {
                Self::encode_binary(resolver.as_ref(), registry.as_ref(), event).await
            }
            _ => Self::encode_text(event),
        }
    }

    /// Encode an envelope in the text form regardless of configuration
    pub fn encode_text<T: Serialize>(event: &CloudEvent<T>) -> BrokerResult<Vec<u8>> {
        serde_json::to_vec(event).map_err(|e| BrokerError::Encode(e.to_string()))
    }

    async fn encode_binary<T: Serialize + Sync>(
        resolver: &dyn SchemaResolver,
        registry: &dyn SchemaRegistry,
        event: &CloudEvent<T>,
    ) -> BrokerResult<Vec<u8>> {
        let resolved = resolver.resolve(&event.event_type).await?;
        let schema = Schema::parse_str(&resolved.definition).map_err(|e| {
            BrokerError::schema_resolution(&event.event_type, format!("invalid schema: {e}"))
        })?;
        let schema_id = registry
            .lookup_id(&resolved.subject, &resolved.definition)
            .await?;

        let payload = Payload::from_serialize(&event.data)?;
        let datum = avro::encode_datum(&schema, &payload)?;

        let envelope = BinaryEnvelope {
            spec_version: event.spec_version.clone(),
            id: event.id.clone(),
            source: event.source.clone(),
            event_type: event.event_type.clone(),
            time: event.time,
            data_content_type: CONTENT_TYPE_AVRO.to_string(),
            subject: event.subject.clone(),
            data_base64: BASE64_STANDARD.encode(avro::frame(schema_id, &datum)),
            extensions: event.extensions.clone(),
        };

        tracing::trace!(
            event_id = %event.id,
            subject = %resolved.subject,
            schema_id,
            "Encoded binary envelope"
        );

        serde_json::to_vec(&envelope).map_err(|e| BrokerError::Encode(e.to_string()))
    }

    /// Decode broker bytes into an envelope
    pub async fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> BrokerResult<CloudEvent<T>> {
        let root: serde_json::Value =
            serde_json::from_slice(bytes).map_err(|e| BrokerError::Decode(e.to_string()))?;

        if root.get(DATA_BASE64_FIELD).is_some() {
            match &self.registry {
                Some(registry) => return self.decode_binary(root, registry.as_ref()).await,
                None => {
                    tracing::warn!("Binary envelope received without a schema registry");
                    return Err(BrokerError::Decode(
                        "binary envelope requires a schema registry to decode".to_string(),
                    ));
                }
            }
        }

        serde_json::from_value(root).map_err(|e| BrokerError::Decode(e.to_string()))
    }

    /// Decode a transport message, keeping its key and headers
    pub async fn decode_message<T: DeserializeOwned>(
        &self,
        raw: TransportMessage,
    ) -> BrokerResult<ReceivedMessage<T>> {
        let event = self.decode(&raw.payload).await?;
        Ok(ReceivedMessage {
            event,
            key: raw.key,
            headers: raw.headers,
        })
    }

    async fn decode_binary<T: DeserializeOwned>(
        &self,
        root: serde_json::Value,
        registry: &dyn SchemaRegistry,
    ) -> BrokerResult<CloudEvent<T>> {
        let envelope: BinaryEnvelope =
            serde_json::from_value(root).map_err(|e| BrokerError::Decode(e.to_string()))?;

        let framed = BASE64_STANDARD
            .decode(&envelope.data_base64)
            .map_err(|e| BrokerError::Decode(format!("invalid data_base64: {e}")))?;
        let (schema_id, datum) = avro::unframe(&framed)?;
        let schema = self.schema_for(schema_id, registry).await?;

        let data: T = avro::decode_datum(&schema, datum)?.into_typed()?;

        Ok(CloudEvent {
            spec_version: envelope.spec_version,
            id: envelope.id,
            source: envelope.source,
            event_type: envelope.event_type,
            time: envelope.time,
            data_content_type: CONTENT_TYPE_AVRO.to_string(),
            subject: envelope.subject,
            data,
            extensions: envelope.extensions,
        })
    }

    async fn schema_for(&self, id: u32, registry: &dyn SchemaRegistry) -> BrokerResult<Arc<Schema>> {
        if let Some(schema) = self.parsed.read().await.get(&id) {
            return Ok(schema.clone());
        }

        let definition = registry.schema_by_id(id).await?;
        let schema = Schema::parse_str(&definition)
            .map(Arc::new)
            .map_err(|e| BrokerError::Decode(format!("schema id {id} is not valid Avro: {e}")))?;

        self.parsed.write().await.insert(id, schema.clone());
        Ok(schema)
    }
}

impl std::fmt::Debug for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Codec")
            .field("encodes_binary", &self.encodes_binary())
            .field("has_registry", &self.registry.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::CONTENT_TYPE_JSON;
    use crate::registry::InMemorySchemaRegistry;
    use crate::schema::InlineSchemaResolver;
    use serde_json::json;

    const INVOICE: &str = r#"{
        "type": "record",
        "name": "InvoiceCreated",
        "fields": [
            {"name": "invoiceId", "type": "string"},
            {"name": "amount", "type": "double"},
            {"name": "currency", "type": "string", "default": "EUR"}
        ]
    }"#;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct InvoiceCreated {
        invoice_id: String,
        amount: f64,
        currency: String,
    }

    fn invoice() -> CloudEvent<InvoiceCreated> {
        CloudEvent::create(
            InvoiceCreated {
                invoice_id: "X".to_string(),
                amount: 150.75,
                currency: "USD".to_string(),
            },
            "invoice.created",
            "urn:billing",
        )
        .with_subject(Some("customer-42".to_string()))
    }

    async fn avro_codec() -> Codec {
        let registry = Arc::new(InMemorySchemaRegistry::new());
        registry
            .register("billing.invoice.created", INVOICE)
            .await
            .unwrap();
        let resolver = InlineSchemaResolver::new("billing").with_schema("invoice.created", INVOICE);
        Codec::avro(Arc::new(resolver), registry)
    }

    #[tokio::test]
    async fn test_text_round_trip() {
        let codec = Codec::json();
        let event = invoice();

        let bytes = codec.encode(&event).await.unwrap();
        let wire: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(wire["data"]["invoiceId"], "X");
        assert!(wire.get(DATA_BASE64_FIELD).is_none());

        let back: CloudEvent<InvoiceCreated> = codec.decode(&bytes).await.unwrap();
        assert_eq!(back, event);
    }

    #[tokio::test]
    async fn test_binary_wire_shape() {
        let codec = avro_codec().await;
        let bytes = codec.encode(&invoice()).await.unwrap();

        let wire: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(wire.get("data").is_none());
        assert_eq!(wire["dataContentType"], CONTENT_TYPE_AVRO);
        assert_eq!(wire["type"], "invoice.created");

        let framed = BASE64_STANDARD
            .decode(wire[DATA_BASE64_FIELD].as_str().unwrap())
            .unwrap();
        assert_eq!(framed[0], avro::MAGIC_BYTE);
        assert_eq!(&framed[1..5], &1u32.to_be_bytes());
    }

    #[tokio::test]
    async fn test_binary_round_trip_keeps_header_fields() {
        let codec = avro_codec().await;
        let event = invoice();

        let bytes = codec.encode(&event).await.unwrap();
        let back: CloudEvent<InvoiceCreated> = codec.decode(&bytes).await.unwrap();

        assert_eq!(back.id, event.id);
        assert_eq!(back.time, event.time);
        assert_eq!(back.subject, event.subject);
        assert_eq!(back.data, event.data);
        assert_eq!(back.data_content_type, CONTENT_TYPE_AVRO);
    }

    #[tokio::test]
    async fn test_partial_configuration_falls_back_to_text() {
        let resolver = InlineSchemaResolver::new("billing").with_schema("invoice.created", INVOICE);
        let codec = Codec::new(Some(Arc::new(resolver)), None);
        assert!(!codec.encodes_binary());

        let bytes = codec.encode(&invoice()).await.unwrap();
        let wire: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(wire["dataContentType"], CONTENT_TYPE_JSON);
    }

    #[tokio::test]
    async fn test_unmapped_event_type_fails_encode() {
        let codec = avro_codec().await;
        let event = CloudEvent::create(json!({"x": 1}), "unknown.type", "urn:test");

        let err = codec.encode(&event).await.unwrap_err();
        assert!(matches!(err, BrokerError::SchemaResolution { .. }));
    }

    #[tokio::test]
    async fn test_unregistered_subject_fails_encode() {
        let resolver = InlineSchemaResolver::new("billing").with_schema("invoice.created", INVOICE);
        let codec = Codec::avro(Arc::new(resolver), Arc::new(InMemorySchemaRegistry::new()));

        let err = codec.encode(&invoice()).await.unwrap_err();
        assert!(matches!(err, BrokerError::Registry(_)));
    }

    #[tokio::test]
    async fn test_binary_without_registry_fails_decode() {
        let bytes = avro_codec().await.encode(&invoice()).await.unwrap();

        let result: BrokerResult<CloudEvent<InvoiceCreated>> = Codec::json().decode(&bytes).await;
        assert!(matches!(result, Err(BrokerError::Decode(_))));
    }

    #[tokio::test]
    async fn test_binary_without_registry_fails_even_for_optional_data() {
        let bytes = avro_codec().await.encode(&invoice()).await.unwrap();

        let result: BrokerResult<CloudEvent<Option<serde_json::Value>>> =
            Codec::json().decode(&bytes).await;
        assert!(matches!(result, Err(BrokerError::Decode(msg)) if msg.contains("registry")));
    }

    #[tokio::test]
    async fn test_binary_decoder_still_reads_text() {
        let codec = avro_codec().await;
        let bytes = Codec::encode_text(&invoice()).unwrap();

        let back: CloudEvent<InvoiceCreated> = codec.decode(&bytes).await.unwrap();
        assert_eq!(back.data.invoice_id, "X");
        assert_eq!(back.data_content_type, CONTENT_TYPE_JSON);
    }

    #[tokio::test]
    async fn test_malformed_bytes_fail_decode() {
        let result: BrokerResult<CloudEvent<serde_json::Value>> =
            Codec::json().decode(b"not json").await;
        assert!(matches!(result, Err(BrokerError::Decode(_))));
    }

    #[tokio::test]
    async fn test_bad_base64_fails_decode() {
        let codec = avro_codec().await;
        let mut wire: serde_json::Value =
            serde_json::from_slice(&codec.encode(&invoice()).await.unwrap()).unwrap();
        wire[DATA_BASE64_FIELD] = json!("***");

        let result: BrokerResult<CloudEvent<InvoiceCreated>> =
            codec.decode(&serde_json::to_vec(&wire).unwrap()).await;
        assert!(matches!(result, Err(BrokerError::Decode(_))));
    }
}

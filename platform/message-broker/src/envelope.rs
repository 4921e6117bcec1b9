//! # CloudEvent Envelope
//!
//! The structured-event wrapper exchanged between publishers and consumers.
//!
//! ## Envelope Fields
//!
//! - `specversion`: Envelope schema version, always [`SPEC_VERSION`]
//! - `id`: Unique event identifier (idempotency key for inbox and outbox)
//! - `source`: URI-like identifier of the producing system
//! - `type`: Event type, also the routing key into the schema resolver
//! - `time`: UTC timestamp when the event was created
//! - `dataContentType`: Which codec path produced `data`
//! - `subject`: Optional free-form correlation label
//! - `data`: Event-specific payload (generic type parameter)
//! - `extensions`: Opaque pass-through attributes
//!
//! The `id` must stay stable across redelivery. Brokers redeliver the same
//! bytes, so the id is minted once at creation and never on receipt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Envelope schema version written on every event
pub const SPEC_VERSION: &str = "1.0";

/// Content type of events whose `data` travels as plain JSON
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Content type of events whose `data` travels as registry-framed Avro
pub const CONTENT_TYPE_AVRO: &str = "avro/binary";

/// Transport headers attached to a message
pub type Headers = HashMap<String, String>;

/// Opaque extension attributes carried on an envelope
pub type Extensions = HashMap<String, serde_json::Value>;

/// Structured event envelope
///
/// # Type Parameter
///
/// * `T` - The event-specific payload type
///
/// # Examples
///
/// ```rust
/// use message_broker::CloudEvent;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Serialize, Deserialize)]
/// struct InvoiceCreated {
///     invoice_id: String,
///     amount: f64,
/// }
///
/// let event = CloudEvent::create(
///     InvoiceCreated {
///         invoice_id: "inv_123".to_string(),
///         amount: 150.75,
///     },
///     "invoice.created",
///     "urn:billing",
/// )
/// .with_subject(Some("customer-42".to_string()));
///
/// assert_eq!(event.spec_version, "1.0");
/// assert_eq!(event.data_content_type, "application/json");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudEvent<T> {
    #[serde(rename = "specversion")]
    pub spec_version: String,

    /// Unique event identifier (idempotency key)
    pub id: String,

    pub source: String,

    #[serde(rename = "type")]
    pub event_type: String,

    pub time: DateTime<Utc>,

    #[serde(rename = "dataContentType")]
    pub data_content_type: String,

    #[serde(default)]
    pub subject: Option<String>,

    pub data: T,

    #[serde(default)]
    pub extensions: Option<Extensions>,
}

impl<T> CloudEvent<T> {
    /// Create a new envelope
    ///
    /// Defaults are applied for `id` (random UUID), `time` (now),
    /// `specversion` and `dataContentType` (JSON). `event_type` and `source`
    /// are taken as given; passing empty strings is a caller bug.
    pub fn create(data: T, event_type: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            spec_version: SPEC_VERSION.to_string(),
            id: Uuid::new_v4().to_string(),
            source: source.into(),
            event_type: event_type.into(),
            time: Utc::now(),
            data_content_type: CONTENT_TYPE_JSON.to_string(),
            subject: None,
            data,
            extensions: None,
        }
    }

    /// Use an explicit id instead of a generated one
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_time(mut self, time: DateTime<Utc>) -> Self {
        self.time = time;
        self
    }

    pub fn with_subject(mut self, subject: Option<String>) -> Self {
        self.subject = subject;
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.data_content_type = content_type.into();
        self
    }

    pub fn with_extensions(mut self, extensions: Option<Extensions>) -> Self {
        self.extensions = extensions;
        self
    }

    /// Swap the payload, keeping every envelope attribute
    pub fn map_data<U>(self, f: impl FnOnce(T) -> U) -> CloudEvent<U> {
        CloudEvent {
            spec_version: self.spec_version,
            id: self.id,
            source: self.source,
            event_type: self.event_type,
            time: self.time,
            data_content_type: self.data_content_type,
            subject: self.subject,
            data: f(self.data),
            extensions: self.extensions,
        }
    }
}

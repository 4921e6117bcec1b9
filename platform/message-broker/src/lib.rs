//! # Message Broker
//!
//! Client-side messaging over a log broker. Application code publishes and
//! consumes typed [`CloudEvent`] envelopes; this crate handles encoding,
//! schema lookup, transport and delivery bookkeeping.
//!
//! ## Layers
//!
//! - **Envelope**: [`CloudEvent`], the structured wrapper around a payload
//! - **Codec**: JSON text, or registry-framed Avro in `data_base64`
//! - **Transport**: [`BrokerTransport`], with NATS and in-memory backends
//! - **Publisher / Consumer**: [`BrokerPublisher`] and [`BrokerConsumer`],
//!   the latter with single and windowed batch loops
//! - **Outbox / Inbox**: decorators that record sent and processed ids in a
//!   durable store
//!
//! ## Usage
//!
//! ```rust,no_run
//! use message_broker::transport::InMemoryTransport;
//! use message_broker::{
//!     BrokerConsumer, BrokerPublisher, BrokerResult, CloudEvent, Codec, MessageConsumer,
//!     MessagePublisher, ReceivedMessage,
//! };
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = InMemoryTransport::new();
//! let codec = Arc::new(Codec::json());
//!
//! let publisher = BrokerPublisher::new(Arc::new(transport.handle()), codec.clone(), "invoices");
//! let consumer = BrokerConsumer::new(Arc::new(transport.handle()), codec, "invoices");
//!
//! let event = CloudEvent::create(serde_json::json!({"invoiceId": "X"}), "invoice.created", "urn:billing");
//! publisher.publish(&event, None, None).await?;
//!
//! let cancel = CancellationToken::new();
//! consumer
//!     .consume(
//!         |msg: ReceivedMessage<serde_json::Value>| async move {
//!             println!("received {}", msg.event.id);
//!             BrokerResult::Ok(())
//!         },
//!         cancel,
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod avro;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod envelope;
pub mod error;
pub mod inbox;
pub mod outbox;
pub mod payload;
pub mod publisher;
pub mod registry;
pub mod schema;
pub mod setup;
pub mod transport;

pub use codec::Codec;
pub use config::{AvroOptions, BusType, DatabaseSettings, MessageBrokerSettings};
pub use consumer::{
    BatchHandler, BatchOptions, BrokerConsumer, MessageConsumer, MessageHandler, ReceivedMessage,
};
pub use envelope::{CloudEvent, Extensions, Headers, CONTENT_TYPE_AVRO, CONTENT_TYPE_JSON, SPEC_VERSION};
pub use error::{BrokerError, BrokerResult, HandlerError};
pub use inbox::{InMemoryInboxStore, InboxConsumer, InboxRecord, InboxStore, PgInboxStore};
pub use outbox::{InMemoryOutboxStore, OutboxPublisher, OutboxRecord, OutboxStore, PgOutboxStore};
pub use payload::Payload;
pub use publisher::{BrokerPublisher, KeySelector, MessagePublisher};
pub use registry::{HttpSchemaRegistry, InMemorySchemaRegistry, SchemaRegistry};
pub use schema::{FileSchemaResolver, InlineSchemaResolver, ResolvedSchema, SchemaResolver};
pub use transport::{BrokerTransport, TransportMessage};

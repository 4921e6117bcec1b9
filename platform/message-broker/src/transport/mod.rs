//! Broker transport abstraction
//!
//! A transport moves opaque bytes between processes. It knows nothing about
//! envelopes or codecs; the publisher and consumer layer those on top.

pub mod inmemory;
pub mod nats;

use async_trait::async_trait;
use std::time::Duration;

use crate::envelope::Headers;
use crate::error::BrokerResult;

pub use inmemory::InMemoryTransport;
pub use nats::NatsTransport;

/// A raw message as it travels over the broker
#[derive(Debug, Clone, PartialEq)]
pub struct TransportMessage {
    pub topic: String,
    /// Partition key; messages sharing a key stay ordered
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub headers: Headers,
}

impl TransportMessage {
    pub fn new(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            payload,
            headers: Headers::new(),
        }
    }

    pub fn with_key(mut self, key: Option<String>) -> Self {
        self.key = key;
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }
}

/// Abstract broker connection
///
/// One transport instance owns at most one subscription. Producing does not
/// require a subscription.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Join the consumer group for a topic
    async fn subscribe(&self, topic: &str) -> BrokerResult<()>;

    /// Send a message and wait for the broker to accept it
    async fn produce(&self, message: TransportMessage) -> BrokerResult<()>;

    /// Take the next message from the subscription
    ///
    /// `None` as timeout blocks until a message arrives. With a timeout,
    /// `Ok(None)` means nothing arrived in time.
    async fn pull(&self, timeout: Option<Duration>) -> BrokerResult<Option<TransportMessage>>;

    /// Leave the group and flush pending produces
    async fn close(&self) -> BrokerResult<()>;
}

impl std::fmt::Debug for dyn BrokerTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerTransport").finish_non_exhaustive()
    }
}

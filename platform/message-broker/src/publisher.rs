//! Publishing envelopes to a broker topic

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

use crate::codec::Codec;
use crate::envelope::{CloudEvent, Headers};
use crate::error::BrokerResult;
use crate::transport::{BrokerTransport, TransportMessage};

/// Derives a partition key from an envelope
pub type KeySelector<T> = dyn Fn(&CloudEvent<T>) -> Option<String> + Send + Sync;

/// Publishes envelopes to the configured topic
///
/// Success means the broker accepted the message. Failures surface to the
/// caller; nothing is retried.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// Publish one envelope with an optional key and headers
    async fn publish<T>(
        &self,
        event: &CloudEvent<T>,
        key: Option<&str>,
        headers: Option<&Headers>,
    ) -> BrokerResult<()>
    where
        T: Serialize + Send + Sync;

    /// Publish envelopes in order, stopping at the first failure
    ///
    /// Envelopes before the failing one stay published.
    async fn publish_batch<T>(
        &self,
        events: &[CloudEvent<T>],
        key_selector: Option<&KeySelector<T>>,
    ) -> BrokerResult<()>
    where
        T: Serialize + Send + Sync,
    {
        for event in events {
            let key = key_selector.and_then(|select| select(event));
            self.publish(event, key.as_deref(), None).await?;
        }
        Ok(())
    }
}

/// Publisher that encodes with a [`Codec`] and produces over a transport
///
/// # Example
/// ```rust
/// use message_broker::transport::InMemoryTransport;
/// use message_broker::{BrokerPublisher, CloudEvent, Codec, MessagePublisher};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let publisher = BrokerPublisher::new(
///     Arc::new(InMemoryTransport::new()),
///     Arc::new(Codec::json()),
///     "invoices",
/// );
///
/// let event = CloudEvent::create(serde_json::json!({"invoiceId": "X"}), "invoice.created", "urn:billing");
/// publisher.publish(&event, Some("customer-42"), None).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct BrokerPublisher {
    transport: Arc<dyn BrokerTransport>,
    codec: Arc<Codec>,
    topic: String,
}

impl BrokerPublisher {
    pub fn new(transport: Arc<dyn BrokerTransport>, codec: Arc<Codec>, topic: impl Into<String>) -> Self {
        Self {
            transport,
            codec,
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Flush and release the underlying transport
    pub async fn close(&self) -> BrokerResult<()> {
        self.transport.close().await
    }
}

#[async_trait]
impl MessagePublisher for BrokerPublisher {
    async fn publish<T>(
        &self,
        event: &CloudEvent<T>,
        key: Option<&str>,
        headers: Option<&Headers>,
    ) -> BrokerResult<()>
    where
        T: Serialize + Send + Sync,
    {
        let payload = self.codec.encode(event).await.map_err(|e| {
            tracing::error!(event_id = %event.id, event_type = %event.event_type, error = %e, "Failed to encode event");
            e
        })?;

        let message = TransportMessage::new(self.topic.clone(), payload)
            .with_key(key.map(str::to_string))
            .with_headers(headers.cloned().unwrap_or_default());

        self.transport.produce(message).await.map_err(|e| {
            tracing::error!(event_id = %event.id, topic = %self.topic, error = %e, "Failed to publish event");
            e
        })?;

        tracing::debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            topic = %self.topic,
            "Published event"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InMemoryTransport;
    use serde_json::json;

    fn publisher(transport: &InMemoryTransport) -> BrokerPublisher {
        BrokerPublisher::new(Arc::new(transport.handle()), Arc::new(Codec::json()), "invoices")
    }

    #[tokio::test]
    async fn test_publish_sets_key_and_headers() {
        let transport = InMemoryTransport::new();
        let event = CloudEvent::create(json!({"invoiceId": "X"}), "invoice.created", "urn:billing");

        let mut headers = Headers::new();
        headers.insert("trace-id".to_string(), "t-1".to_string());

        publisher(&transport)
            .publish(&event, Some("customer-42"), Some(&headers))
            .await
            .unwrap();

        let sent = transport.messages("invoices").await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].key.as_deref(), Some("customer-42"));
        assert_eq!(sent[0].headers["trace-id"], "t-1");

        let wire: serde_json::Value = serde_json::from_slice(&sent[0].payload).unwrap();
        assert_eq!(wire["id"], event.id);
    }

    #[tokio::test]
    async fn test_publish_batch_keeps_order_and_applies_selector() {
        let transport = InMemoryTransport::new();
        let events: Vec<_> = (0..3)
            .map(|n| CloudEvent::create(json!({"n": n}), "counter.bumped", "urn:test"))
            .collect();

        let selector = |event: &CloudEvent<serde_json::Value>| {
            event.data["n"].as_i64().map(|n| format!("k-{n}"))
        };

        publisher(&transport)
            .publish_batch(&events, Some(&selector))
            .await
            .unwrap();

        let sent = transport.messages("invoices").await;
        let keys: Vec<_> = sent.iter().map(|m| m.key.clone().unwrap()).collect();
        assert_eq!(keys, vec!["k-0", "k-1", "k-2"]);
    }

    #[tokio::test]
    async fn test_empty_batch_sends_nothing() {
        let transport = InMemoryTransport::new();
        let events: Vec<CloudEvent<serde_json::Value>> = Vec::new();

        publisher(&transport).publish_batch(&events, None).await.unwrap();
        assert!(transport.messages("invoices").await.is_empty());
    }

    #[tokio::test]
    async fn test_publish_on_closed_transport_fails() {
        let transport = InMemoryTransport::new();
        let publisher = publisher(&transport);
        publisher.close().await.unwrap();

        let event = CloudEvent::create(json!({}), "t", "s");
        assert!(publisher.publish(&event, None, None).await.is_err());
    }
}

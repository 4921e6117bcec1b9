//! NATS-based implementation of the BrokerTransport trait

use async_nats::{Client, HeaderMap, Subscriber};
use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::Mutex;

use super::{BrokerTransport, TransportMessage};
use crate::config::MessageBrokerSettings;
use crate::envelope::Headers;
use crate::error::{BrokerError, BrokerResult};

/// Header that carries the partition key, NATS has no native message key
pub const KEY_HEADER: &str = "message-key";

/// BrokerTransport implementation using a NATS connection
///
/// The consumer group maps onto a NATS queue group, so several consumers
/// sharing a group id split a subject between them.
///
/// # Example
/// ```rust,no_run
/// use message_broker::transport::{BrokerTransport, NatsTransport, TransportMessage};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = async_nats::connect("nats://localhost:4222").await?;
/// let transport = NatsTransport::new(client).with_queue_group("billing");
///
/// transport
///     .produce(TransportMessage::new("invoices", b"hello".to_vec()))
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct NatsTransport {
    client: Client,
    queue_group: Option<String>,
    subscription: Mutex<Option<Subscriber>>,
}

impl NatsTransport {
    /// Create a new transport from an existing NATS client
    ///
    /// # Arguments
    /// * `client` - An already-connected `async_nats::Client`
    pub fn new(client: Client) -> Self {
        Self {
            client,
            queue_group: None,
            subscription: Mutex::new(None),
        }
    }

    pub fn with_queue_group(mut self, group: impl Into<String>) -> Self {
        self.queue_group = Some(group.into());
        self
    }

    /// Connect using broker settings
    ///
    /// Credentials are sent when a username is configured. The group id
    /// becomes the queue group.
    pub async fn connect(settings: &MessageBrokerSettings) -> BrokerResult<Self> {
        let mut options = async_nats::ConnectOptions::new();
        if let (Some(user), Some(password)) = (&settings.username, &settings.password) {
            options = options.user_and_password(user.clone(), password.clone());
        }

        let client = options
            .connect(settings.bootstrap_servers.as_str())
            .await
            .map_err(|e| BrokerError::Transport(format!("failed to connect to NATS: {e}")))?;

        tracing::info!(
            servers = %settings.bootstrap_servers,
            group_id = %settings.group_id,
            "Connected to NATS"
        );

        Ok(Self::new(client).with_queue_group(settings.group_id.clone()))
    }

    /// Get a reference to the underlying NATS client
    pub fn client(&self) -> &Client {
        &self.client
    }
}

fn to_transport_message(nats_msg: async_nats::Message) -> TransportMessage {
    let mut headers = Headers::new();
    if let Some(nats_headers) = &nats_msg.headers {
        for (name, values) in nats_headers.iter() {
            // Take the first value for each header
            if let Some(value) = values.first() {
                headers.insert(name.to_string(), value.to_string());
            }
        }
    }
    let key = headers.remove(KEY_HEADER);

    TransportMessage::new(nats_msg.subject.to_string(), nats_msg.payload.to_vec())
        .with_key(key)
        .with_headers(headers)
}

#[async_trait]
impl BrokerTransport for NatsTransport {
    async fn subscribe(&self, topic: &str) -> BrokerResult<()> {
        let subscriber = match &self.queue_group {
            Some(group) => {
                self.client
                    .queue_subscribe(topic.to_string(), group.clone())
                    .await
            }
            None => self.client.subscribe(topic.to_string()).await,
        }
        .map_err(|e| BrokerError::Transport(format!("failed to subscribe to {topic}: {e}")))?;

        *self.subscription.lock().await = Some(subscriber);
        Ok(())
    }

    async fn produce(&self, message: TransportMessage) -> BrokerResult<()> {
        let mut headers = HeaderMap::new();
        for (name, value) in &message.headers {
            headers.insert(name.as_str(), value.as_str());
        }
        if let Some(key) = &message.key {
            headers.insert(KEY_HEADER, key.as_str());
        }

        self.client
            .publish_with_headers(message.topic.clone(), headers, message.payload.into())
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;

        // Core NATS has no per-message ack; a flush is the closest delivery report
        self.client
            .flush()
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))
    }

    async fn pull(&self, timeout: Option<Duration>) -> BrokerResult<Option<TransportMessage>> {
        let mut guard = self.subscription.lock().await;
        let subscriber = guard
            .as_mut()
            .ok_or_else(|| BrokerError::Transport("pull called before subscribe".to_string()))?;

        let next = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, subscriber.next()).await {
                Ok(next) => next,
                Err(_) => return Ok(None),
            },
            None => subscriber.next().await,
        };

        next.map(to_transport_message)
            .map(Some)
            .ok_or_else(|| BrokerError::Transport("subscription closed".to_string()))
    }

    async fn close(&self) -> BrokerResult<()> {
        if let Some(mut subscriber) = self.subscription.lock().await.take() {
            subscriber
                .unsubscribe()
                .await
                .map_err(|e| BrokerError::Transport(e.to_string()))?;
        }
        self.client
            .flush()
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))
    }
}

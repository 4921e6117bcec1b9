//! In-memory implementation of the BrokerTransport trait

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::{BrokerTransport, TransportMessage};
use crate::error::{BrokerError, BrokerResult};

/// Append-only per-topic log shared by every handle
#[derive(Default)]
struct Log {
    topics: Mutex<HashMap<String, Vec<TransportMessage>>>,
    appended: Notify,
}

#[derive(Debug)]
struct Cursor {
    topic: String,
    offset: usize,
}

/// BrokerTransport implementation backed by an in-process log
///
/// Useful for:
/// - Unit testing without external dependencies
/// - Local development
/// - Integration tests that need deterministic behavior
///
/// Every topic is an append-only log. A handle subscribes from the earliest
/// message and keeps its own read offset, so two handles over the same log
/// behave like two independent consumer groups.
///
/// # Example
/// ```rust
/// use message_broker::transport::{BrokerTransport, InMemoryTransport, TransportMessage};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let producer = InMemoryTransport::new();
/// let consumer = producer.handle();
///
/// consumer.subscribe("invoices").await?;
/// producer.produce(TransportMessage::new("invoices", b"hello".to_vec())).await?;
///
/// let msg = consumer.pull(None).await?.unwrap();
/// assert_eq!(msg.payload, b"hello");
/// # Ok(())
/// # }
/// ```
pub struct InMemoryTransport {
    log: Arc<Log>,
    cursor: Mutex<Option<Cursor>>,
    closed: AtomicBool,
}

impl InMemoryTransport {
    /// Create a transport over a fresh, empty log
    pub fn new() -> Self {
        Self::over(Arc::new(Log::default()))
    }

    fn over(log: Arc<Log>) -> Self {
        Self {
            log,
            cursor: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// New handle over the same log with its own read offset
    pub fn handle(&self) -> Self {
        Self::over(self.log.clone())
    }

    /// Everything produced to a topic so far, oldest first
    pub async fn messages(&self, topic: &str) -> Vec<TransportMessage> {
        self.log
            .topics
            .lock()
            .await
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    async fn next_message(&self) -> BrokerResult<Option<TransportMessage>> {
        let mut guard = self.cursor.lock().await;
        let cursor = guard
            .as_mut()
            .ok_or_else(|| BrokerError::Transport("pull called before subscribe".to_string()))?;

        let topics = self.log.topics.lock().await;
        let next = topics
            .get(&cursor.topic)
            .and_then(|messages| messages.get(cursor.offset))
            .cloned();

        if next.is_some() {
            cursor.offset += 1;
        }
        Ok(next)
    }

    fn ensure_open(&self) -> BrokerResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Transport("transport is closed".to_string()));
        }
        Ok(())
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerTransport for InMemoryTransport {
    async fn subscribe(&self, topic: &str) -> BrokerResult<()> {
        self.ensure_open()?;
        *self.cursor.lock().await = Some(Cursor {
            topic: topic.to_string(),
            offset: 0,
        });
        tracing::debug!(topic = %topic, "Subscribed to in-memory topic");
        Ok(())
    }

    async fn produce(&self, message: TransportMessage) -> BrokerResult<()> {
        self.ensure_open()?;
        self.log
            .topics
            .lock()
            .await
            .entry(message.topic.clone())
            .or_default()
            .push(message);
        self.log.appended.notify_waiters();
        Ok(())
    }

    async fn pull(&self, timeout: Option<Duration>) -> BrokerResult<Option<TransportMessage>> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            self.ensure_open()?;

            // Register interest before reading so an append between the
            // read and the wait still wakes us.
            let appended = self.log.appended.notified();

            if let Some(message) = self.next_message().await? {
                return Ok(Some(message));
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, appended).await.is_err() {
                        return Ok(None);
                    }
                }
                None => appended.await,
            }
        }
    }

    async fn close(&self) -> BrokerResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.cursor.lock().await.take();
        // Wake blocked pulls so they observe the close
        self.log.appended.notify_waiters();
        Ok(())
    }
}

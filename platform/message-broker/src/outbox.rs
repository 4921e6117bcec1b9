//! Outbox publishing
//!
//! Every envelope is written to a durable store before it is handed to the
//! broker, and marked sent once the broker accepts it. A crash between the
//! two leaves an unsent record behind; a separate relay can replay those
//! from [`OutboxStore::pending`].
//!
//! The store write and the publish are not atomic. The record is saved
//! first so that an event never reaches the broker without a trace.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::codec::Codec;
use crate::config::DatabaseSettings;
use crate::envelope::{CloudEvent, Headers};
use crate::error::{BrokerError, BrokerResult};
use crate::publisher::{KeySelector, MessagePublisher};

/// One saved outgoing message
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct OutboxRecord {
    pub id: String,
    pub topic: String,
    pub key: Option<String>,
    /// Envelope as JSON text
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub last_error: Option<String>,
}

impl OutboxRecord {
    pub fn is_sent(&self) -> bool {
        self.sent_at.is_some()
    }
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Insert a record unless one with this id already exists
    async fn save(&self, id: &str, topic: &str, key: Option<&str>, payload: &[u8]) -> BrokerResult<()>;

    /// Stamp the send time, bump attempts and clear the last error
    async fn mark_sent(&self, id: &str) -> BrokerResult<()>;

    /// Remember why the latest publish attempt failed
    async fn record_failure(&self, id: &str, error: &str) -> BrokerResult<()>;

    /// Unsent records, oldest first
    async fn pending(&self, limit: usize) -> BrokerResult<Vec<OutboxRecord>>;
}

/// Publisher decorator that records every envelope before publishing it
///
/// # Example
/// ```rust
/// use message_broker::transport::InMemoryTransport;
/// use message_broker::{BrokerPublisher, CloudEvent, Codec, InMemoryOutboxStore, MessagePublisher, OutboxPublisher};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let inner = BrokerPublisher::new(Arc::new(InMemoryTransport::new()), Arc::new(Codec::json()), "invoices");
/// let store = Arc::new(InMemoryOutboxStore::new());
/// let publisher = OutboxPublisher::new(inner, store.clone(), "invoices");
///
/// let event = CloudEvent::create(serde_json::json!({"invoiceId": "X"}), "invoice.created", "urn:billing");
/// publisher.publish(&event, None, None).await?;
///
/// assert!(store.get(&event.id).await.unwrap().is_sent());
/// # Ok(())
/// # }
/// ```
pub struct OutboxPublisher<P> {
    inner: P,
    store: Arc<dyn OutboxStore>,
    topic: String,
}

impl<P: MessagePublisher> OutboxPublisher<P> {
    pub fn new(inner: P, store: Arc<dyn OutboxStore>, topic: impl Into<String>) -> Self {
        Self {
            inner,
            store,
            topic: topic.into(),
        }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }
}

#[async_trait]
impl<P: MessagePublisher> MessagePublisher for OutboxPublisher<P> {
    async fn publish<T>(
        &self,
        event: &CloudEvent<T>,
        key: Option<&str>,
        headers: Option<&Headers>,
    ) -> BrokerResult<()>
    where
        T: Serialize + Send + Sync,
    {
        let payload = Codec::encode_text(event)?;
        self.store.save(&event.id, &self.topic, key, &payload).await?;
        tracing::debug!(event_id = %event.id, topic = %self.topic, "Outbox record saved");

        if let Err(e) = self.inner.publish(event, key, headers).await {
            if let Err(store_err) = self.store.record_failure(&event.id, &e.to_string()).await {
                tracing::warn!(
                    event_id = %event.id,
                    error = %store_err,
                    "Failed to record publish failure in outbox"
                );
            }
            tracing::warn!(event_id = %event.id, error = %e, "Publish failed; outbox record left unsent");
            return Err(e);
        }

        self.store.mark_sent(&event.id).await?;
        tracing::debug!(event_id = %event.id, "Outbox record marked sent");
        Ok(())
    }

    /// Delegates without outbox bookkeeping
    async fn publish_batch<T>(
        &self,
        events: &[CloudEvent<T>],
        key_selector: Option<&KeySelector<T>>,
    ) -> BrokerResult<()>
    where
        T: Serialize + Send + Sync,
    {
        self.inner.publish_batch(events, key_selector).await
    }
}

/// Outbox store kept in process memory
#[derive(Default)]
pub struct InMemoryOutboxStore {
    records: Mutex<HashMap<String, OutboxRecord>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: &str) -> Option<OutboxRecord> {
        self.records.lock().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn save(&self, id: &str, topic: &str, key: Option<&str>, payload: &[u8]) -> BrokerResult<()> {
        self.records
            .lock()
            .await
            .entry(id.to_string())
            .or_insert_with(|| OutboxRecord {
                id: id.to_string(),
                topic: topic.to_string(),
                key: key.map(str::to_string),
                payload: payload.to_vec(),
                created_at: Utc::now(),
                sent_at: None,
                attempts: 0,
                last_error: None,
            });
        Ok(())
    }

    async fn mark_sent(&self, id: &str) -> BrokerResult<()> {
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| BrokerError::Store(format!("no outbox record with id {id}")))?;
        record.sent_at = Some(Utc::now());
        record.attempts += 1;
        record.last_error = None;
        Ok(())
    }

    async fn record_failure(&self, id: &str, error: &str) -> BrokerResult<()> {
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| BrokerError::Store(format!("no outbox record with id {id}")))?;
        record.last_error = Some(error.to_string());
        Ok(())
    }

    async fn pending(&self, limit: usize) -> BrokerResult<Vec<OutboxRecord>> {
        let mut unsent: Vec<OutboxRecord> = self
            .records
            .lock()
            .await
            .values()
            .filter(|r| !r.is_sent())
            .cloned()
            .collect();
        unsent.sort_by_key(|r| r.created_at);
        unsent.truncate(limit);
        Ok(unsent)
    }
}

/// Outbox store backed by a Postgres table
#[derive(Debug, Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
    table: String,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool, settings: &DatabaseSettings) -> BrokerResult<Self> {
        Ok(Self {
            pool,
            table: settings.qualified_outbox_table()?,
        })
    }

    /// Open a pool from settings
    pub async fn connect(settings: &DatabaseSettings) -> BrokerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .connect(&settings.connection_string)
            .await?;
        Self::new(pool, settings)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the outbox table if it does not exist
    pub async fn ensure_table(&self) -> BrokerResult<()> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id TEXT PRIMARY KEY,
                topic TEXT NOT NULL,
                key TEXT NULL,
                payload BYTEA NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                sent_at TIMESTAMPTZ NULL,
                attempts INT NOT NULL DEFAULT 0,
                last_error TEXT NULL
            )
            "#,
            self.table
        ))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn save(&self, id: &str, topic: &str, key: Option<&str>, payload: &[u8]) -> BrokerResult<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO {} (id, topic, key, payload)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO NOTHING
            "#,
            self.table
        ))
        .bind(id)
        .bind(topic)
        .bind(key)
        .bind(payload)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_sent(&self, id: &str) -> BrokerResult<()> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE {}
            SET sent_at = now(), attempts = attempts + 1, last_error = NULL
            WHERE id = $1
            "#,
            self.table
        ))
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BrokerError::Store(format!("no outbox record with id {id}")));
        }
        Ok(())
    }

    async fn record_failure(&self, id: &str, error: &str) -> BrokerResult<()> {
        sqlx::query(&format!("UPDATE {} SET last_error = $2 WHERE id = $1", self.table))
            .bind(id)
            .bind(error)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn pending(&self, limit: usize) -> BrokerResult<Vec<OutboxRecord>> {
        let records = sqlx::query_as::<_, OutboxRecord>(&format!(
            r#"
            SELECT id, topic, key, payload, created_at, sent_at, attempts, last_error
            FROM {}
            WHERE sent_at IS NULL
            ORDER BY created_at
            LIMIT $1
            "#,
            self.table
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}

//! Inbox consuming
//!
//! Wraps a consumer so each envelope id reaches the application handler at
//! most once per store. The id is recorded after the handler succeeds in
//! single mode, and before the handler runs in batch mode.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::DatabaseSettings;
use crate::consumer::{BatchHandler, BatchOptions, MessageConsumer, MessageHandler, ReceivedMessage};
use crate::error::BrokerResult;

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct InboxRecord {
    pub message_id: String,
    pub processed_at: DateTime<Utc>,
}

#[async_trait]
pub trait InboxStore: Send + Sync {
    async fn already_processed(&self, message_id: &str) -> BrokerResult<bool>;

    /// Record an id as processed. Recording twice is not an error.
    async fn mark_processed(&self, message_id: &str) -> BrokerResult<()>;
}

/// Consumer decorator that drops envelopes whose id was already processed
///
/// ## Batch mode
///
/// Duplicates are filtered out of each window and every surviving id is
/// marked processed before the batch handler runs. If the handler then
/// fails, those ids are not redelivered to it. The handler is not called
/// when every message in a window was a duplicate.
pub struct InboxConsumer<C> {
    inner: C,
    store: Arc<dyn InboxStore>,
}

impl<C: MessageConsumer> InboxConsumer<C> {
    pub fn new(inner: C, store: Arc<dyn InboxStore>) -> Self {
        Self { inner, store }
    }
}

struct InboxHandler<H> {
    inner: H,
    store: Arc<dyn InboxStore>,
}

#[async_trait]
impl<T, H> MessageHandler<T> for InboxHandler<H>
where
    T: Send + 'static,
    H: MessageHandler<T>,
{
    async fn handle(&self, message: ReceivedMessage<T>) -> BrokerResult<()> {
        let id = message.event.id.clone();

        if self.store.already_processed(&id).await? {
            tracing::info!(event_id = %id, "Duplicate event ignored");
            return Ok(());
        }

        self.inner.handle(message).await?;
        self.store.mark_processed(&id).await?;
        tracing::debug!(event_id = %id, "Event marked as processed");
        Ok(())
    }
}

struct InboxBatchHandler<H> {
    inner: H,
    store: Arc<dyn InboxStore>,
}

#[async_trait]
impl<T, H> BatchHandler<T> for InboxBatchHandler<H>
where
    T: Send + 'static,
    H: BatchHandler<T>,
{
    async fn handle_batch(&self, batch: Vec<ReceivedMessage<T>>) -> BrokerResult<()> {
        let received = batch.len();
        let mut fresh = Vec::with_capacity(received);

        for message in batch {
            if self.store.already_processed(&message.event.id).await? {
                tracing::info!(event_id = %message.event.id, "Duplicate event ignored");
                continue;
            }
            self.store.mark_processed(&message.event.id).await?;
            fresh.push(message);
        }

        if fresh.is_empty() {
            tracing::debug!(received, "Batch contained only duplicates");
            return Ok(());
        }

        self.inner.handle_batch(fresh).await
    }
}

#[async_trait]
impl<C: MessageConsumer> MessageConsumer for InboxConsumer<C> {
    async fn consume<T, H>(&self, handler: H, cancel: CancellationToken) -> BrokerResult<()>
    where
        T: DeserializeOwned + Send + 'static,
        H: MessageHandler<T> + 'static,
    {
        let handler = InboxHandler {
            inner: handler,
            store: self.store.clone(),
        };
        self.inner.consume::<T, _>(handler, cancel).await
    }

    async fn consume_batch<T, H>(
        &self,
        options: BatchOptions,
        handler: H,
        cancel: CancellationToken,
    ) -> BrokerResult<()>
    where
        T: DeserializeOwned + Send + 'static,
        H: BatchHandler<T> + 'static,
    {
        let handler = InboxBatchHandler {
            inner: handler,
            store: self.store.clone(),
        };
        self.inner.consume_batch::<T, _>(options, handler, cancel).await
    }
}

/// Inbox store kept in process memory
#[derive(Default)]
pub struct InMemoryInboxStore {
    records: Mutex<HashMap<String, InboxRecord>>,
}

impl InMemoryInboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<InboxRecord> {
        self.records.lock().await.values().cloned().collect()
    }
}

#[async_trait]
impl InboxStore for InMemoryInboxStore {
    async fn already_processed(&self, message_id: &str) -> BrokerResult<bool> {
        Ok(self.records.lock().await.contains_key(message_id))
    }

    async fn mark_processed(&self, message_id: &str) -> BrokerResult<()> {
        self.records
            .lock()
            .await
            .entry(message_id.to_string())
            .or_insert_with(|| InboxRecord {
                message_id: message_id.to_string(),
                processed_at: Utc::now(),
            });
        Ok(())
    }
}

/// Inbox store backed by a Postgres table
#[derive(Debug, Clone)]
pub struct PgInboxStore {
    pool: PgPool,
    table: String,
}

impl PgInboxStore {
    pub fn new(pool: PgPool, settings: &DatabaseSettings) -> BrokerResult<Self> {
        Ok(Self {
            pool,
            table: settings.qualified_inbox_table()?,
        })
    }

    pub async fn connect(settings: &DatabaseSettings) -> BrokerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .connect(&settings.connection_string)
            .await?;
        Self::new(pool, settings)
    }

    pub async fn ensure_table(&self) -> BrokerResult<()> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                message_id TEXT PRIMARY KEY,
                processed_at TIMESTAMPTZ NOT NULL DEFAULT now()
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
impl InboxStore for PgInboxStore {
    async fn already_processed(&self, message_id: &str) -> BrokerResult<bool> {
        let exists = sqlx::query_scalar::<_, bool>(&format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE message_id = $1)",
            self.table
        ))
        .bind(message_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn mark_processed(&self, message_id: &str) -> BrokerResult<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO {} (message_id)
            VALUES ($1)
            ON CONFLICT (message_id) DO NOTHING
            "#,
            self.table
        ))
        .bind(message_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

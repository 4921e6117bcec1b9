//! # Consumer Loop
//!
//! Long-running subscription loops that decode envelopes and hand them to
//! application handlers, one at a time or in size/time windows.
//!
//! ## Termination
//!
//! A loop ends cleanly when its [`CancellationToken`] fires. It ends with an
//! error on the first transport, decode or handler failure; messages are
//! never skipped silently.
//!
//! ## Batching
//!
//! In batch mode a window opens when the first message is buffered. The
//! buffer is flushed when it reaches `max_batch_size`, or once
//! `max_wait_time` has passed since the window opened. A quiet topic still
//! flushes: every poll that returns nothing re-checks the time budget.
//! Messages still buffered at cancellation are dropped uncommitted and will
//! be redelivered.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::codec::Codec;
use crate::envelope::{CloudEvent, Headers};
use crate::error::{BrokerError, BrokerResult};
use crate::transport::BrokerTransport;

/// Default time a batch poll waits before re-checking the window
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A decoded envelope plus the transport metadata it arrived with
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage<T> {
    pub event: CloudEvent<T>,
    pub key: Option<String>,
    pub headers: Headers,
}

/// Handles one message at a time
#[async_trait]
pub trait MessageHandler<T>: Send + Sync {
    async fn handle(&self, message: ReceivedMessage<T>) -> BrokerResult<()>;
}

#[async_trait]
impl<T, F, Fut> MessageHandler<T> for F
where
    T: Send + 'static,
    F: Fn(ReceivedMessage<T>) -> Fut + Send + Sync,
    Fut: Future<Output = BrokerResult<()>> + Send,
{
    async fn handle(&self, message: ReceivedMessage<T>) -> BrokerResult<()> {
        (self)(message).await
    }
}

/// Handles a window of messages at once
#[async_trait]
pub trait BatchHandler<T>: Send + Sync {
    async fn handle_batch(&self, batch: Vec<ReceivedMessage<T>>) -> BrokerResult<()>;
}

#[async_trait]
impl<T, F, Fut> BatchHandler<T> for F
where
    T: Send + 'static,
    F: Fn(Vec<ReceivedMessage<T>>) -> Fut + Send + Sync,
    Fut: Future<Output = BrokerResult<()>> + Send,
{
    async fn handle_batch(&self, batch: Vec<ReceivedMessage<T>>) -> BrokerResult<()> {
        (self)(batch).await
    }
}

/// Window limits for batch consumption
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOptions {
    pub max_batch_size: usize,
    pub max_wait_time: Duration,
    pub poll_interval: Duration,
}

impl BatchOptions {
    pub fn new(max_batch_size: usize, max_wait_time: Duration) -> Self {
        Self {
            max_batch_size,
            max_wait_time,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn validate(&self) -> BrokerResult<()> {
        if self.max_batch_size == 0 {
            return Err(BrokerError::Configuration(
                "max_batch_size must be at least 1".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(BrokerError::Configuration(
                "poll_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Runs a consume loop until cancelled or failed
#[async_trait]
pub trait MessageConsumer: Send + Sync {
    async fn consume<T, H>(&self, handler: H, cancel: CancellationToken) -> BrokerResult<()>
    where
        T: DeserializeOwned + Send + 'static,
        H: MessageHandler<T> + 'static;

    async fn consume_batch<T, H>(
        &self,
        options: BatchOptions,
        handler: H,
        cancel: CancellationToken,
    ) -> BrokerResult<()>
    where
        T: DeserializeOwned + Send + 'static,
        H: BatchHandler<T> + 'static;
}

/// Consumer that pulls from a transport and decodes with a [`Codec`]
#[derive(Debug, Clone)]
pub struct BrokerConsumer {
    transport: Arc<dyn BrokerTransport>,
    codec: Arc<Codec>,
    topic: String,
}

impl BrokerConsumer {
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

    async fn run_single<T, H>(&self, handler: &H, cancel: &CancellationToken) -> BrokerResult<()>
    where
        T: DeserializeOwned + Send + 'static,
        H: MessageHandler<T>,
    {
        loop {
            let pulled = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                pulled = self.transport.pull(None) => pulled?,
            };
            let Some(raw) = pulled else { continue };

            let message = self.codec.decode_message::<T>(raw).await?;
            let event_id = message.event.id.clone();
            handler.handle(message).await?;
            tracing::trace!(event_id = %event_id, "Message handled");
        }
    }

    async fn run_batch<T, H>(
        &self,
        options: BatchOptions,
        handler: &H,
        cancel: &CancellationToken,
    ) -> BrokerResult<()>
    where
        T: DeserializeOwned + Send + 'static,
        H: BatchHandler<T>,
    {
        let mut buffer: Vec<ReceivedMessage<T>> = Vec::with_capacity(options.max_batch_size);
        let mut window_start = Instant::now();

        loop {
            let pulled = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                pulled = self.transport.pull(Some(options.poll_interval)) => pulled?,
            };

            if let Some(raw) = pulled {
                if buffer.is_empty() {
                    window_start = Instant::now();
                }
                buffer.push(self.codec.decode_message::<T>(raw).await?);
            }

            let window_elapsed = window_start.elapsed() >= options.max_wait_time;
            if !buffer.is_empty() && (buffer.len() >= options.max_batch_size || window_elapsed) {
                let batch = std::mem::replace(
                    &mut buffer,
                    Vec::with_capacity(options.max_batch_size),
                );
                let size = batch.len();
                handler.handle_batch(batch).await?;
                tracing::debug!(topic = %self.topic, batch_size = size, "Batch handled");
            }
        }

        if !buffer.is_empty() {
            tracing::debug!(
                topic = %self.topic,
                discarded = buffer.len(),
                "Cancelled with unflushed messages"
            );
        }
        Ok(())
    }

    /// Log how a loop ended and release the transport
    async fn finish(&self, result: BrokerResult<()>) -> BrokerResult<()> {
        match &result {
            Ok(()) => tracing::info!(topic = %self.topic, "Consumer stopped"),
            Err(e) => tracing::error!(topic = %self.topic, error = %e, "Consumer loop failed"),
        }
        if let Err(e) = self.transport.close().await {
            tracing::warn!(topic = %self.topic, error = %e, "Failed to close transport");
        }
        result
    }
}

#[async_trait]
impl MessageConsumer for BrokerConsumer {
    async fn consume<T, H>(&self, handler: H, cancel: CancellationToken) -> BrokerResult<()>
    where
        T: DeserializeOwned + Send + 'static,
        H: MessageHandler<T> + 'static,
    {
        self.transport.subscribe(&self.topic).await?;
        tracing::info!(topic = %self.topic, "Consumer started");

        let result = self.run_single(&handler, &cancel).await;
        self.finish(result).await
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
        options.validate()?;
        self.transport.subscribe(&self.topic).await?;
        tracing::info!(
            topic = %self.topic,
            max_batch_size = options.max_batch_size,
            max_wait_ms = options.max_wait_time.as_millis() as u64,
            "Batch consumer started"
        );

        let result = self.run_batch(options, &handler, &cancel).await;
        self.finish(result).await
    }
}

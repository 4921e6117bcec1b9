#![allow(dead_code)]

use async_trait::async_trait;
use message_broker::{
    BrokerConsumer, BrokerError, BrokerPublisher, BrokerResult, BrokerTransport, Codec,
    OutboxRecord, OutboxStore, TransportMessage,
};
use message_broker::transport::InMemoryTransport;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const TOPIC: &str = "billing.invoices";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceCreated {
    pub invoice_id: String,
    pub amount: f64,
}

/// Publisher and consumer over one shared in-memory log
pub fn json_pair(transport: &InMemoryTransport) -> (BrokerPublisher, BrokerConsumer) {
    let codec = Arc::new(Codec::json());
    (
        BrokerPublisher::new(Arc::new(transport.handle()), codec.clone(), TOPIC),
        BrokerConsumer::new(Arc::new(transport.handle()), codec, TOPIC),
    )
}

/// Shared, ordered record of calls across test doubles
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

/// Transport that records produces and optionally rejects them
pub struct RecordingTransport {
    pub log: CallLog,
    pub fail: bool,
}

#[async_trait]
impl BrokerTransport for RecordingTransport {
    async fn subscribe(&self, _topic: &str) -> BrokerResult<()> {
        Ok(())
    }

    async fn produce(&self, message: TransportMessage) -> BrokerResult<()> {
        let wire: serde_json::Value = serde_json::from_slice(&message.payload).unwrap();
        self.log.push(format!("produce:{}", wire["id"].as_str().unwrap()));
        if self.fail {
            return Err(BrokerError::Transport("broker unavailable".to_string()));
        }
        Ok(())
    }

    async fn pull(&self, timeout: Option<Duration>) -> BrokerResult<Option<TransportMessage>> {
        if let Some(timeout) = timeout {
            tokio::time::sleep(timeout).await;
        }
        Ok(None)
    }

    async fn close(&self) -> BrokerResult<()> {
        Ok(())
    }
}

/// Outbox store that records every call
pub struct RecordingOutboxStore {
    pub log: CallLog,
}

#[async_trait]
impl OutboxStore for RecordingOutboxStore {
    async fn save(&self, id: &str, _topic: &str, _key: Option<&str>, _payload: &[u8]) -> BrokerResult<()> {
        self.log.push(format!("save:{id}"));
        Ok(())
    }

    async fn mark_sent(&self, id: &str) -> BrokerResult<()> {
        self.log.push(format!("mark_sent:{id}"));
        Ok(())
    }

    async fn record_failure(&self, id: &str, _error: &str) -> BrokerResult<()> {
        self.log.push(format!("record_failure:{id}"));
        Ok(())
    }

    async fn pending(&self, _limit: usize) -> BrokerResult<Vec<OutboxRecord>> {
        Ok(Vec::new())
    }
}

//! Error taxonomy for the messaging layer
//!
//! Every variant names the stage that failed so publish callers and consume
//! loop owners can tell a misconfiguration from a broker outage.

/// Boxed application error returned from message handlers
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur while publishing or consuming messages
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Missing or invalid settings. Never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("no schema for event type '{event_type}': {reason}")]
    SchemaResolution { event_type: String, reason: String },

    #[error("schema registry error: {0}")]
    Registry(String),

    #[error("failed to encode message: {0}")]
    Encode(String),

    #[error("failed to decode message: {0}")]
    Decode(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("record store error: {0}")]
    Store(String),

    #[error("handler failed: {0}")]
    Handler(#[source] HandlerError),
}

impl BrokerError {
    /// Wrap an application error raised inside a message handler
    pub fn handler(error: impl Into<HandlerError>) -> Self {
        BrokerError::Handler(error.into())
    }

    pub(crate) fn schema_resolution(event_type: &str, reason: impl Into<String>) -> Self {
        BrokerError::SchemaResolution {
            event_type: event_type.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<sqlx::Error> for BrokerError {
    fn from(e: sqlx::Error) -> Self {
        BrokerError::Store(e.to_string())
    }
}

/// Result type for messaging operations
pub type BrokerResult<T> = Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_error_keeps_source_message() {
        let err = BrokerError::handler("invoice rejected");
        assert_eq!(err.to_string(), "handler failed: invoice rejected");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_schema_resolution_names_event_type() {
        let err = BrokerError::schema_resolution("invoice.created", "not mapped");
        assert_eq!(
            err.to_string(),
            "no schema for event type 'invoice.created': not mapped"
        );
    }
}

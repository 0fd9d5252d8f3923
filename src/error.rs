//! Error types for a3s-live-event

use thiserror::Error;

/// Errors that can occur in the event bus
#[derive(Debug, Error)]
pub enum EventError {
    /// Misconfiguration: conflicting channel mode, conflicting payload type,
    /// invalid capacity or an unreadable config file
    #[error("Configuration error: {0}")]
    Config(String),

    /// A delivery could not be bound to the subscriber's callback
    #[error("Type mismatch on event type '{event_type}': expected {expected}, got {actual}")]
    TypeMismatch {
        event_type: String,
        expected: String,
        actual: String,
    },

    /// An operation that needs the delivery context was called elsewhere
    #[error("Threading error: '{operation}' must run on the delivery context")]
    Threading { operation: String },

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An internal lock was poisoned by a panicking callback
    #[error("Lock poisoned: {0}")]
    Lock(String),
}

impl EventError {
    pub(crate) fn threading(operation: &str) -> Self {
        EventError::Threading {
            operation: operation.to_string(),
        }
    }
}

/// Result type alias for event bus operations
pub type Result<T> = std::result::Result<T, EventError>;

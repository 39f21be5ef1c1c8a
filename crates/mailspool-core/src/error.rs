//! Error types for the delivery engine.

use thiserror::Error;

use crate::config::ValidationError;

/// Errors that can occur in core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// SMTP protocol library error outside a session (e.g. a bad address).
    #[error("SMTP error: {0}")]
    Smtp(#[from] mailspool_smtp::Error),

    /// Session attempt failed before or between messages.
    #[error("session: {0}")]
    Session(#[source] mailspool_smtp::Error),

    /// Session attempt failed while sending one message.
    #[error("message: {subject}: {source}")]
    Message {
        /// Subject of the message being sent.
        subject: String,
        /// Underlying SMTP error.
        #[source]
        source: mailspool_smtp::Error,
    },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration failed validation.
    #[error("Invalid configuration: {}", join(.0))]
    Validation(Vec<ValidationError>),

    /// The queue is at capacity; the new message was dropped.
    #[error("queue full, message dropped")]
    QueueFull,

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The mailer has been shut down.
    #[error("mailer is shut down")]
    Shutdown,
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("{}: {e}", e.field()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

//! Error types for SMTP operations.

use std::io;
use std::time::Duration;

/// Result type alias for SMTP operations.
pub type Result<T> = std::result::Result<T, Error>;

/// SMTP error types.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error (connect, read, write or socket failure).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// TLS error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Invalid DNS name for TLS.
    #[error("Invalid DNS name: {0}")]
    InvalidDnsName(#[from] rustls::pki_types::InvalidDnsNameError),

    /// Trust anchor material could not be loaded.
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// Malformed reply grammar.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Well-formed reply outside the band expected for the current step.
    #[error("command {step}: {code} {message}")]
    Rejected {
        /// Step that was rejected (e.g. `MAIL FROM`).
        step: &'static str,
        /// Reply code (e.g., 550).
        code: u16,
        /// Reply text from server.
        message: String,
    },

    /// A read or write did not complete in time.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// The session was cancelled while waiting on the server.
    #[error("cancelled")]
    Cancelled,

    /// Invalid state for operation.
    #[error("Invalid state for operation: {0}")]
    InvalidState(String),

    /// Invalid email address.
    #[error("Invalid email address: {0}")]
    InvalidAddress(String),

    /// Lower-level failure attributed to a session step.
    #[error("{step}: {source}")]
    Step {
        /// Step that failed (e.g. `tls handshake`).
        step: &'static str,
        /// Underlying error.
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Creates a rejection from the step and the offending reply.
    #[must_use]
    pub fn rejected(step: &'static str, code: u16, message: impl Into<String>) -> Self {
        Self::Rejected {
            step,
            code,
            message: message.into(),
        }
    }

    /// Attributes this error to a session step, unless it already names one.
    #[must_use]
    pub fn at(self, step: &'static str) -> Self {
        match self {
            Self::Rejected { .. } | Self::Step { .. } => self,
            other => Self::Step {
                step,
                source: Box::new(other),
            },
        }
    }

    /// Returns true if the peer permanently rejected a command (5xx).
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Rejected { code, .. } => (500..600).contains(code),
            Self::Step { source, .. } => source.is_permanent(),
            _ => false,
        }
    }

    /// Returns true if the peer transiently rejected a command (4xx).
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Rejected { code, .. } => (400..500).contains(code),
            Self::Step { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;

    #[test]
    fn rejected_display_names_step() {
        let err = Error::rejected("STARTTLS", 454, "TLS not available");
        assert_eq!(err.to_string(), "command STARTTLS: 454 TLS not available");
        assert!(err.is_transient());
        assert!(!err.is_permanent());
    }

    #[test]
    fn step_wraps_lower_level_errors() {
        let err = Error::Protocol("incomplete reply".into()).at("greeting");
        assert_eq!(err.to_string(), "greeting: Protocol error: incomplete reply");
    }

    #[test]
    fn step_keeps_rejections_as_is() {
        let err = Error::rejected("MAIL FROM", 550, "no").at("message");
        assert!(matches!(err, Error::Rejected { step: "MAIL FROM", .. }));
        assert!(err.is_permanent());
    }

    #[test]
    fn io_errors_are_neither_band() {
        let err = Error::Io(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert!(!err.is_permanent());
        assert!(!err.is_transient());
    }
}

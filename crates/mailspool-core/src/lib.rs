//! # mailspool-core
//!
//! Outbound mail delivery engine.
//!
//! This crate provides:
//! - Configuration (JSON file, builder, validation)
//! - The outbox: a bounded in-memory FIFO of pending messages
//! - The delivery loop that drains the outbox through one SMTP session
//! - The mailer: a single worker task that runs retried session attempts
//!
//! Delivery is ordered and at-least-once: a message leaves the queue only
//! after the server acknowledged its data, so a lost acknowledgement can
//! cause it to be sent again on the next attempt.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod config;
pub mod delivery;
mod error;
pub mod mailer;
pub mod outbox;
mod stats;

pub use config::{MailerConfig, MailerConfigBuilder, Security, ValidationError, ValidationResult};
pub use delivery::{MessageSource, deliver};
pub use error::{Error, Result};
pub use mailer::Mailer;
pub use outbox::{Message, Outbox};
pub use stats::Stats;

//! # mailspool-smtp
//!
//! Async SMTP submission client (RFC 5321) for unattended senders.
//!
//! ## Features
//!
//! - **Strict reply parsing**: CRLF-only lines, multi-line replies, bounded
//!   line length
//! - **Command driver**: one request, one fully consumed reply, with every
//!   request and reply line logged (credentials redacted)
//! - **TLS support**: STARTTLS (port 587) and implicit TLS (port 465),
//!   trust anchors from a PEM bundle or the `webpki-roots` set
//! - **Authentication**: AUTH LOGIN
//! - **Type-state sessions**: a message can only be sent on an
//!   authenticated session
//!
//! ## Quick Start
//!
//! ```ignore
//! use mailspool_smtp::{Address, Security, Session, SessionConfig, TrustAnchors};
//! use mailspool_smtp::connection::create_tls_connector;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> mailspool_smtp::Result<()> {
//!     let config = SessionConfig::builder("smtp.example.com")
//!         .security(Security::StartTls)
//!         .credentials("user@example.com", "password")
//!         .trust(TrustAnchors::WebPki)
//!         .build();
//!     let tls = create_tls_connector(&config.trust)?;
//!
//!     let cancel = CancellationToken::new();
//!     let mut session = Session::establish(&config, &tls, &cancel).await?;
//!
//!     let from = Address::new("sender@example.com")?;
//!     let to = Address::new("recipient@example.com")?;
//!     session.send_mail(&from, &to, "Test", "Hello, World!").await?;
//!
//!     session.quit().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`command`]: SMTP command builders and body encoding
//! - [`connection`]: Stream, command driver, TLS and sessions
//! - [`parser`]: Reply parser
//! - [`types`]: Core SMTP types (addresses, replies)

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod command;
pub mod connection;
mod error;
pub mod parser;
pub mod types;

pub use connection::{
    Authenticated, Client, Expect, Greeted, Security, Session, SessionConfig, SmtpStream,
    TrustAnchors,
};
pub use error::{Error, Result};
pub use types::{Address, Reply, ReplyCode};

//! SMTP connection management: stream, command driver, TLS and sessions.

mod client;
mod config;
mod session;
mod stream;
mod tls;

pub use client::{Client, Expect};
pub use config::{DEFAULT_CLIENT_NAME, DEFAULT_PORT, Security, SessionConfig, SessionConfigBuilder};
pub use session::{Authenticated, Greeted, Session};
pub use stream::{MAX_LINE_LENGTH, SmtpStream, connect};
pub use tls::{TrustAnchors, create_tls_connector};

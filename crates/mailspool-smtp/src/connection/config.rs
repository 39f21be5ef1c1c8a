//! Session configuration types.

use std::fmt;
use std::time::Duration;

use super::tls::TrustAnchors;

/// Default submission port.
pub const DEFAULT_PORT: u16 = 587;

/// Name sent with EHLO unless configured otherwise.
pub const DEFAULT_CLIENT_NAME: &str = "mailspool";

/// Connection security mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Security {
    /// Plaintext for the whole session. **Only for local relays and tests.**
    None,
    /// Start with plaintext, upgrade with STARTTLS (port 587).
    #[default]
    StartTls,
    /// TLS from the start (port 465).
    Implicit,
}

impl Security {
    /// Returns the default port for this security mode.
    #[must_use]
    pub const fn default_port(self) -> u16 {
        match self {
            Self::None => 25,
            Self::StartTls => DEFAULT_PORT,
            Self::Implicit => 465,
        }
    }

    /// Returns the configuration name of this mode.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::StartTls => "starttls",
            Self::Implicit => "implicit",
        }
    }
}

impl fmt::Display for Security {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a single session attempt needs to reach and log in to the server.
#[derive(Clone)]
pub struct SessionConfig {
    /// Server hostname (also the TLS server name).
    pub host: String,
    /// Server port.
    pub port: u16,
    /// AUTH LOGIN username.
    pub username: String,
    /// AUTH LOGIN password.
    pub password: String,
    /// Name announced with EHLO.
    pub client_name: String,
    /// Security mode.
    pub security: Security,
    /// Certificates used to verify the server.
    pub trust: TrustAnchors,
    /// Connection timeout (DNS resolution included).
    pub connect_timeout: Duration,
    /// Timeout for each write and each reply.
    pub command_timeout: Duration,
}

// Hand-written so the password never reaches a log line.
impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &crate::command::REDACTED)
            .field("client_name", &self.client_name)
            .field("security", &self.security)
            .field("trust", &self.trust)
            .field("connect_timeout", &self.connect_timeout)
            .field("command_timeout", &self.command_timeout)
            .finish()
    }
}

impl SessionConfig {
    /// Creates a configuration with STARTTLS on port 587 and no peer verification.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self::builder(host).build()
    }

    /// Creates a configuration builder.
    #[must_use]
    pub fn builder(host: impl Into<String>) -> SessionConfigBuilder {
        SessionConfigBuilder::new(host)
    }
}

/// Builder for session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfigBuilder {
    host: String,
    port: Option<u16>,
    username: String,
    password: String,
    client_name: String,
    security: Security,
    trust: TrustAnchors,
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl SessionConfigBuilder {
    /// Creates a new builder with the given hostname.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: None,
            username: String::new(),
            password: String::new(),
            client_name: DEFAULT_CLIENT_NAME.to_string(),
            security: Security::StartTls,
            trust: TrustAnchors::None,
            connect_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(60),
        }
    }

    /// Sets the port.
    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Sets the credentials.
    #[must_use]
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// Sets the name announced with EHLO.
    #[must_use]
    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = name.into();
        self
    }

    /// Sets the security mode.
    #[must_use]
    pub const fn security(mut self, security: Security) -> Self {
        self.security = security;
        self
    }

    /// Sets the trust anchors.
    #[must_use]
    pub fn trust(mut self, trust: TrustAnchors) -> Self {
        self.trust = trust;
        self
    }

    /// Sets the connection timeout.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the per-command timeout.
    #[must_use]
    pub const fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> SessionConfig {
        SessionConfig {
            host: self.host,
            port: self.port.unwrap_or_else(|| self.security.default_port()),
            username: self.username,
            password: self.password,
            client_name: self.client_name,
            security: self.security,
            trust: self.trust,
            connect_timeout: self.connect_timeout,
            command_timeout: self.command_timeout,
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
    fn test_default_ports() {
        assert_eq!(Security::None.default_port(), 25);
        assert_eq!(Security::StartTls.default_port(), 587);
        assert_eq!(Security::Implicit.default_port(), 465);
    }

    #[test]
    fn test_config_new() {
        let config = SessionConfig::new("smtp.example.com");
        assert_eq!(config.host, "smtp.example.com");
        assert_eq!(config.port, 587);
        assert_eq!(config.security, Security::StartTls);
        assert_eq!(config.client_name, "mailspool");
        assert!(matches!(config.trust, TrustAnchors::None));
    }

    #[test]
    fn test_config_builder() {
        let config = SessionConfig::builder("smtp.example.com")
            .security(Security::Implicit)
            .credentials("user", "secret")
            .client_name("garage-door")
            .connect_timeout(Duration::from_secs(10))
            .build();

        assert_eq!(config.port, 465);
        assert_eq!(config.username, "user");
        assert_eq!(config.client_name, "garage-door");
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_explicit_port_wins() {
        let config = SessionConfig::builder("smtp.example.com")
            .security(Security::Implicit)
            .port(2465)
            .build();
        assert_eq!(config.port, 2465);
    }

    #[test]
    fn test_debug_hides_password() {
        let config = SessionConfig::builder("smtp.example.com")
            .credentials("user", "hunter2")
            .build();
        let debug = format!("{config:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));
    }
}

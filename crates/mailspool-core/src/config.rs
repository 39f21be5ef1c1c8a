//! Mailer configuration: file format, builder and validation.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use mailspool_smtp::connection::DEFAULT_CLIENT_NAME;
use mailspool_smtp::{Address, SessionConfig, TrustAnchors};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Default queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 8;

/// Default pause between session attempts, in seconds.
pub const DEFAULT_RETRY_INTERVAL_SECS: f64 = 60.0;

/// Default task name, used to tag the worker's log lines.
pub const DEFAULT_TASK_NAME: &str = "smtp";

/// Security/encryption mode for the SMTP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Security {
    /// STARTTLS upgrade after plaintext connect.
    #[default]
    StartTls,
    /// Implicit TLS (connect directly with TLS).
    Implicit,
    /// No encryption. Local relays and tests only.
    None,
}

impl Security {
    /// Get display name for the security mode.
    #[must_use]
    pub const fn display_name(&self) -> &'static str {
        match self {
            Self::StartTls => "STARTTLS",
            Self::Implicit => "SSL/TLS",
            Self::None => "None (insecure)",
        }
    }
}

impl From<Security> for mailspool_smtp::Security {
    fn from(security: Security) -> Self {
        match security {
            Security::StartTls => Self::StartTls,
            Security::Implicit => Self::Implicit,
            Security::None => Self::None,
        }
    }
}

/// Mailer configuration, as stored in the JSON configuration file.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MailerConfig {
    /// Server hostname.
    pub server: String,
    /// Server port. Defaults to the security mode's port (587 for STARTTLS).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Username for AUTH LOGIN.
    pub username: String,
    /// Password for AUTH LOGIN.
    pub password: String,
    /// Envelope sender and `From` header.
    pub from: String,
    /// Default recipient.
    pub to: String,
    /// Use STARTTLS (true) or implicit TLS (false) when `security` is unset.
    pub starttls: bool,
    /// Security mode; overrides `starttls`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security: Option<Security>,
    /// CA certificates as PEM text, or the path of a PEM file.
    pub cas: String,
    /// Verify against the bundled Mozilla root set when `cas` is empty.
    pub webpki_roots: bool,
    /// Name announced with EHLO.
    pub client_name: String,
    /// Maximum number of queued messages.
    pub queue_capacity: usize,
    /// Pause between session attempts, in seconds.
    pub retry_interval_secs: f64,
    /// Connection timeout, in seconds.
    pub connect_timeout_secs: u64,
    /// Per-command timeout, in seconds.
    pub command_timeout_secs: u64,
    /// Name of the worker, recorded on its log lines.
    pub task_name: String,
    /// Accepted for compatibility; the tokio runtime schedules the worker.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_priority: Option<u8>,
}

impl Default for MailerConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            port: None,
            username: String::new(),
            password: String::new(),
            from: String::new(),
            to: String::new(),
            starttls: true,
            security: None,
            cas: String::new(),
            webpki_roots: false,
            client_name: DEFAULT_CLIENT_NAME.to_string(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            retry_interval_secs: DEFAULT_RETRY_INTERVAL_SECS,
            connect_timeout_secs: 30,
            command_timeout_secs: 60,
            task_name: DEFAULT_TASK_NAME.to_string(),
            task_priority: None,
        }
    }
}

// Hand-written so the password never reaches a log line.
impl fmt::Debug for MailerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailerConfig")
            .field("server", &self.server)
            .field("port", &self.port())
            .field("username", &self.username)
            .field("password", &mailspool_smtp::command::REDACTED)
            .field("from", &self.from)
            .field("to", &self.to)
            .field("security", &self.security())
            .field("cas", &if self.cas.trim().is_empty() { "" } else { "<set>" })
            .field("webpki_roots", &self.webpki_roots)
            .field("client_name", &self.client_name)
            .field("queue_capacity", &self.queue_capacity)
            .field("retry_interval_secs", &self.retry_interval_secs)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("command_timeout_secs", &self.command_timeout_secs)
            .field("task_name", &self.task_name)
            .finish_non_exhaustive()
    }
}

impl MailerConfig {
    /// Creates a configuration builder.
    #[must_use]
    pub fn builder(server: impl Into<String>) -> MailerConfigBuilder {
        MailerConfigBuilder::new(server)
    }

    /// Loads a configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Saves the configuration as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Returns the effective security mode.
    #[must_use]
    pub fn security(&self) -> Security {
        self.security.unwrap_or(if self.starttls {
            Security::StartTls
        } else {
            Security::Implicit
        })
    }

    /// Returns the effective port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
            .unwrap_or_else(|| mailspool_smtp::Security::from(self.security()).default_port())
    }

    /// Returns the pause between session attempts.
    ///
    /// Only meaningful for a validated configuration.
    #[must_use]
    pub fn retry_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.retry_interval_secs).unwrap_or(Duration::ZERO)
    }

    /// Checks every field and reports all problems at once.
    ///
    /// # Errors
    ///
    /// Returns the list of validation errors.
    pub fn validate(&self) -> ValidationResult {
        let mut errors = Vec::new();

        if self.server.trim().is_empty() {
            errors.push(ValidationError::EmptyServer);
        }
        if self.port == Some(0) {
            errors.push(ValidationError::InvalidPort);
        }
        if self.username.trim().is_empty() {
            errors.push(ValidationError::EmptyUsername);
        }
        if self.password.is_empty() {
            errors.push(ValidationError::EmptyPassword);
        }

        if self.from.trim().is_empty() {
            errors.push(ValidationError::EmptySender);
        } else if Address::new(self.from.trim()).is_err() {
            errors.push(ValidationError::InvalidSender);
        }
        if self.to.trim().is_empty() {
            errors.push(ValidationError::EmptyRecipient);
        } else if Address::new(self.to.trim()).is_err() {
            errors.push(ValidationError::InvalidRecipient);
        }

        if self.client_name.trim().is_empty() {
            errors.push(ValidationError::EmptyClientName);
        }
        if self.queue_capacity == 0 {
            errors.push(ValidationError::InvalidQueueCapacity);
        }
        if !self.retry_interval_secs.is_finite() || self.retry_interval_secs < 0.0 {
            errors.push(ValidationError::InvalidRetryInterval);
        }
        if self.connect_timeout_secs == 0 || self.command_timeout_secs == 0 {
            errors.push(ValidationError::InvalidTimeout);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Returns the envelope sender.
    ///
    /// # Errors
    ///
    /// Returns an error if `from` is not a valid address.
    pub fn sender(&self) -> Result<Address> {
        Ok(Address::new(self.from.trim())?)
    }

    /// Returns the default recipient.
    ///
    /// # Errors
    ///
    /// Returns an error if `to` is not a valid address.
    pub fn recipient(&self) -> Result<Address> {
        Ok(Address::new(self.to.trim())?)
    }

    /// Resolves the trust anchors.
    ///
    /// `cas` naming a readable file means that file's contents; anything
    /// else is taken as PEM text. An empty `cas` falls back to the Mozilla
    /// roots if `webpki_roots` is set and to no verification otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if the PEM material is unusable.
    pub fn trust_anchors(&self) -> Result<TrustAnchors> {
        let cas = self.cas.trim();
        if cas.is_empty() {
            return Ok(if self.webpki_roots {
                TrustAnchors::WebPki
            } else {
                TrustAnchors::None
            });
        }

        let path = Path::new(cas);
        let pem = if path.is_file() {
            debug!(path = %path.display(), "loading CA certificates from file");
            std::fs::read_to_string(path)?
        } else {
            cas.to_string()
        };
        Ok(TrustAnchors::from_pem(&pem)?)
    }

    /// Builds the per-attempt session configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the trust anchors cannot be resolved.
    pub fn session_config(&self) -> Result<SessionConfig> {
        Ok(SessionConfig::builder(self.server.trim())
            .port(self.port())
            .credentials(self.username.trim(), self.password.as_str())
            .client_name(self.client_name.trim())
            .security(self.security().into())
            .trust(self.trust_anchors()?)
            .connect_timeout(Duration::from_secs(self.connect_timeout_secs))
            .command_timeout(Duration::from_secs(self.command_timeout_secs))
            .build())
    }
}

/// Builder for mailer configuration.
#[derive(Debug, Clone)]
pub struct MailerConfigBuilder {
    config: MailerConfig,
}

impl MailerConfigBuilder {
    /// Creates a new builder with the given server hostname.
    #[must_use]
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            config: MailerConfig {
                server: server.into(),
                ..MailerConfig::default()
            },
        }
    }

    /// Sets the port.
    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.config.port = Some(port);
        self
    }

    /// Sets the credentials.
    #[must_use]
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.username = username.into();
        self.config.password = password.into();
        self
    }

    /// Sets the sender address.
    #[must_use]
    pub fn from(mut self, from: impl Into<String>) -> Self {
        self.config.from = from.into();
        self
    }

    /// Sets the default recipient.
    #[must_use]
    pub fn to(mut self, to: impl Into<String>) -> Self {
        self.config.to = to.into();
        self
    }

    /// Sets the security mode.
    #[must_use]
    pub const fn security(mut self, security: Security) -> Self {
        self.config.security = Some(security);
        self
    }

    /// Sets the CA certificates (PEM text or file path).
    #[must_use]
    pub fn cas(mut self, cas: impl Into<String>) -> Self {
        self.config.cas = cas.into();
        self
    }

    /// Verifies against the Mozilla root set when no CA is configured.
    #[must_use]
    pub const fn webpki_roots(mut self, enabled: bool) -> Self {
        self.config.webpki_roots = enabled;
        self
    }

    /// Sets the name announced with EHLO.
    #[must_use]
    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.config.client_name = name.into();
        self
    }

    /// Sets the queue capacity.
    #[must_use]
    pub const fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    /// Sets the pause between session attempts.
    #[must_use]
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.config.retry_interval_secs = interval.as_secs_f64();
        self
    }

    /// Sets the connection timeout, rounded up to whole seconds.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout_secs = whole_secs(timeout);
        self
    }

    /// Sets the per-command timeout, rounded up to whole seconds.
    #[must_use]
    pub const fn command_timeout(mut self, timeout: Duration) -> Self {
        self.config.command_timeout_secs = whole_secs(timeout);
        self
    }

    /// Sets the task name.
    #[must_use]
    pub fn task_name(mut self, name: impl Into<String>) -> Self {
        self.config.task_name = name.into();
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> MailerConfig {
        self.config
    }
}

const fn whole_secs(duration: Duration) -> u64 {
    if duration.subsec_nanos() > 0 {
        duration.as_secs().saturating_add(1)
    } else {
        duration.as_secs()
    }
}

/// Validation error for mailer configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Server hostname is empty.
    EmptyServer,
    /// Port is zero.
    InvalidPort,
    /// Username is empty.
    EmptyUsername,
    /// Password is empty.
    EmptyPassword,
    /// Sender address is empty.
    EmptySender,
    /// Sender address is malformed.
    InvalidSender,
    /// Default recipient is empty.
    EmptyRecipient,
    /// Default recipient is malformed.
    InvalidRecipient,
    /// EHLO name is empty.
    EmptyClientName,
    /// Queue capacity is zero.
    InvalidQueueCapacity,
    /// Retry interval is negative or not a number.
    InvalidRetryInterval,
    /// A timeout is zero.
    InvalidTimeout,
}

impl ValidationError {
    /// Get human-readable error message.
    #[must_use]
    pub const fn message(&self) -> &'static str {
        match self {
            Self::EmptyServer => "SMTP server is required",
            Self::InvalidPort => "port must be 1-65535",
            Self::EmptyUsername => "username is required",
            Self::EmptyPassword => "password is required",
            Self::EmptySender => "sender address is required",
            Self::InvalidSender => "invalid sender address",
            Self::EmptyRecipient => "recipient address is required",
            Self::InvalidRecipient => "invalid recipient address",
            Self::EmptyClientName => "client name is required",
            Self::InvalidQueueCapacity => "queue capacity must be at least 1",
            Self::InvalidRetryInterval => "retry interval must be a non-negative number",
            Self::InvalidTimeout => "timeouts must be at least one second",
        }
    }

    /// Get the field name this error relates to.
    #[must_use]
    pub const fn field(&self) -> &'static str {
        match self {
            Self::EmptyServer => "server",
            Self::InvalidPort => "port",
            Self::EmptyUsername => "username",
            Self::EmptyPassword => "password",
            Self::EmptySender | Self::InvalidSender => "from",
            Self::EmptyRecipient | Self::InvalidRecipient => "to",
            Self::EmptyClientName => "client_name",
            Self::InvalidQueueCapacity => "queue_capacity",
            Self::InvalidRetryInterval => "retry_interval_secs",
            Self::InvalidTimeout => "timeout",
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for ValidationError {}

/// Result of validating a configuration.
pub type ValidationResult = std::result::Result<(), Vec<ValidationError>>;

impl From<Vec<ValidationError>> for Error {
    fn from(errors: Vec<ValidationError>) -> Self {
        Self::Validation(errors)
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

    fn valid() -> MailerConfig {
        MailerConfig::builder("smtp.example.com")
            .credentials("door", "hunter2")
            .from("door@example.com")
            .to("owner@example.com")
            .build()
    }

    #[test]
    fn test_defaults() {
        let config = MailerConfig::default();
        assert_eq!(config.port(), 587);
        assert_eq!(config.security(), Security::StartTls);
        assert_eq!(config.queue_capacity, 8);
        assert_eq!(config.retry_interval(), Duration::from_secs(60));
        assert_eq!(config.client_name, "mailspool");
        assert_eq!(config.task_name, "smtp");
    }

    #[test]
    fn test_starttls_false_means_implicit_tls() {
        let config: MailerConfig =
            serde_json::from_str(r#"{"server": "smtp.example.com", "starttls": false}"#).unwrap();
        assert_eq!(config.security(), Security::Implicit);
        assert_eq!(config.port(), 465);
    }

    #[test]
    fn test_security_overrides_starttls() {
        let config: MailerConfig =
            serde_json::from_str(r#"{"starttls": false, "security": "none", "port": 2525}"#)
                .unwrap();
        assert_eq!(config.security(), Security::None);
        assert_eq!(config.port(), 2525);
    }

    #[test]
    fn test_task_priority_is_accepted() {
        let config: MailerConfig =
            serde_json::from_str(r#"{"task_name": "mail", "task_priority": 5}"#).unwrap();
        assert_eq!(config.task_name, "mail");
        assert_eq!(config.task_priority, Some(5));
    }

    #[test]
    fn test_validate_ok() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_validate_empty_config() {
        let errors = MailerConfig::default().validate().unwrap_err();
        assert!(errors.contains(&ValidationError::EmptyServer));
        assert!(errors.contains(&ValidationError::EmptyUsername));
        assert!(errors.contains(&ValidationError::EmptyPassword));
        assert!(errors.contains(&ValidationError::EmptySender));
        assert!(errors.contains(&ValidationError::EmptyRecipient));
    }

    #[test]
    fn test_validate_bad_values() {
        let mut config = valid();
        config.port = Some(0);
        config.from = "not an address".into();
        config.queue_capacity = 0;
        config.retry_interval_secs = -1.0;

        let errors = config.validate().unwrap_err();
        assert_eq!(
            errors,
            vec![
                ValidationError::InvalidPort,
                ValidationError::InvalidSender,
                ValidationError::InvalidQueueCapacity,
                ValidationError::InvalidRetryInterval,
            ]
        );
    }

    #[test]
    fn test_validation_error_display() {
        let err = Error::from(vec![ValidationError::EmptyServer, ValidationError::EmptySender]);
        assert_eq!(
            err.to_string(),
            "Invalid configuration: server: SMTP server is required, from: sender address is required"
        );
    }

    #[test]
    fn test_trust_anchors_fallbacks() {
        let mut config = valid();
        assert!(matches!(config.trust_anchors().unwrap(), TrustAnchors::None));

        config.webpki_roots = true;
        assert!(matches!(config.trust_anchors().unwrap(), TrustAnchors::WebPki));
    }

    #[test]
    fn test_trust_anchors_bad_pem() {
        let config = MailerConfig {
            cas: "-----BEGIN NOTHING-----".into(),
            ..valid()
        };
        assert!(config.trust_anchors().is_err());
    }

    #[test]
    fn test_session_config() {
        let config = MailerConfig::builder(" smtp.example.com ")
            .credentials("door", "hunter2")
            .security(Security::Implicit)
            .command_timeout(Duration::from_secs(5))
            .build();
        let session = config.session_config().unwrap();

        assert_eq!(session.host, "smtp.example.com");
        assert_eq!(session.port, 465);
        assert_eq!(session.security, mailspool_smtp::Security::Implicit);
        assert_eq!(session.command_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_sub_second_timeouts_round_up() {
        let config = MailerConfig::builder("smtp.example.com")
            .credentials("door", "hunter2")
            .from("door@example.com")
            .to("owner@example.com")
            .connect_timeout(Duration::from_millis(200))
            .command_timeout(Duration::from_millis(1500))
            .build();

        assert_eq!(config.connect_timeout_secs, 1);
        assert_eq!(config.command_timeout_secs, 2);
        assert!(config.validate().is_ok());

        let config = MailerConfig::builder("smtp.example.com")
            .connect_timeout(Duration::from_secs(10))
            .build();
        assert_eq!(config.connect_timeout_secs, 10);
    }

    #[test]
    fn test_debug_hides_password() {
        let debug = format!("{:?}", valid());
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_json_round_trip_keeps_fields() {
        let config = valid();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"server\":\"smtp.example.com\""));
        assert_eq!(serde_json::from_str::<MailerConfig>(&json).unwrap(), config);
    }
}

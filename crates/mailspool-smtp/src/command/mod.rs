//! SMTP command builder.

use base64::Engine;

use crate::types::Address;

/// Placeholder logged instead of a secret request line.
pub const REDACTED: &str = "<redacted>";

/// SMTP command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// EHLO - Extended greeting
    Ehlo {
        /// Client hostname
        hostname: String,
    },
    /// STARTTLS - Upgrade to TLS
    StartTls,
    /// AUTH LOGIN - Begin LOGIN authentication
    AuthLogin,
    /// Base64 response line sent after an AUTH LOGIN challenge
    AuthResponse {
        /// Already-encoded credential
        encoded: String,
        /// Whether the line must be kept out of logs
        secret: bool,
    },
    /// MAIL FROM - Start mail transaction
    MailFrom {
        /// Sender address
        from: Address,
    },
    /// RCPT TO - Add recipient
    RcptTo {
        /// Recipient address
        to: Address,
    },
    /// DATA - Begin message data
    Data,
    /// End of message data (`CRLF . CRLF`)
    EndOfData,
    /// QUIT - Close connection
    Quit,
}

impl Command {
    /// Builds the AUTH LOGIN response carrying the username.
    #[must_use]
    pub fn username(username: &str) -> Self {
        Self::AuthResponse {
            encoded: encode_credential(username),
            secret: false,
        }
    }

    /// Builds the AUTH LOGIN response carrying the password.
    #[must_use]
    pub fn password(password: &str) -> Self {
        Self::AuthResponse {
            encoded: encode_credential(password),
            secret: true,
        }
    }

    /// Serializes the command to bytes.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();

        match self {
            Self::Ehlo { hostname } => {
                buf.extend_from_slice(b"EHLO ");
                buf.extend_from_slice(hostname.as_bytes());
            }
            Self::StartTls => {
                buf.extend_from_slice(b"STARTTLS");
            }
            Self::AuthLogin => {
                buf.extend_from_slice(b"AUTH LOGIN");
            }
            Self::AuthResponse { encoded, .. } => {
                buf.extend_from_slice(encoded.as_bytes());
            }
            Self::MailFrom { from } => {
                buf.extend_from_slice(b"MAIL FROM:<");
                buf.extend_from_slice(from.as_str().as_bytes());
                buf.push(b'>');
            }
            Self::RcptTo { to } => {
                buf.extend_from_slice(b"RCPT TO:<");
                buf.extend_from_slice(to.as_str().as_bytes());
                buf.push(b'>');
            }
            Self::Data => {
                buf.extend_from_slice(b"DATA");
            }
            Self::EndOfData => {
                // the leading CRLF ends the last body line
                buf.extend_from_slice(b"\r\n.");
            }
            Self::Quit => {
                buf.extend_from_slice(b"QUIT");
            }
        }

        buf.extend_from_slice(b"\r\n");
        buf
    }

    /// Returns the form of this command that may be written to logs.
    #[must_use]
    pub fn log_line(&self) -> Option<&'static str> {
        match self {
            Self::AuthResponse { secret: true, .. } => Some(REDACTED),
            _ => None,
        }
    }

    /// Short name used to attribute a failed reply to this command.
    #[must_use]
    pub const fn step(&self) -> &'static str {
        match self {
            Self::Ehlo { .. } => "EHLO",
            Self::StartTls => "STARTTLS",
            Self::AuthLogin => "AUTH LOGIN",
            Self::AuthResponse { secret: false, .. } => "AUTH LOGIN username",
            Self::AuthResponse { secret: true, .. } => "AUTH LOGIN password",
            Self::MailFrom { .. } => "MAIL FROM",
            Self::RcptTo { .. } => "RCPT TO",
            Self::Data => "DATA",
            Self::EndOfData => "DATA end",
            Self::Quit => "QUIT",
        }
    }
}

/// Base64-encodes a credential for AUTH LOGIN.
#[must_use]
pub fn encode_credential(value: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(value.as_bytes())
}

/// Normalizes body line endings to CRLF and byte-stuffs lines starting with `.`.
///
/// The result does not end with CRLF unless the body ended with a newline;
/// [`Command::EndOfData`] supplies the final line break.
#[must_use]
pub fn encode_body(body: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 16);
    for (i, line) in body.split('\n').enumerate() {
        if i > 0 {
            out.extend_from_slice(b"\r\n");
        }
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.starts_with('.') {
            out.push(b'.');
        }
        out.extend_from_slice(line.as_bytes());
    }
    out
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
    fn test_ehlo_command() {
        let cmd = Command::Ehlo {
            hostname: "mailspool".to_string(),
        };
        assert_eq!(cmd.serialize(), b"EHLO mailspool\r\n");
    }

    #[test]
    fn test_starttls_command() {
        assert_eq!(Command::StartTls.serialize(), b"STARTTLS\r\n");
    }

    #[test]
    fn test_auth_login_sequence() {
        assert_eq!(Command::AuthLogin.serialize(), b"AUTH LOGIN\r\n");
        assert_eq!(Command::username("user").serialize(), b"dXNlcg==\r\n");
        assert_eq!(Command::password("pass").serialize(), b"cGFzcw==\r\n");
    }

    #[test]
    fn test_credential_known_vector() {
        assert_eq!(encode_credential("user"), "dXNlcg==");
        assert_eq!(encode_credential(""), "");
    }

    #[test]
    fn test_password_is_redacted() {
        assert_eq!(Command::password("hunter2").log_line(), Some(REDACTED));
        assert_eq!(Command::username("user").log_line(), None);
        assert_eq!(Command::Quit.log_line(), None);
    }

    #[test]
    fn test_mail_from_rcpt_to() {
        let from = Command::MailFrom {
            from: Address::new("sender@example.com").unwrap(),
        };
        assert_eq!(from.serialize(), b"MAIL FROM:<sender@example.com>\r\n");
        let to = Command::RcptTo {
            to: Address::new("recipient@example.com").unwrap(),
        };
        assert_eq!(to.serialize(), b"RCPT TO:<recipient@example.com>\r\n");
    }

    #[test]
    fn test_data_and_end_of_data() {
        assert_eq!(Command::Data.serialize(), b"DATA\r\n");
        assert_eq!(Command::EndOfData.serialize(), b"\r\n.\r\n");
        assert_eq!(Command::Quit.serialize(), b"QUIT\r\n");
    }

    #[test]
    fn test_steps() {
        assert_eq!(Command::StartTls.step(), "STARTTLS");
        assert_eq!(Command::password("x").step(), "AUTH LOGIN password");
        assert_eq!(Command::EndOfData.step(), "DATA end");
    }

    #[test]
    fn test_encode_body_normalizes_and_stuffs() {
        assert_eq!(encode_body("hello"), b"hello");
        assert_eq!(encode_body("a\nb"), b"a\r\nb");
        assert_eq!(encode_body("a\r\nb"), b"a\r\nb");
        assert_eq!(encode_body(".\n..x"), b"..\r\n...x");
        assert_eq!(encode_body(""), b"");
    }
}

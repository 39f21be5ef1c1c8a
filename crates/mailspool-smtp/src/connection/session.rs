//! Session negotiation and mail transactions.
//!
//! ```text
//!  connect ──► [plaintext greeting + EHLO + STARTTLS] ──► TLS handshake
//!          └─────────────── implicit TLS ──────────────►       │
//!                                                              ▼
//!                          AUTH LOGIN ◄── [greeting] + EHLO ◄──┘
//!                              │
//!                              ▼
//!              Session<Authenticated> ── send_mail()* ── quit()
//! ```
//!
//! Every step either succeeds or aborts the attempt with an error naming
//! the step. Nothing is retried here.
//!
//! The cancellation token given to [`Session::establish`] ends whatever the
//! session is waiting on; the connection is then closed the same way as
//! after any other error, TLS `close_notify` included.

use std::marker::PhantomData;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::client::{Client, Expect};
use super::config::{Security, SessionConfig};
use super::stream::{SmtpStream, connect};
use crate::command::{Command, encode_body};
use crate::error::{Error, Result};
use crate::types::Address;

/// Type-state marker for a greeted connection (EHLO done).
#[derive(Debug)]
pub struct Greeted;

/// Type-state marker for an authenticated connection.
#[derive(Debug)]
pub struct Authenticated;

/// SMTP session with type-state pattern.
#[derive(Debug)]
pub struct Session<State, S = TcpStream> {
    client: Client<S>,
    _state: PhantomData<State>,
}

impl<State, S> Session<State, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Returns true if the session is TLS-encrypted.
    #[must_use]
    pub const fn is_tls(&self) -> bool {
        self.client.is_tls()
    }

    /// Tears the connection down without QUIT, sending TLS `close_notify`
    /// if encrypted.
    pub async fn close(self) {
        self.client.close().await;
    }
}

impl Session<Authenticated> {
    /// Connects to the configured server and negotiates an authenticated session.
    ///
    /// # Errors
    ///
    /// Returns an error naming the failing step, or [`Error::Cancelled`]
    /// under that step once `cancel` fires.
    pub async fn establish(
        config: &SessionConfig,
        tls: &TlsConnector,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let stream = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled),
            stream = connect(&config.host, config.port, config.connect_timeout) => stream,
        }
        .map_err(|e| e.at("connect"))?;
        Self::negotiate(stream, config, tls, cancel).await
    }
}

impl<S> Session<Greeted, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Runs greeting, EHLO and the TLS setup the configuration asks for.
    ///
    /// # Errors
    ///
    /// Returns an error naming the failing step.
    pub async fn open(
        stream: SmtpStream<S>,
        config: &SessionConfig,
        tls: &TlsConnector,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let mut client =
            Client::new(stream, config.command_timeout).with_cancellation(cancel.clone());

        let greeted = match config.security {
            Security::StartTls => {
                if let Err(e) = request_starttls(&mut client, &config.client_name).await {
                    client.close().await;
                    return Err(e);
                }
                client = client
                    .upgrade_to_tls(tls, &config.host)
                    .await
                    .map_err(|e| e.at("tls handshake"))?;
                // RFC 3207: EHLO again over the protected channel
                ehlo(&mut client, &config.client_name).await
            }
            Security::Implicit => {
                client = client
                    .upgrade_to_tls(tls, &config.host)
                    .await
                    .map_err(|e| e.at("tls handshake"))?;
                greeting_and_ehlo(&mut client, &config.client_name).await
            }
            Security::None => greeting_and_ehlo(&mut client, &config.client_name).await,
        };

        match greeted {
            Ok(()) => {
                debug!(tls = client.is_tls(), "session greeted");
                Ok(Self {
                    client,
                    _state: PhantomData,
                })
            }
            Err(e) => {
                client.close().await;
                Err(e)
            }
        }
    }

    /// Authenticates with AUTH LOGIN.
    ///
    /// The username and password are sent after each 3xx reply without
    /// looking at the challenge text.
    ///
    /// # Errors
    ///
    /// Returns an error naming the failing AUTH LOGIN step. The connection
    /// is closed before returning.
    pub async fn auth_login(
        mut self,
        username: &str,
        password: &str,
    ) -> Result<Session<Authenticated, S>> {
        let steps = [
            (Command::AuthLogin, Expect::PositiveIntermediate),
            (Command::username(username), Expect::PositiveIntermediate),
            (Command::password(password), Expect::PositiveCompletion),
        ];
        for (command, expect) in &steps {
            if let Err(e) = self.client.expect(command, *expect).await {
                self.client.close().await;
                return Err(e.at(command.step()));
            }
        }

        Ok(Session {
            client: self.client,
            _state: PhantomData,
        })
    }
}

impl<S> Session<Authenticated, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Negotiates an authenticated session over an already connected stream.
    ///
    /// # Errors
    ///
    /// Returns an error naming the failing step.
    pub async fn negotiate(
        stream: SmtpStream<S>,
        config: &SessionConfig,
        tls: &TlsConnector,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        Session::<Greeted, S>::open(stream, config, tls, cancel)
            .await?
            .auth_login(&config.username, &config.password)
            .await
    }

    /// Sends one message: MAIL FROM, RCPT TO, DATA, headers and body, end of data.
    ///
    /// `Ok` means the server acknowledged the end of data with 2xx and has
    /// taken responsibility for the message.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Rejected`] naming the refused command, or the
    /// transport error annotated with the step it interrupted.
    pub async fn send_mail(
        &mut self,
        from: &Address,
        to: &Address,
        subject: &str,
        body: &str,
    ) -> Result<()> {
        let client = &mut self.client;

        let mail_from = Command::MailFrom { from: from.clone() };
        client
            .expect(&mail_from, Expect::PositiveCompletion)
            .await
            .map_err(|e| e.at(mail_from.step()))?;

        let rcpt_to = Command::RcptTo { to: to.clone() };
        client
            .expect(&rcpt_to, Expect::PositiveCompletion)
            .await
            .map_err(|e| e.at(rcpt_to.step()))?;

        client
            .expect(&Command::Data, Expect::PositiveIntermediate)
            .await
            .map_err(|e| e.at(Command::Data.step()))?;

        let headers = format!(
            "From: {from}\r\nTo: {to}\r\nSubject: {}\r\n\r\n",
            header_value(subject)
        );
        client
            .write_raw(headers.as_bytes())
            .await
            .map_err(|e| e.at("DATA From, To, Subject"))?;
        if !body.is_empty() {
            client
                .write_raw(&encode_body(body))
                .await
                .map_err(|e| e.at("DATA body"))?;
        }

        client
            .expect(&Command::EndOfData, Expect::PositiveCompletion)
            .await
            .map_err(|e| e.at(Command::EndOfData.step()))?;
        Ok(())
    }

    /// Sends QUIT and closes the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if QUIT is not acknowledged with 2xx; the
    /// connection is closed either way.
    pub async fn quit(mut self) -> Result<()> {
        let result = self
            .client
            .expect(&Command::Quit, Expect::PositiveCompletion)
            .await
            .map(|_| ())
            .map_err(|e| e.at(Command::Quit.step()));
        self.client.close().await;
        result
    }
}

async fn greeting_and_ehlo<S>(client: &mut Client<S>, client_name: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    debug!("server greeting");
    client.greeting().await.map_err(|e| e.at("greeting"))?;
    ehlo(client, client_name).await
}

async fn request_starttls<S>(client: &mut Client<S>, client_name: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    greeting_and_ehlo(client, client_name).await?;
    client
        .expect(&Command::StartTls, Expect::PositiveCompletion)
        .await
        .map_err(|e| e.at("STARTTLS"))?;
    Ok(())
}

async fn ehlo<S>(client: &mut Client<S>, client_name: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let command = Command::Ehlo {
        hostname: client_name.to_string(),
    };
    client
        .expect(&command, Expect::PositiveCompletion)
        .await
        .map_err(|e| e.at(command.step()))?;
    Ok(())
}

/// Folds line breaks so a header value cannot start a new header.
fn header_value(value: &str) -> String {
    value
        .split(['\r', '\n'])
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
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
    fn test_header_value_folds_line_breaks() {
        assert_eq!(header_value("plain"), "plain");
        assert_eq!(header_value("a\r\nBcc: x@y"), "a Bcc: x@y");
        assert_eq!(header_value("\n"), "");
    }
}

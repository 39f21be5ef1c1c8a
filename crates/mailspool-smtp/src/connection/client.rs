//! Command driver: one request, one fully consumed reply.

use std::borrow::Cow;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::SmtpStream;
use crate::command::Command;
use crate::error::{Error, Result};
use crate::parser::ReplyParser;
use crate::types::Reply;

/// Reply band a step requires before the session may continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    /// 2xx
    PositiveCompletion,
    /// 3xx
    PositiveIntermediate,
}

impl Expect {
    /// Returns true if the reply satisfies this expectation.
    #[must_use]
    pub const fn accepts(self, reply: &Reply) -> bool {
        match self {
            Self::PositiveCompletion => reply.is_positive_completion(),
            Self::PositiveIntermediate => reply.is_positive_intermediate(),
        }
    }
}

/// Sends requests and reads replies over an [`SmtpStream`].
///
/// Every request is followed by reading its reply to the end before the
/// next request can be written. The first transport or grammar error marks
/// the client failed; it then refuses further traffic.
///
/// Reads, writes and the TLS handshake end early with [`Error::Cancelled`]
/// once the client's cancellation token fires. [`Client::close`] does not.
#[derive(Debug)]
pub struct Client<S = TcpStream> {
    stream: SmtpStream<S>,
    command_timeout: Duration,
    cancel: CancellationToken,
    failed: bool,
}

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Creates a client over a connected stream.
    pub fn new(stream: SmtpStream<S>, command_timeout: Duration) -> Self {
        Self {
            stream,
            command_timeout,
            cancel: CancellationToken::new(),
            failed: false,
        }
    }

    /// Uses `cancel` to abandon pending I/O.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Returns true if the stream is TLS-encrypted.
    #[must_use]
    pub const fn is_tls(&self) -> bool {
        self.stream.is_tls()
    }

    /// Returns true after a transport or grammar error.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        self.failed
    }

    /// Sends `request` and reads the reply.
    ///
    /// An empty request only reads a reply (the server greeting). `log`
    /// replaces the request in the protocol log without changing what is
    /// sent.
    ///
    /// # Errors
    ///
    /// Returns an error if the client already failed, if writing or reading
    /// fails or times out, or if the reply is malformed.
    pub async fn command(&mut self, request: &[u8], log: Option<&str>) -> Result<Reply> {
        if self.failed {
            return Err(failed_state());
        }
        if !request.is_empty() {
            let shown = log.map_or_else(|| String::from_utf8_lossy(request), Cow::Borrowed);
            info!("> {}", shown.trim_end());
            self.write(request).await?;
        }
        self.read_reply().await
    }

    /// Sends a command, redacting it in the log if it carries a secret.
    ///
    /// # Errors
    ///
    /// See [`Client::command`].
    pub async fn send(&mut self, command: &Command) -> Result<Reply> {
        self.command(&command.serialize(), command.log_line()).await
    }

    /// Sends a command and requires its reply to fall in the `expect` band.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Rejected`] naming the command for a well-formed reply
    /// in another band, or any error from [`Client::command`].
    pub async fn expect(&mut self, command: &Command, expect: Expect) -> Result<Reply> {
        let reply = self.send(command).await?;
        check(command.step(), expect, reply)
    }

    /// Reads the unsolicited greeting and requires a positive completion.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Rejected`] for a negative greeting or any error from
    /// [`Client::command`].
    pub async fn greeting(&mut self) -> Result<Reply> {
        let reply = self.command(&[], None).await?;
        check("greeting", Expect::PositiveCompletion, reply)
    }

    /// Writes bytes that have no reply of their own (message content).
    ///
    /// # Errors
    ///
    /// Returns an error if the client already failed or the write fails.
    pub async fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        if self.failed {
            return Err(failed_state());
        }
        for line in String::from_utf8_lossy(data).split_terminator("\r\n") {
            info!("> {line}");
        }
        self.write(data).await
    }

    /// Performs the TLS handshake over the current plaintext connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the client already failed, the stream is already
    /// TLS, or the handshake fails, times out or is cancelled.
    pub async fn upgrade_to_tls(self, connector: &TlsConnector, hostname: &str) -> Result<Self> {
        if self.failed {
            return Err(failed_state());
        }
        let limit = self.command_timeout;
        let cancel = self.cancel;
        let stream = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::Cancelled),
            stream = timeout(limit, self.stream.upgrade_to_tls(connector, hostname)) => {
                stream.map_err(|_| Error::Timeout(limit))??
            }
        };
        Ok(Self {
            stream,
            command_timeout: limit,
            cancel,
            failed: false,
        })
    }

    /// Closes the connection, sending TLS `close_notify` if encrypted.
    ///
    /// Errors are logged, not returned: by then the session is over.
    pub async fn close(mut self) {
        let limit = self.command_timeout;
        match timeout(limit, self.stream.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("shutdown: {e}"),
            Err(_) => warn!("shutdown: timed out after {limit:?}"),
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let limit = self.command_timeout;
        let cancel = self.cancel.clone();
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled),
            result = timeout(limit, self.stream.write_all(data)) => {
                result.unwrap_or(Err(Error::Timeout(limit)))
            }
        };
        if result.is_err() {
            self.failed = true;
        }
        result
    }

    async fn read_reply(&mut self) -> Result<Reply> {
        let cancel = self.cancel.clone();
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled),
            result = self.read_reply_inner() => result,
        };
        if result.is_err() {
            self.failed = true;
        }
        result
    }

    async fn read_reply_inner(&mut self) -> Result<Reply> {
        let limit = self.command_timeout;
        let mut parser = ReplyParser::new();
        loop {
            let line = timeout(limit, self.stream.read_line())
                .await
                .map_err(|_| Error::Timeout(limit))??;
            let Some(line) = line else {
                return parser.finish();
            };
            info!("< {line}");
            if let Some(reply) = parser.feed(&line)? {
                return Ok(reply);
            }
        }
    }
}

fn check(step: &'static str, expect: Expect, reply: Reply) -> Result<Reply> {
    if expect.accepts(&reply) {
        Ok(reply)
    } else {
        Err(Error::rejected(step, reply.code.as_u16(), reply.message_text()))
    }
}

fn failed_state() -> Error {
    Error::InvalidState("connection is in a failed state".into())
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
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_cancel_ends_pending_read() {
        let (stream, _server) = duplex(1024);
        let cancel = CancellationToken::new();
        let mut client = Client::new(SmtpStream::plain(stream), Duration::from_secs(60))
            .with_cancellation(cancel.clone());

        let canceller = tokio::spawn(async move {
            tokio::task::yield_now().await;
            cancel.cancel();
        });
        let err = client.greeting().await.unwrap_err();
        canceller.await.unwrap();

        assert!(matches!(err, Error::Cancelled));
        assert!(client.is_failed());
    }

    #[tokio::test]
    async fn test_cancelled_client_sends_nothing() {
        let (stream, mut server) = duplex(1024);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut client = Client::new(SmtpStream::plain(stream), Duration::from_secs(60))
            .with_cancellation(cancel);

        let err = client
            .expect(&Command::Quit, Expect::PositiveCompletion)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));

        client.close().await;
        let mut sent = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut server, &mut sent)
            .await
            .unwrap();
        assert!(sent.is_empty());
    }
}

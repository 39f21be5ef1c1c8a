//! Low-level SMTP stream handling.

use std::io;
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::debug;

use crate::error::{Error, Result};

/// Maximum reply line length, CRLF excluded.
pub const MAX_LINE_LENGTH: usize = 4096;

/// Longest line the reader takes in one go, CRLF included.
const LINE_LIMIT: usize = MAX_LINE_LENGTH + 2;

/// SMTP stream: one logical connection that is either plaintext or TLS.
///
/// The only variant change is the plaintext → TLS upgrade, either right
/// after connecting (implicit TLS) or after a positive STARTTLS reply.
#[derive(Debug)]
pub enum SmtpStream<S = TcpStream> {
    /// Plain connection.
    Plain(BufReader<S>),
    /// TLS-encrypted connection.
    Tls(Box<BufReader<TlsStream<S>>>),
}

impl<S> SmtpStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps a freshly connected stream.
    pub fn plain(stream: S) -> Self {
        Self::Plain(BufReader::new(stream))
    }

    /// Returns true if the stream is TLS-encrypted.
    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }

    /// Reads one CRLF-terminated line, without the terminator.
    ///
    /// Returns `Ok(None)` when the peer closes the connection before a
    /// complete line arrives.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails, the line is terminated by a bare
    /// LF, or the line exceeds [`MAX_LINE_LENGTH`].
    pub async fn read_line(&mut self) -> Result<Option<String>> {
        let mut buf = Vec::new();
        match self {
            Self::Plain(reader) => read_until_lf(reader, &mut buf).await?,
            Self::Tls(reader) => read_until_lf(&mut **reader, &mut buf).await?,
        };

        if buf.last() != Some(&b'\n') {
            if buf.len() >= LINE_LIMIT {
                return Err(Error::Protocol("reply line too long".into()));
            }
            // closed mid-line or before any byte
            return Ok(None);
        }
        buf.pop();
        if buf.pop() != Some(b'\r') {
            return Err(Error::Protocol("bare LF in reply line".into()));
        }
        Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
    }

    /// Writes data to the stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Self::Plain(reader) => {
                reader.get_mut().write_all(data).await?;
                reader.get_mut().flush().await?;
            }
            Self::Tls(reader) => {
                reader.get_mut().write_all(data).await?;
                reader.get_mut().flush().await?;
            }
        }
        Ok(())
    }

    /// Upgrades a plaintext stream to TLS, performing the handshake.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream is already TLS, if the server sent
    /// bytes that were not yet consumed, or if the handshake fails.
    pub async fn upgrade_to_tls(self, connector: &TlsConnector, hostname: &str) -> Result<Self> {
        let reader = match self {
            Self::Plain(reader) => reader,
            Self::Tls(_) => return Err(Error::InvalidState("Already using TLS".into())),
        };

        // Plaintext that arrived ahead of the handshake must not be read as
        // if it had been protected.
        if !reader.buffer().is_empty() {
            return Err(Error::Protocol(
                "unexpected data before TLS handshake".into(),
            ));
        }

        let server_name = ServerName::try_from(hostname.to_string())?;
        debug!(hostname, "tls handshake");
        let tls = connector
            .connect(server_name, reader.into_inner())
            .await
            .map_err(handshake_error)?;

        let (_, session) = tls.get_ref();
        debug!(
            version = ?session.protocol_version(),
            cipher_suite = ?session.negotiated_cipher_suite().map(|suite| suite.suite()),
            "tls handshake complete"
        );

        Ok(Self::Tls(Box::new(BufReader::new(tls))))
    }

    /// Shuts the connection down, sending TLS `close_notify` first if encrypted.
    ///
    /// # Errors
    ///
    /// Returns an error if the shutdown fails.
    pub async fn shutdown(&mut self) -> Result<()> {
        match self {
            Self::Plain(reader) => reader.get_mut().shutdown().await?,
            Self::Tls(reader) => reader.get_mut().shutdown().await?,
        }
        Ok(())
    }
}

async fn read_until_lf<R>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    reader.take(LINE_LIMIT as u64).read_until(b'\n', buf).await
}

/// tokio-rustls reports handshake failures as I/O errors wrapping the TLS error.
fn handshake_error(e: io::Error) -> Error {
    match e.get_ref().and_then(|inner| inner.downcast_ref::<rustls::Error>()) {
        Some(tls) => Error::Tls(tls.clone()),
        None => Error::Io(e),
    }
}

/// Opens the raw TCP connection, resolving the hostname.
///
/// # Errors
///
/// Returns an error if resolution or the connection fails or times out.
pub async fn connect(hostname: &str, port: u16, connect_timeout: Duration) -> Result<SmtpStream> {
    debug!(hostname, port, "connect");
    let stream = timeout(connect_timeout, TcpStream::connect((hostname, port)))
        .await
        .map_err(|_| Error::Timeout(connect_timeout))??;
    Ok(SmtpStream::plain(stream))
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
    async fn test_read_crlf_lines() {
        let (client, mut server) = duplex(1024);
        server.write_all(b"220 ready\r\n250 OK\r\n").await.unwrap();
        drop(server);

        let mut stream = SmtpStream::plain(client);
        assert_eq!(stream.read_line().await.unwrap().as_deref(), Some("220 ready"));
        assert_eq!(stream.read_line().await.unwrap().as_deref(), Some("250 OK"));
        assert_eq!(stream.read_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_bare_lf_is_rejected() {
        let (client, mut server) = duplex(1024);
        server.write_all(b"220 ready\n").await.unwrap();

        let mut stream = SmtpStream::plain(client);
        let err = stream.read_line().await.unwrap_err();
        assert!(err.to_string().contains("bare LF"));
    }

    #[tokio::test]
    async fn test_partial_line_at_eof() {
        let (client, mut server) = duplex(1024);
        server.write_all(b"220 rea").await.unwrap();
        drop(server);

        let mut stream = SmtpStream::plain(client);
        assert_eq!(stream.read_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_overlong_line() {
        let (client, mut server) = duplex(16 * 1024);
        let line = vec![b'a'; MAX_LINE_LENGTH + 10];
        server.write_all(&line).await.unwrap();
        server.write_all(b"\r\n").await.unwrap();

        let mut stream = SmtpStream::plain(client);
        let err = stream.read_line().await.unwrap_err();
        assert!(err.to_string().contains("too long"));
    }

    #[tokio::test]
    async fn test_line_length_boundary() {
        let (client, mut server) = duplex(16 * 1024);
        let longest = vec![b'a'; MAX_LINE_LENGTH];
        server.write_all(&longest).await.unwrap();
        server.write_all(b"\r\n").await.unwrap();
        let one_more = vec![b'b'; MAX_LINE_LENGTH + 1];
        server.write_all(&one_more).await.unwrap();
        server.write_all(b"\r\n").await.unwrap();

        let mut stream = SmtpStream::plain(client);
        let line = stream.read_line().await.unwrap().unwrap();
        assert_eq!(line.len(), MAX_LINE_LENGTH);
        let err = stream.read_line().await.unwrap_err();
        assert!(err.to_string().contains("too long"));
    }

    #[tokio::test]
    async fn test_write_all() {
        let (client, mut server) = duplex(1024);
        let mut stream = SmtpStream::plain(client);
        stream.write_all(b"QUIT\r\n").await.unwrap();
        stream.shutdown().await.unwrap();

        let mut sent = Vec::new();
        server.read_to_end(&mut sent).await.unwrap();
        assert_eq!(sent, b"QUIT\r\n");
    }

    #[tokio::test]
    async fn test_upgrade_refuses_buffered_plaintext() {
        let (client, mut server) = duplex(1024);
        server.write_all(b"220 go ahead\r\nINJECTED\r\n").await.unwrap();

        let mut stream = SmtpStream::plain(client);
        stream.read_line().await.unwrap();
        let connector = crate::connection::create_tls_connector(&crate::TrustAnchors::None).unwrap();
        let err = stream.upgrade_to_tls(&connector, "localhost").await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}

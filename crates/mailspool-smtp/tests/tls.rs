//! TLS session tests against a local rustls server with a self-signed
//! certificate.

#![allow(clippy::unwrap_used)]

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use mailspool_smtp::connection::create_tls_connector;
use mailspool_smtp::{
    Address, Authenticated, Error, Result, Security, Session, SessionConfig, SmtpStream,
    TrustAnchors,
};

/// Self-signed server certificate and its key.
struct TestCert {
    pem: String,
    der: Vec<u8>,
    key: Vec<u8>,
}

impl TestCert {
    fn new(name: &str) -> Self {
        let cert = rcgen::generate_simple_self_signed(vec![name.to_string()]).unwrap();
        Self {
            pem: cert.serialize_pem().unwrap(),
            der: cert.serialize_der().unwrap(),
            key: cert.serialize_private_key_der(),
        }
    }

    fn acceptor(&self) -> TlsAcceptor {
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(
                vec![CertificateDer::from(self.der.clone())],
                PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key.clone())),
            )
            .unwrap();
        TlsAcceptor::from(Arc::new(config))
    }
}

/// How the scripted server answers.
#[derive(Default)]
struct Script {
    /// Send the greeting first (implicit TLS).
    greet: bool,
    /// Cancel this token instead of answering MAIL FROM.
    cancel_at_mail: Option<CancellationToken>,
}

/// Answers one SMTP conversation and returns the commands received.
///
/// Fails if the client disconnects without a TLS `close_notify`.
async fn converse<S>(stream: S, script: Script) -> io::Result<Vec<String>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = BufReader::new(stream);
    let mut seen = Vec::new();
    let mut in_data = false;

    if script.greet {
        send(&mut stream, b"220 fake ESMTP ready\r\n").await?;
    }
    loop {
        let mut line = String::new();
        if stream.read_line(&mut line).await? == 0 {
            return Ok(seen);
        }
        let line = line.trim_end().to_string();
        if in_data && line != "." {
            continue;
        }

        let reply: &[u8] = if in_data {
            in_data = false;
            b"250 2.0.0 Queued\r\n"
        } else if line.starts_with("EHLO ") {
            b"250-fake\r\n250 AUTH LOGIN\r\n"
        } else if line == "AUTH LOGIN" {
            b"334 VXNlcm5hbWU6\r\n"
        } else if line == "dXNlcg==" {
            b"334 UGFzc3dvcmQ6\r\n"
        } else if line == "c2VjcmV0" {
            b"235 2.7.0 Authentication successful\r\n"
        } else if line.starts_with("MAIL FROM:") {
            if let Some(cancel) = &script.cancel_at_mail {
                seen.push(line);
                cancel.cancel();
                continue;
            }
            b"250 2.1.0 OK\r\n"
        } else if line.starts_with("RCPT TO:") {
            b"250 2.1.5 OK\r\n"
        } else if line == "DATA" {
            in_data = true;
            b"354 End data with <CR><LF>.<CR><LF>\r\n"
        } else if line == "QUIT" {
            b"221 2.0.0 Bye\r\n"
        } else {
            b"500 5.5.2 Unrecognized command\r\n"
        };
        seen.push(line);
        send(&mut stream, reply).await?;
    }
}

async fn send<S>(stream: &mut BufReader<S>, reply: &[u8]) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.get_mut().write_all(reply).await?;
    stream.get_mut().flush().await
}

async fn read_command(stream: &mut BufReader<TcpStream>) -> io::Result<String> {
    let mut line = String::new();
    stream.read_line(&mut line).await?;
    Ok(line.trim_end().to_string())
}

/// Plaintext greeting and STARTTLS, then the rest of the session over TLS.
async fn starttls_server(listener: TcpListener, acceptor: TlsAcceptor) -> io::Result<Vec<String>> {
    let (socket, _) = listener.accept().await?;
    let mut plain = BufReader::new(socket);
    let mut seen = Vec::new();

    send(&mut plain, b"220 fake ESMTP ready\r\n").await?;
    seen.push(read_command(&mut plain).await?);
    send(&mut plain, b"250-fake\r\n250-STARTTLS\r\n250 AUTH LOGIN\r\n").await?;
    seen.push(read_command(&mut plain).await?);
    send(&mut plain, b"220 2.0.0 Ready to start TLS\r\n").await?;

    let tls = acceptor.accept(plain.into_inner()).await?;
    seen.push("<tls>".to_string());
    seen.extend(converse(tls, Script::default()).await?);
    Ok(seen)
}

async fn implicit_tls_server(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    script: Script,
) -> io::Result<Vec<String>> {
    let (socket, _) = listener.accept().await?;
    let tls = acceptor.accept(socket).await?;
    converse(tls, script).await
}

async fn bind() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

fn config(security: Security, trust: TrustAnchors) -> SessionConfig {
    SessionConfig::builder("localhost")
        .security(security)
        .credentials("user", "secret")
        .trust(trust)
        .command_timeout(Duration::from_secs(5))
        .build()
}

async fn negotiate(
    addr: SocketAddr,
    config: &SessionConfig,
    cancel: &CancellationToken,
) -> Result<Session<Authenticated>> {
    let stream = TcpStream::connect(addr).await.unwrap();
    let tls = create_tls_connector(&config.trust).unwrap();
    Session::negotiate(SmtpStream::plain(stream), config, &tls, cancel).await
}

fn addresses() -> (Address, Address) {
    (
        Address::new("door@example.com").unwrap(),
        Address::new("owner@example.com").unwrap(),
    )
}

#[tokio::test]
async fn test_starttls_with_verified_certificate() {
    let cert = TestCert::new("localhost");
    let (listener, addr) = bind().await;
    let server = tokio::spawn(starttls_server(listener, cert.acceptor()));

    let trust = TrustAnchors::from_pem(&cert.pem).unwrap();
    let config = config(Security::StartTls, trust);
    let mut session = negotiate(addr, &config, &CancellationToken::new())
        .await
        .unwrap();
    assert!(session.is_tls());

    let (from, to) = addresses();
    session.send_mail(&from, &to, "Garage", "opened").await.unwrap();
    session.quit().await.unwrap();

    // Ok only if the client ended with close_notify
    let seen = server.await.unwrap().unwrap();
    assert_eq!(
        seen,
        [
            "EHLO mailspool",
            "STARTTLS",
            "<tls>",
            "EHLO mailspool",
            "AUTH LOGIN",
            "dXNlcg==",
            "c2VjcmV0",
            "MAIL FROM:<door@example.com>",
            "RCPT TO:<owner@example.com>",
            "DATA",
            ".",
            "QUIT",
        ]
    );
}

#[tokio::test]
async fn test_implicit_tls_without_verification() {
    let cert = TestCert::new("localhost");
    let (listener, addr) = bind().await;
    let script = Script {
        greet: true,
        ..Script::default()
    };
    let server = tokio::spawn(implicit_tls_server(listener, cert.acceptor(), script));

    let config = config(Security::Implicit, TrustAnchors::None);
    let mut session = negotiate(addr, &config, &CancellationToken::new())
        .await
        .unwrap();
    assert!(session.is_tls());

    let (from, to) = addresses();
    session.send_mail(&from, &to, "Garage", "opened").await.unwrap();
    session.quit().await.unwrap();

    let seen = server.await.unwrap().unwrap();
    assert_eq!(seen.first().map(String::as_str), Some("EHLO mailspool"));
    assert_eq!(seen.last().map(String::as_str), Some("QUIT"));
}

#[tokio::test]
async fn test_unknown_issuer_fails_handshake() {
    let cert = TestCert::new("localhost");
    let other = TestCert::new("localhost");
    let (listener, addr) = bind().await;
    let acceptor = cert.acceptor();
    let server = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        acceptor.accept(socket).await.is_ok()
    });

    let trust = TrustAnchors::from_pem(&other.pem).unwrap();
    let config = config(Security::Implicit, trust);
    let err = negotiate(addr, &config, &CancellationToken::new())
        .await
        .unwrap_err();

    let text = err.to_string();
    assert!(text.starts_with("tls handshake: "), "{text}");
    assert!(text.contains("invalid peer certificate"), "{text}");
    assert!(!err.is_transient() && !err.is_permanent());
    assert!(!server.await.unwrap());
}

#[tokio::test]
async fn test_cancel_mid_transaction_sends_close_notify() {
    let cert = TestCert::new("localhost");
    let (listener, addr) = bind().await;
    let cancel = CancellationToken::new();
    let script = Script {
        greet: true,
        cancel_at_mail: Some(cancel.clone()),
    };
    let server = tokio::spawn(implicit_tls_server(listener, cert.acceptor(), script));

    let config = config(Security::Implicit, TrustAnchors::None);
    let mut session = negotiate(addr, &config, &cancel).await.unwrap();

    let (from, to) = addresses();
    let err = session.send_mail(&from, &to, "Garage", "opened").await.unwrap_err();
    assert!(matches!(
        &err,
        Error::Step { step: "MAIL FROM", source } if matches!(**source, Error::Cancelled)
    ));
    session.close().await;

    let seen = server.await.unwrap().unwrap();
    assert_eq!(seen.last().map(String::as_str), Some("MAIL FROM:<door@example.com>"));
}

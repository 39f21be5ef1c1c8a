//! Delivery engine tests against a scripted SMTP server on localhost.

#![allow(clippy::unwrap_used)]

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::{self, ServerConfig};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_util::sync::CancellationToken;

use mailspool_core::{Error, Mailer, MailerConfig, Outbox, Security, deliver};
use mailspool_smtp::connection::create_tls_connector;
use mailspool_smtp::{Address, Session};

/// How the fake server misbehaves.
#[derive(Default)]
struct Behavior {
    /// In the first session, hang up when MAIL FROM number `n` (1-based) arrives.
    hang_up_at_mail: Option<usize>,
    /// Recipients refused with 550.
    refuse_rcpt: Vec<&'static str>,
    /// Delay before every reply.
    reply_delay: Duration,
    /// Speak implicit TLS.
    tls: Option<TlsAcceptor>,
    /// Never answer the end of data; keep reading until the client leaves.
    stall_end_of_data: bool,
}

#[derive(Debug, Default)]
struct State {
    sessions: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    stalled: AtomicUsize,
    /// Sessions the client ended by closing the stream (after TLS
    /// `close_notify` when encrypted) rather than with QUIT.
    clean_closes: AtomicUsize,
    delivered: Mutex<Vec<String>>,
}

/// Self-signed certificate for the implicit TLS listener.
fn tls_acceptor() -> TlsAcceptor {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let chain = vec![CertificateDer::from(cert.serialize_der().unwrap())];
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.serialize_private_key_der()));
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .unwrap();
    TlsAcceptor::from(Arc::new(config))
}

/// Minimal SMTP server: accepts AUTH LOGIN blindly, refuses STARTTLS with
/// 454 and records the subject of every accepted message.
struct FakeServer {
    addr: SocketAddr,
    state: Arc<State>,
}

impl FakeServer {
    async fn start(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(State::default());
        let behavior = Arc::new(behavior);

        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let index = accept_state.sessions.fetch_add(1, Ordering::SeqCst);
                let state = Arc::clone(&accept_state);
                let behavior = Arc::clone(&behavior);
                tokio::spawn(async move {
                    let active = state.active.fetch_add(1, Ordering::SeqCst) + 1;
                    state.max_active.fetch_max(active, Ordering::SeqCst);
                    let _ = match &behavior.tls {
                        Some(acceptor) => match acceptor.accept(socket).await {
                            Ok(tls) => serve(tls, index, &state, &behavior).await,
                            Err(e) => Err(e),
                        },
                        None => serve(socket, index, &state, &behavior).await,
                    };
                    state.active.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });

        Self { addr, state }
    }

    fn delivered(&self) -> Vec<String> {
        self.state.delivered.lock().unwrap().clone()
    }

    fn sessions(&self) -> usize {
        self.state.sessions.load(Ordering::SeqCst)
    }

    fn max_active(&self) -> usize {
        self.state.max_active.load(Ordering::SeqCst)
    }

    fn stalled(&self) -> usize {
        self.state.stalled.load(Ordering::SeqCst)
    }

    fn clean_closes(&self) -> usize {
        self.state.clean_closes.load(Ordering::SeqCst)
    }

    fn config(&self, security: Security) -> MailerConfig {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        MailerConfig::builder("127.0.0.1")
            .port(self.addr.port())
            .credentials("door", "secret")
            .from("door@example.com")
            .to("owner@example.com")
            .security(security)
            .retry_interval(Duration::from_millis(50))
            .connect_timeout(Duration::from_secs(5))
            .command_timeout(Duration::from_secs(5))
            .build()
    }
}

async fn reply<W>(writer: &mut W, behavior: &Behavior, text: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if !behavior.reply_delay.is_zero() {
        sleep(behavior.reply_delay).await;
    }
    writer.write_all(text.as_bytes()).await?;
    writer.flush().await
}

async fn serve<S>(stream: S, index: usize, state: &State, behavior: &Behavior) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();
    let mut mails = 0;

    reply(&mut writer, behavior, "220 fake ESMTP ready\r\n").await?;
    while let Some(line) = lines.next_line().await? {
        let command = line.to_ascii_uppercase();
        if command.starts_with("EHLO ") {
            reply(&mut writer, behavior, "250-fake\r\n250-STARTTLS\r\n250 AUTH LOGIN\r\n").await?;
        } else if command == "STARTTLS" {
            reply(&mut writer, behavior, "454 4.7.0 TLS not available\r\n").await?;
        } else if command == "AUTH LOGIN" {
            reply(&mut writer, behavior, "334 VXNlcm5hbWU6\r\n").await?;
            lines.next_line().await?;
            reply(&mut writer, behavior, "334 UGFzc3dvcmQ6\r\n").await?;
            lines.next_line().await?;
            reply(&mut writer, behavior, "235 2.7.0 Authentication successful\r\n").await?;
        } else if command.starts_with("MAIL FROM:") {
            mails += 1;
            if index == 0 && behavior.hang_up_at_mail == Some(mails) {
                return Ok(());
            }
            reply(&mut writer, behavior, "250 2.1.0 OK\r\n").await?;
        } else if command.starts_with("RCPT TO:") {
            let refused = behavior
                .refuse_rcpt
                .iter()
                .any(|to| line.contains(&format!("<{to}>")));
            let text = if refused {
                "550 5.1.1 No such user\r\n"
            } else {
                "250 2.1.5 OK\r\n"
            };
            reply(&mut writer, behavior, text).await?;
        } else if command == "DATA" {
            reply(&mut writer, behavior, "354 End data with <CR><LF>.<CR><LF>\r\n").await?;
            let mut subject = String::new();
            while let Some(data) = lines.next_line().await? {
                if data == "." {
                    break;
                }
                if let Some(value) = data.strip_prefix("Subject: ") {
                    subject = value.to_string();
                }
            }
            if behavior.stall_end_of_data {
                state.stalled.fetch_add(1, Ordering::SeqCst);
                continue;
            }
            state.delivered.lock().unwrap().push(subject);
            reply(&mut writer, behavior, "250 2.0.0 Queued\r\n").await?;
        } else if command == "QUIT" {
            reply(&mut writer, behavior, "221 2.0.0 Bye\r\n").await?;
            return Ok(());
        } else {
            reply(&mut writer, behavior, "500 5.5.2 Unrecognized command\r\n").await?;
        }
    }
    // a TLS peer that vanished without close_notify errors out above
    state.clean_closes.fetch_add(1, Ordering::SeqCst);
    Ok(())
}

async fn until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(10), async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_messages_delivered_in_order() {
    let server = FakeServer::start(Behavior::default()).await;
    let mailer = Mailer::spawn(&server.config(Security::None)).unwrap();

    for subject in ["A", "B", "C"] {
        mailer.enqueue(subject, format!("body {subject}"), None).unwrap();
    }
    timeout(Duration::from_secs(10), mailer.outbox().wait_empty())
        .await
        .unwrap();

    assert_eq!(server.delivered(), ["A", "B", "C"]);
    assert_eq!(mailer.stats().delivered, 3);
    assert!(mailer.shutdown().await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_at_most_one_session() {
    let server = FakeServer::start(Behavior {
        reply_delay: Duration::from_millis(5),
        ..Behavior::default()
    })
    .await;
    let mailer = Mailer::spawn(&server.config(Security::None)).unwrap();

    let mut producers = Vec::new();
    for producer in 0..4 {
        let outbox = mailer.outbox().clone();
        producers.push(tokio::spawn(async move {
            for n in 0..2 {
                outbox.enqueue(format!("{producer}-{n}"), "", None).unwrap();
                sleep(Duration::from_millis(15)).await;
            }
        }));
    }
    for producer in producers {
        producer.await.unwrap();
    }
    timeout(Duration::from_secs(10), mailer.outbox().wait_empty())
        .await
        .unwrap();

    assert_eq!(server.delivered().len(), 8);
    assert_eq!(server.max_active(), 1);
    assert!(mailer.stats().sessions_in_flight <= 1);
    mailer.shutdown().await;
}

#[tokio::test]
async fn test_retry_resumes_after_acknowledged_message() {
    let server = FakeServer::start(Behavior {
        hang_up_at_mail: Some(2),
        ..Behavior::default()
    })
    .await;
    let config = server.config(Security::None);
    let session_config = config.session_config().unwrap();
    let tls = create_tls_connector(&session_config.trust).unwrap();
    let sender = Address::new("door@example.com").unwrap();

    let cancel = CancellationToken::new();

    let mut outbox = Outbox::new(Address::new("owner@example.com").unwrap(), 8);
    outbox.enqueue("A", "first", None).unwrap();
    outbox.enqueue("B", "second", None).unwrap();

    let session = Session::establish(&session_config, &tls, &cancel).await.unwrap();
    let err = deliver(session, &sender, &mut outbox).await.unwrap_err();
    assert!(matches!(&err, Error::Message { subject, .. } if subject == "B"));
    assert!(err.to_string().contains("MAIL FROM"), "{err}");
    assert_eq!(server.delivered(), ["A"]);
    assert_eq!(outbox.front().unwrap().subject, "B");

    let session = Session::establish(&session_config, &tls, &cancel).await.unwrap();
    assert_eq!(deliver(session, &sender, &mut outbox).await.unwrap(), 1);
    assert_eq!(server.delivered(), ["A", "B"]);
    assert!(outbox.is_empty());
}

#[tokio::test]
async fn test_starttls_refused_keeps_message_and_retries() {
    let server = FakeServer::start(Behavior::default()).await;
    let mailer = Mailer::spawn(&server.config(Security::StartTls)).unwrap();

    mailer.enqueue("A", "", None).unwrap();
    until(|| server.sessions() >= 2).await;

    assert_eq!(mailer.outbox().len(), 1);
    assert!(mailer.stats().attempts >= 2);
    assert!(server.delivered().is_empty());

    let remaining = mailer.shutdown().await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].subject, "A");
}

#[tokio::test]
async fn test_shutdown_during_retry_pause() {
    let server = FakeServer::start(Behavior::default()).await;
    let mut config = server.config(Security::StartTls);
    config.retry_interval_secs = 3600.0;
    let mailer = Mailer::spawn(&config).unwrap();

    mailer.enqueue("A", "", None).unwrap();
    until(|| {
        let stats = mailer.stats();
        stats.attempts == 1 && stats.sessions_in_flight == 0
    })
    .await;

    let remaining = timeout(Duration::from_secs(1), mailer.shutdown())
        .await
        .unwrap();
    assert_eq!(remaining.len(), 1);
}

#[tokio::test]
async fn test_permanent_rejection_keeps_message_queued() {
    let server = FakeServer::start(Behavior {
        refuse_rcpt: vec!["nobody@example.com"],
        ..Behavior::default()
    })
    .await;
    let mailer = Mailer::spawn(&server.config(Security::None)).unwrap();

    mailer
        .enqueue("X", "", Some("nobody@example.com"))
        .unwrap();
    mailer.enqueue("Y", "", None).unwrap();
    until(|| server.sessions() >= 2).await;

    // retried from MAIL FROM every session, still blocking the queue
    assert_eq!(mailer.outbox().front().unwrap().subject, "X");
    assert_eq!(mailer.outbox().len(), 2);
    assert!(server.delivered().is_empty());
    assert_eq!(mailer.stats().delivered, 0);

    let subjects: Vec<_> = mailer
        .shutdown()
        .await
        .into_iter()
        .map(|m| m.subject)
        .collect();
    assert_eq!(subjects, ["X", "Y"]);
}

#[tokio::test]
async fn test_shutdown_mid_session_closes_tls() {
    let server = FakeServer::start(Behavior {
        tls: Some(tls_acceptor()),
        stall_end_of_data: true,
        ..Behavior::default()
    })
    .await;
    let mailer = Mailer::spawn(&server.config(Security::Implicit)).unwrap();

    mailer.enqueue("A", "body", None).unwrap();
    until(|| server.stalled() == 1).await;

    let remaining = timeout(Duration::from_secs(2), mailer.shutdown())
        .await
        .unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].subject, "A");
    until(|| server.clean_closes() == 1).await;
}

#[tokio::test]
async fn test_overflow_drops_newest() {
    let server = FakeServer::start(Behavior::default()).await;
    let mut config = server.config(Security::StartTls);
    config.queue_capacity = 2;
    config.retry_interval_secs = 3600.0;
    let mailer = Mailer::spawn(&config).unwrap();

    mailer.enqueue("A", "", None).unwrap();
    mailer.enqueue("B", "", None).unwrap();
    assert!(matches!(mailer.enqueue("C", "", None), Err(Error::QueueFull)));
    assert_eq!(mailer.stats().dropped, 1);

    let subjects: Vec<_> = mailer
        .shutdown()
        .await
        .into_iter()
        .map(|m| m.subject)
        .collect();
    assert_eq!(subjects, ["A", "B"]);
}

#[test]
fn test_spawn_rejects_invalid_config() {
    let err = Mailer::spawn(&MailerConfig::default()).unwrap_err();
    assert!(matches!(err, Error::Validation(errors) if !errors.is_empty()));
}

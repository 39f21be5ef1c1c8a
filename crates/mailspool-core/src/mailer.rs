//! Mailer: owns the outbox and the single delivery worker.
//!
//! ```text
//!            ┌────────── shutdown ──────────┐
//!            ▼                              │
//!  ┌─► wait for work ──► session attempt ──► retry pause ─┐
//!  │   (queue empty)     (negotiate + deliver)             │
//!  └───────────────────────────────────────────────────────┘
//! ```
//!
//! Exactly one worker task runs per mailer and sessions run inline in its
//! loop, so there is never more than one session at a time.

use std::sync::Arc;
use std::time::Duration;

use mailspool_smtp::connection::create_tls_connector;
use mailspool_smtp::{Address, Session, SessionConfig};
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{Instrument, debug, info, info_span, warn};

use crate::config::MailerConfig;
use crate::delivery::deliver;
use crate::error::{Error, Result};
use crate::outbox::{Message, Outbox};
use crate::stats::{Counters, Stats};

/// Handle to a running mailer.
///
/// Dropping the handle stops the worker the same way [`Mailer::shutdown`]
/// does, but discards the messages still queued.
#[derive(Debug)]
pub struct Mailer {
    outbox: Outbox,
    stop: DropGuard,
    worker: JoinHandle<()>,
}

impl Mailer {
    /// Validates the configuration, builds the TLS connector and starts the worker.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the trust
    /// anchors cannot be loaded.
    pub fn spawn(config: &MailerConfig) -> Result<Self> {
        config.validate()?;

        let session = config.session_config()?;
        let tls = create_tls_connector(&session.trust)?;
        let counters = Arc::new(Counters::default());
        let outbox = Outbox::with_counters(config.recipient()?, config.queue_capacity, counters);

        info!(
            server = %session.host,
            port = session.port,
            security = %session.security,
            task = %config.task_name,
            "starting mailer"
        );

        let worker = Worker {
            session_config: session,
            tls,
            sender: config.sender()?,
            outbox: outbox.clone(),
            retry_interval: config.retry_interval(),
        };
        let cancel = CancellationToken::new();
        let span = info_span!("mailer", task = %config.task_name);
        let worker = tokio::spawn(worker.run(cancel.clone()).instrument(span));

        Ok(Self {
            outbox,
            stop: cancel.drop_guard(),
            worker,
        })
    }

    /// Returns the outbox; clones of it can enqueue from anywhere.
    #[must_use]
    pub const fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    /// Queues a message for delivery.
    ///
    /// # Errors
    ///
    /// See [`Outbox::enqueue`].
    pub fn enqueue(
        &self,
        subject: impl Into<String>,
        body: impl Into<String>,
        to: Option<&str>,
    ) -> Result<u64> {
        if self.worker.is_finished() {
            return Err(Error::Shutdown);
        }
        self.outbox.enqueue(subject, body, to)
    }

    /// Returns the delivery counters.
    #[must_use]
    pub fn stats(&self) -> Stats {
        self.outbox.stats()
    }

    /// Stops the worker and returns the messages that were not delivered.
    ///
    /// A pending wait or retry pause ends at once. An attempt in progress
    /// stops waiting on the server and closes its connection (QUIT is not
    /// sent, TLS `close_notify` is); the message it was sending stays queued.
    pub async fn shutdown(self) -> Vec<Message> {
        self.stop.disarm().cancel();
        if let Err(e) = self.worker.await {
            warn!("mailer worker failed: {e}");
        }
        let remaining = self.outbox.drain();
        info!(remaining = remaining.len(), "mailer stopped");
        remaining
    }
}

struct Worker {
    session_config: SessionConfig,
    tls: TlsConnector,
    sender: Address,
    outbox: Outbox,
    retry_interval: Duration,
}

impl Worker {
    async fn run(self, cancel: CancellationToken) {
        loop {
            while self.outbox.is_empty() {
                tokio::select! {
                    () = self.outbox.enqueued() => {}
                    () = cancel.cancelled() => return,
                }
            }

            let result = self.attempt(&cancel).await;
            if cancel.is_cancelled() {
                debug!(?result, "session attempt cancelled");
                return;
            }
            report(result);

            tokio::select! {
                () = tokio::time::sleep(self.retry_interval) => {}
                () = cancel.cancelled() => return,
            }
        }
    }

    /// One connect-through-QUIT cycle.
    async fn attempt(&self, cancel: &CancellationToken) -> Result<usize> {
        let _in_flight = self.counters().start_attempt();
        debug!(queued = self.outbox.len(), "session attempt");

        let session = Session::establish(&self.session_config, &self.tls, cancel)
            .await
            .map_err(Error::Session)?;
        let mut source = self.outbox.clone();
        deliver(session, &self.sender, &mut source).await
    }

    fn counters(&self) -> &Counters {
        self.outbox.counters()
    }
}

fn report(result: Result<usize>) {
    match result {
        Ok(delivered) => info!(delivered, "session complete"),
        Err(e) => warn!("{e}"),
    }
}

//! Delivery loop: drains queued messages through one authenticated session.

use mailspool_smtp::{Address, Authenticated, Session};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::info;

use crate::error::{Error, Result};
use crate::outbox::{Message, Outbox};

/// Where the delivery loop takes messages from and reports outcomes to.
pub trait MessageSource {
    /// Returns the next message without removing it.
    fn next(&mut self) -> Option<Message>;

    /// The server accepted `message`; it must not be offered again.
    fn delivered(&mut self, message: &Message);
}

impl MessageSource for Outbox {
    fn next(&mut self) -> Option<Message> {
        self.front()
    }

    fn delivered(&mut self, message: &Message) {
        self.commit(message.id);
    }
}

/// Sends every message `source` offers, then QUIT.
///
/// A message is reported delivered only after the server acknowledged the
/// end of its data. On the first failure of any kind, 5xx replies included,
/// the session is closed and the error returned; the failing message stays
/// with the source and is sent again from MAIL FROM by the next session.
///
/// Returns the number of messages delivered.
///
/// # Errors
///
/// Returns [`Error::Message`] if sending a message failed, or
/// [`Error::Session`] if QUIT failed.
pub async fn deliver<S, M>(
    mut session: Session<Authenticated, S>,
    sender: &Address,
    source: &mut M,
) -> Result<usize>
where
    S: AsyncRead + AsyncWrite + Unpin,
    M: MessageSource + ?Sized,
{
    let mut delivered = 0;

    while let Some(message) = source.next() {
        let sent = session
            .send_mail(sender, &message.to, &message.subject, &message.body)
            .await;

        match sent {
            Ok(()) => {
                info!(id = message.id, subject = %message.subject, "message delivered");
                source.delivered(&message);
                delivered += 1;
            }
            Err(e) => {
                session.close().await;
                return Err(Error::Message {
                    subject: message.subject,
                    source: e,
                });
            }
        }
    }

    session.quit().await.map_err(Error::Session)?;
    Ok(delivered)
}

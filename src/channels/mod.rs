//! Mail channels: the source mailbox, the outbound transport and the
//! polling daemon that drives relay passes.

pub mod imap;
pub mod poller;
pub mod smtp;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{DeliveryError, MailboxError};

pub use imap::ImapConnector;
pub use poller::spawn_daemon;
pub use smtp::SmtpOutbound;

/// One message pulled from the source mailbox.
#[derive(Debug, Clone)]
pub struct FetchedMessage {
    pub uid: u32,
    /// The message exactly as stored by the server.
    pub raw: Vec<u8>,
    /// Server receipt time (IMAP INTERNALDATE).
    pub received_at: DateTime<Utc>,
}

/// Opens authenticated sessions against the source mailbox.
#[async_trait]
pub trait MailboxConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn MailboxSession>, MailboxError>;
}

/// A logged-in session with the inbox selected.
#[async_trait]
pub trait MailboxSession: Send {
    /// Every message identifier in the inbox, ascending.
    async fn list(&mut self) -> Result<Vec<u32>, MailboxError>;

    /// Body and receipt timestamp of one message. Does not set `\Seen`.
    async fn fetch(&mut self, uid: u32) -> Result<FetchedMessage, MailboxError>;

    /// Flag a handled message `\Seen`. Advisory only.
    async fn mark_seen(&mut self, uid: u32) -> Result<(), MailboxError>;

    async fn logout(&mut self) -> Result<(), MailboxError>;
}

/// Opens authenticated sessions against the outbound server.
#[async_trait]
pub trait OutboundTransport: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn OutboundSession>, DeliveryError>;
}

/// One outbound connection, reused for every send of a pass.
#[async_trait]
pub trait OutboundSession: Send {
    /// Send `message` verbatim to a single envelope recipient.
    ///
    /// Only a refusal of that recipient is recipient-local; any other
    /// failure leaves the session unusable.
    async fn send(&mut self, to: &str, message: &[u8]) -> Result<(), DeliveryError>;

    async fn quit(&mut self) -> Result<(), DeliveryError>;
}

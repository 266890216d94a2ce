//! Error types for the relay.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<libsql::Error> for DatabaseError {
    fn from(e: libsql::Error) -> Self {
        DatabaseError::Query(e.to_string())
    }
}

/// Source mailbox (IMAP) errors.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("Failed to connect to {host}: {reason}")]
    Connect { host: String, reason: String },

    #[error("Authentication failed for {user}: {reason}")]
    AuthFailed { user: String, reason: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Failed to fetch message {uid}: {reason}")]
    Fetch { uid: u32, reason: String },

    #[error("Mailbox session closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// MIME parsing and transformation errors.
#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Invalid transfer encoding: {0}")]
    Encoding(String),

    #[error("Image transcode failed: {0}")]
    Image(String),
}

/// Outbound delivery errors.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// The server refused one recipient. Sibling recipients continue.
    #[error("Recipient {recipient} rejected: {reason}")]
    Rejected { recipient: String, reason: String },

    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    /// The server refused a step that is not specific to one recipient.
    #[error("Server refused {stage}: {reason}")]
    Refused { stage: &'static str, reason: String },

    /// The session itself is unusable; remaining sends for the message are abandoned.
    #[error("Outbound session failed: {0}")]
    SessionLost(String),

    #[error("Outbound session timed out after {0:?}")]
    Timeout(Duration),
}

impl DeliveryError {
    /// Whether this failure only concerns the single recipient it was raised for.
    pub fn is_recipient_local(&self) -> bool {
        matches!(
            self,
            DeliveryError::Rejected { .. } | DeliveryError::InvalidAddress { .. }
        )
    }
}

/// Why a relay pass stopped early.
///
/// Everything already committed in the pass stays committed; the message
/// named here is retried next pass.
#[derive(Debug, thiserror::Error)]
pub enum PassError {
    #[error("Mailbox unavailable: {0}")]
    Mailbox(#[from] MailboxError),

    #[error("Store unavailable: {0}")]
    Store(#[from] DatabaseError),

    #[error("Outbound transport unavailable: {0}")]
    Transport(DeliveryError),

    #[error("Message {uid} could not be rewritten: {source}")]
    Transform { uid: u32, source: TransformError },

    #[error("Message {uid} delivery aborted: {source}")]
    Delivery { uid: u32, source: DeliveryError },

    #[error("Message {uid} could not be committed: {source}")]
    Commit { uid: u32, source: DatabaseError },
}

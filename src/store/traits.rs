//! Backend-agnostic `RelayStore` trait.

use async_trait::async_trait;

use crate::error::DatabaseError;
use crate::store::model::{Cursor, MessageCommit, Subscriber, SubscriberUpdate, UnsubscribeOutcome};

/// Persistence for the roster and the processing cursor.
#[async_trait]
pub trait RelayStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Cursor ──────────────────────────────────────────────────────

    /// Current processing cursor, if any message was ever handled.
    async fn load_cursor(&self) -> Result<Option<Cursor>, DatabaseError>;

    /// Advance the cursor and apply any roster changes for one message,
    /// atomically. Returns how many subscribers were newly unsubscribed.
    async fn commit_message(&self, commit: &MessageCommit) -> Result<usize, DatabaseError>;

    // ── Roster ──────────────────────────────────────────────────────

    /// Subscribed entries ordered by rank, then insertion order.
    async fn subscribed_roster(&self) -> Result<Vec<Subscriber>, DatabaseError>;

    /// Look up an entry by address (case-insensitive).
    async fn get_subscriber(&self, email: &str) -> Result<Option<Subscriber>, DatabaseError>;

    /// Create an entry with a fresh token, or update the given fields of an
    /// existing one. The token of an existing entry is never changed.
    async fn upsert_subscriber(
        &self,
        email: &str,
        update: &SubscriberUpdate,
    ) -> Result<Subscriber, DatabaseError>;

    /// Mark an entry unsubscribed. Idempotent: an existing
    /// `unsubscribed_at` is kept.
    async fn unsubscribe(&self, email: &str) -> Result<UnsubscribeOutcome, DatabaseError>;
}

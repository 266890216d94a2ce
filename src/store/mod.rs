//! Persistence layer: SQLite-backed roster and processing cursor.

pub mod libsql_backend;
pub mod migrations;
pub mod model;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use model::{
    Cursor, MessageCommit, Subscriber, SubscriberUpdate, SubscriptionState, UnsubscribeOutcome,
};
pub use traits::RelayStore;

//! libSQL backend: async `RelayStore` implementation.
//!
//! Every operation opens its own connection so the unsubscribe endpoint and
//! the relay pass never share transaction state.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::model::{
    Cursor, DEFAULT_RANK, MessageCommit, Subscriber, SubscriberUpdate, SubscriptionState,
    UnsubscribeOutcome,
};
use crate::store::traits::RelayStore;

const CURSOR_AT_KEY: &str = "last_processed_at";
const CURSOR_KEYS_KEY: &str = "last_processed_keys";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SUBSCRIBER_COLUMNS: &str =
    "id, email, name, rank, unsubscribed, token, created_at, updated_at, unsubscribed_at";

/// Flips one subscribed row. `unsubscribed_at` survives a repeat.
const UNSUBSCRIBE_SQL: &str = "UPDATE recipients
    SET unsubscribed = 1, unsubscribed_at = COALESCE(unsubscribed_at, ?1), updated_at = ?1
    WHERE email = ?2 AND unsubscribed = 0";

/// libSQL database backend.
pub struct LibSqlBackend {
    db: Arc<LibSqlDatabase>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self { db: Arc::new(db) };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// A fresh connection with a busy timeout, so concurrent writers wait
    /// instead of failing immediately.
    async fn connect(&self) -> Result<Connection, DatabaseError> {
        let conn = self
            .db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        conn.query(
            &format!("PRAGMA busy_timeout = {}", BUSY_TIMEOUT.as_millis()),
            (),
        )
        .await
        .map_err(|e| DatabaseError::Pool(format!("Failed to set busy timeout: {e}")))?;
        Ok(conn)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// 128 random bits, hex-encoded.
fn new_token() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

fn row_to_subscriber(row: &libsql::Row) -> Result<Subscriber, libsql::Error> {
    let created_str: Option<String> = row.get(6).ok();
    let updated_str: Option<String> = row.get(7).ok();
    let unsubscribed_str: Option<String> = row.get(8).ok();
    let unsubscribed: i64 = row.get(4)?;

    Ok(Subscriber {
        id: row.get(0)?,
        email: row.get::<String>(1)?.to_lowercase(),
        name: row.get::<String>(2).ok(),
        rank: row.get(3)?,
        token: row.get(5)?,
        state: if unsubscribed != 0 {
            SubscriptionState::Unsubscribed
        } else {
            SubscriptionState::Subscribed
        },
        created_at: parse_optional_datetime(&created_str).unwrap_or(DateTime::<Utc>::MIN_UTC),
        updated_at: parse_optional_datetime(&updated_str).unwrap_or(DateTime::<Utc>::MIN_UTC),
        unsubscribed_at: parse_optional_datetime(&unsubscribed_str),
    })
}

async fn collect_subscribers(mut rows: libsql::Rows) -> Result<Vec<Subscriber>, DatabaseError> {
    let mut out = Vec::new();
    while let Some(row) = rows.next().await? {
        out.push(row_to_subscriber(&row)?);
    }
    Ok(out)
}

async fn set_config(conn: &Connection, key: &str, value: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO config (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )
    .await?;
    Ok(())
}

// ── RelayStore implementation ───────────────────────────────────────

#[async_trait]
impl RelayStore for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        migrations::run_migrations(&conn).await
    }

    // ── Cursor ──────────────────────────────────────────────────────

    async fn load_cursor(&self) -> Result<Option<Cursor>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT key, value FROM config WHERE key IN (?1, ?2)",
                params![CURSOR_AT_KEY, CURSOR_KEYS_KEY],
            )
            .await?;

        let mut processed_at = None;
        let mut keys_json = None;
        while let Some(row) = rows.next().await? {
            let key: String = row.get(0)?;
            let value: String = row.get(1)?;
            match key.as_str() {
                CURSOR_AT_KEY => processed_at = Some(value),
                _ => keys_json = Some(value),
            }
        }

        let Some(raw) = processed_at else {
            return Ok(None);
        };
        let processed_at = DateTime::parse_from_rfc3339(raw.trim())
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| {
                DatabaseError::Serialization(format!("Bad {CURSOR_AT_KEY} value {raw:?}: {e}"))
            })?;

        let keys = keys_json.and_then(|json| match serde_json::from_str::<Vec<String>>(&json) {
            Ok(keys) => Some(keys),
            Err(e) => {
                warn!(error = %e, "Unreadable cursor key list, treating cursor as strict");
                None
            }
        });

        Ok(Some(Cursor { processed_at, keys }))
    }

    async fn commit_message(&self, commit: &MessageCommit) -> Result<usize, DatabaseError> {
        let conn = self.connect().await?;
        let tx = conn.transaction().await?;
        let now = Utc::now().to_rfc3339();

        let mut flipped = 0usize;
        for email in &commit.unsubscribe {
            let changed = tx
                .execute(UNSUBSCRIBE_SQL, params![now.clone(), normalize_email(email)])
                .await?;
            flipped += changed as usize;
        }

        set_config(&tx, CURSOR_AT_KEY, &commit.cursor.processed_at.to_rfc3339()).await?;
        match &commit.cursor.keys {
            Some(keys) => {
                let json = serde_json::to_string(keys)
                    .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
                set_config(&tx, CURSOR_KEYS_KEY, &json).await?;
            }
            None => {
                tx.execute(
                    "DELETE FROM config WHERE key = ?1",
                    params![CURSOR_KEYS_KEY],
                )
                .await?;
            }
        }

        tx.commit().await?;
        debug!(
            processed_at = %commit.cursor.processed_at,
            unsubscribed = flipped,
            "Message committed"
        );
        Ok(flipped)
    }

    // ── Roster ──────────────────────────────────────────────────────

    async fn subscribed_roster(&self) -> Result<Vec<Subscriber>, DatabaseError> {
        let conn = self.connect().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT {SUBSCRIBER_COLUMNS} FROM recipients
                     WHERE unsubscribed = 0 ORDER BY rank ASC, id ASC"
                ),
                (),
            )
            .await?;
        collect_subscribers(rows).await
    }

    async fn get_subscriber(&self, email: &str) -> Result<Option<Subscriber>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {SUBSCRIBER_COLUMNS} FROM recipients WHERE email = ?1"),
                params![normalize_email(email)],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_subscriber(&row)?)),
            None => Ok(None),
        }
    }

    async fn upsert_subscriber(
        &self,
        email: &str,
        update: &SubscriberUpdate,
    ) -> Result<Subscriber, DatabaseError> {
        let email = normalize_email(email);
        if email.is_empty() {
            return Err(DatabaseError::Query("Cannot add an empty address".into()));
        }

        let conn = self.connect().await?;
        let now = Utc::now().to_rfc3339();
        let unsubscribed = update.subscribed.map(|s| if s { 0i64 } else { 1i64 });

        conn.execute(
            "INSERT INTO recipients
                (email, name, rank, unsubscribed, token, created_at, updated_at, unsubscribed_at)
             VALUES (?1, ?2, COALESCE(?3, ?4), COALESCE(?5, 0), ?6, ?7, ?7,
                     CASE WHEN ?5 = 1 THEN ?7 END)
             ON CONFLICT(email) DO UPDATE SET
                name = COALESCE(?2, name),
                rank = COALESCE(?3, rank),
                unsubscribed = COALESCE(?5, unsubscribed),
                unsubscribed_at = CASE
                    WHEN ?5 = 1 THEN COALESCE(unsubscribed_at, ?7)
                    WHEN ?5 = 0 THEN NULL
                    ELSE unsubscribed_at
                END,
                updated_at = ?7",
            params![
                email.clone(),
                update.name.clone(),
                update.rank,
                DEFAULT_RANK,
                unsubscribed,
                new_token(),
                now
            ],
        )
        .await?;

        drop(conn);
        self.get_subscriber(&email)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "subscriber".into(),
                id: email,
            })
    }

    async fn unsubscribe(&self, email: &str) -> Result<UnsubscribeOutcome, DatabaseError> {
        let email = normalize_email(email);
        let conn = self.connect().await?;
        let now = Utc::now().to_rfc3339();

        let changed = conn
            .execute(UNSUBSCRIBE_SQL, params![now, email.clone()])
            .await?;
        if changed > 0 {
            info!(email = %email, "Subscriber unsubscribed");
            return Ok(UnsubscribeOutcome::Unsubscribed);
        }

        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM recipients WHERE email = ?1",
                params![email],
            )
            .await?;
        let exists = match rows.next().await? {
            Some(row) => row.get::<i64>(0)? > 0,
            None => false,
        };
        Ok(if exists {
            UnsubscribeOutcome::AlreadyUnsubscribed
        } else {
            UnsubscribeOutcome::NotFound
        })
    }
}

//! Roster and cursor records.

use chrono::{DateTime, Utc};

/// Subscription state of a roster entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Subscribed,
    Unsubscribed,
}

/// One roster entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscriber {
    /// Insertion order; breaks ties between equal ranks.
    pub id: i64,
    /// Lower-cased address.
    pub email: String,
    pub name: Option<String>,
    /// Lower ranks are sent to first.
    pub rank: i64,
    /// Issued once, never rotated by the relay.
    pub token: String,
    pub state: SubscriptionState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub unsubscribed_at: Option<DateTime<Utc>>,
}

impl Subscriber {
    pub fn is_subscribed(&self) -> bool {
        self.state == SubscriptionState::Subscribed
    }
}

/// Fields to apply when creating or updating a roster entry.
/// `None` leaves the stored value alone.
#[derive(Debug, Clone, Default)]
pub struct SubscriberUpdate {
    pub name: Option<String>,
    pub rank: Option<i64>,
    pub subscribed: Option<bool>,
}

/// Result of a self-service or bounce-driven unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsubscribeOutcome {
    Unsubscribed,
    AlreadyUnsubscribed,
    NotFound,
}

/// Rank given to addresses added without one.
pub const DEFAULT_RANK: i64 = 100;

/// The processing watermark.
///
/// `keys` lists the identities of messages already handled at exactly
/// `processed_at`. `None` means the row predates key tracking, in which case
/// anything at `processed_at` counts as handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub processed_at: DateTime<Utc>,
    pub keys: Option<Vec<String>>,
}

impl Cursor {
    /// Whether a message with this timestamp and identity is already handled.
    pub fn covers(&self, received_at: DateTime<Utc>, key: &str) -> bool {
        if received_at < self.processed_at {
            return true;
        }
        if received_at > self.processed_at {
            return false;
        }
        match &self.keys {
            None => true,
            Some(keys) => keys.iter().any(|k| k == key),
        }
    }

    /// The cursor after handling one more message. Never moves backwards.
    pub fn advance(current: Option<&Cursor>, received_at: DateTime<Utc>, key: &str) -> Cursor {
        match current {
            Some(cur) if cur.processed_at > received_at => cur.clone(),
            Some(cur) if cur.processed_at == received_at => {
                let mut keys = cur.keys.clone().unwrap_or_default();
                if !keys.iter().any(|k| k == key) {
                    keys.push(key.to_string());
                }
                Cursor {
                    processed_at: received_at,
                    keys: Some(keys),
                }
            }
            _ => Cursor {
                processed_at: received_at,
                keys: Some(vec![key.to_string()]),
            },
        }
    }
}

/// Everything one inbound message commits, in a single transaction.
#[derive(Debug, Clone)]
pub struct MessageCommit {
    pub cursor: Cursor,
    /// Addresses to flip to unsubscribed (bounce outcome only).
    pub unsubscribe: Vec<String>,
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn cursor_covers_older_messages() {
        let cursor = Cursor {
            processed_at: at(100),
            keys: Some(vec!["<a@x>".into()]),
        };
        assert!(cursor.covers(at(99), "<other@x>"));
        assert!(cursor.covers(at(100), "<a@x>"));
        assert!(!cursor.covers(at(100), "<b@x>"));
        assert!(!cursor.covers(at(101), "<a@x>"));
    }

    #[test]
    fn legacy_cursor_covers_equal_timestamp() {
        let cursor = Cursor {
            processed_at: at(100),
            keys: None,
        };
        assert!(cursor.covers(at(100), "<anything@x>"));
        assert!(!cursor.covers(at(101), "<anything@x>"));
    }

    #[test]
    fn advance_is_monotonic() {
        let first = Cursor::advance(None, at(100), "k1");
        assert_eq!(first.keys, Some(vec!["k1".to_string()]));

        let same_instant = Cursor::advance(Some(&first), at(100), "k2");
        assert_eq!(same_instant.processed_at, at(100));
        assert_eq!(same_instant.keys, Some(vec!["k1".to_string(), "k2".to_string()]));

        let older = Cursor::advance(Some(&same_instant), at(50), "k3");
        assert_eq!(older, same_instant);

        let newer = Cursor::advance(Some(&same_instant), at(200), "k4");
        assert_eq!(newer.processed_at, at(200));
        assert_eq!(newer.keys, Some(vec!["k4".to_string()]));
    }
}

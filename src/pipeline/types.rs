//! Shared types for the relay pipeline.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use mail_parser::{HeaderValue, MessageParser};
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::channels::FetchedMessage;
use crate::error::TransformError;
use crate::mime::{Headers, Part};

static ADDRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9._%+\-=!#$&'*/?^`{|}~]+@[A-Za-z0-9.\-]+[A-Za-z0-9]").unwrap()
});

/// Headers that may name the mailbox a copy was delivered to.
const DELIVERY_CHAIN_HEADERS: &[&str] = &[
    "Delivered-To",
    "X-Original-To",
    "Envelope-To",
    "X-Envelope-To",
    "Resent-To",
    "Resent-Cc",
    "Resent-Bcc",
];

// ── Inbound message ─────────────────────────────────────────────────

/// A fetched message with the views the classifier and transform need.
#[derive(Debug)]
pub struct InboundMessage {
    pub uid: u32,
    pub received_at: DateTime<Utc>,
    /// Identity at the cursor: Message-ID, or a hash of the raw bytes.
    pub key: String,
    pub raw: Vec<u8>,
    /// `From` rendered as `Name <addr>, ...`.
    pub from_header: String,
    /// First `From` address, lower-cased.
    pub sender: Option<String>,
    /// Decoded subject, for logs.
    pub subject: Option<String>,
    /// Every address found in To/Cc/Bcc and the delivery-chain headers,
    /// lower-cased.
    pub recipients: Vec<String>,
    /// Our own tree; an error here only matters when the message must be
    /// rewritten.
    pub tree: Result<Part, TransformError>,
}

impl InboundMessage {
    pub fn parse(fetched: FetchedMessage) -> Self {
        let key = message_key(&fetched.raw);
        let tree = Part::parse_message(&fetched.raw);

        let mut from_header = String::new();
        let mut sender = None;
        let mut subject = None;
        let mut recipients = Vec::new();

        if let Some(parsed) = MessageParser::default().parse(&fetched.raw) {
            if let Some(from) = parsed.from() {
                from_header = render_addresses(from);
                sender = from
                    .first()
                    .and_then(|a| a.address())
                    .map(|s| s.to_lowercase());
            }
            subject = parsed.subject().map(|s| s.to_string());

            for field in [parsed.to(), parsed.cc(), parsed.bcc()] {
                recipients.extend(extract_addresses(field));
            }
            for header in parsed.headers() {
                let name = header.name();
                if DELIVERY_CHAIN_HEADERS
                    .iter()
                    .any(|h| h.eq_ignore_ascii_case(name))
                {
                    recipients.extend(addresses_in_value(header.value()));
                }
            }
        }

        for addr in &mut recipients {
            *addr = addr.to_lowercase();
        }
        recipients.sort();
        recipients.dedup();

        Self {
            uid: fetched.uid,
            received_at: fetched.received_at,
            key,
            raw: fetched.raw,
            from_header,
            sender,
            subject,
            recipients,
            tree,
        }
    }
}

/// Message-ID when the header block has one, else `sha256:<hex>` of the
/// raw bytes.
pub fn message_key(raw: &[u8]) -> String {
    Headers::parse(raw)
        .ok()
        .and_then(|(headers, _, _)| headers.get("Message-ID"))
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| format!("sha256:{}", hex::encode(Sha256::digest(raw))))
}

/// Extract email addresses from an optional mail_parser Address field.
fn extract_addresses(addr: Option<&mail_parser::Address>) -> Vec<String> {
    let Some(addr) = addr else {
        return Vec::new();
    };
    match addr {
        mail_parser::Address::List(addrs) => addrs
            .iter()
            .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            .collect(),
        mail_parser::Address::Group(groups) => groups
            .iter()
            .flat_map(|g| {
                g.addresses
                    .iter()
                    .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            })
            .collect(),
    }
}

fn addresses_in_value(value: &HeaderValue<'_>) -> Vec<String> {
    match value {
        HeaderValue::Address(addr) => extract_addresses(Some(addr)),
        HeaderValue::Text(text) => addresses_in_text(text),
        HeaderValue::TextList(list) => list.iter().flat_map(|t| addresses_in_text(t)).collect(),
        _ => Vec::new(),
    }
}

fn addresses_in_text(text: &str) -> Vec<String> {
    ADDRESS
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .collect()
}

fn render_addresses(addr: &mail_parser::Address) -> String {
    let render = |a: &mail_parser::Addr| match (a.name(), a.address()) {
        (Some(name), Some(address)) => format!("{name} <{address}>"),
        (None, Some(address)) => address.to_string(),
        (Some(name), None) => name.to_string(),
        (None, None) => String::new(),
    };
    let parts: Vec<String> = match addr {
        mail_parser::Address::List(addrs) => addrs.iter().map(render).collect(),
        mail_parser::Address::Group(groups) => groups
            .iter()
            .flat_map(|g| g.addresses.iter().map(render))
            .collect(),
    };
    parts.join(", ")
}

// ── Classification ──────────────────────────────────────────────────

/// What a pass does with one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// At or behind the cursor. Nothing happens, the cursor stays put.
    Discard,
    /// Not from a broadcaster and not a bounce. Only the cursor moves.
    Ignored,
    /// A delivery status notification.
    Bounce,
    /// Broadcast addressed to a test mailbox; goes back to `sender` only.
    TestProbe { sender: String },
    Broadcast,
}

impl Classification {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Discard => "discard",
            Self::Ignored => "ignored",
            Self::Bounce => "bounce",
            Self::TestProbe { .. } => "test_probe",
            Self::Broadcast => "broadcast",
        }
    }
}

// ── Bounces ─────────────────────────────────────────────────────────

/// One recipient block of a delivery status report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BounceReport {
    /// Lower-cased, type prefix and angle brackets removed.
    pub address: String,
    pub action: Option<String>,
    pub status: Option<String>,
}

/// Which DSN field named the address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BounceRecipient {
    Final(BounceReport),
    Original(BounceReport),
}

impl BounceRecipient {
    pub fn report(&self) -> &BounceReport {
        match self {
            Self::Final(report) | Self::Original(report) => report,
        }
    }

    pub fn address(&self) -> &str {
        &self.report().address
    }

    pub fn field(&self) -> &'static str {
        match self {
            Self::Final(_) => "Final-Recipient",
            Self::Original(_) => "Original-Recipient",
        }
    }
}

// ── Outcomes ────────────────────────────────────────────────────────

/// Terminal state of one message within a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    Discarded,
    Ignored,
    BounceApplied { reported: usize, unsubscribed: usize },
    TestRelayed { to: String, delivered: bool },
    BroadcastSent { sent: usize, rejected: usize },
}

/// Tally of one relay pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub listed: usize,
    pub fetch_failures: usize,
    pub discarded: usize,
    pub ignored: usize,
    pub bounces: usize,
    pub unsubscribed: usize,
    pub test_probes: usize,
    pub broadcasts: usize,
    pub sent: usize,
    pub rejected: usize,
}

impl PassReport {
    pub fn record(&mut self, outcome: &MessageOutcome) {
        match outcome {
            MessageOutcome::Discarded => self.discarded += 1,
            MessageOutcome::Ignored => self.ignored += 1,
            MessageOutcome::BounceApplied { unsubscribed, .. } => {
                self.bounces += 1;
                self.unsubscribed += unsubscribed;
            }
            MessageOutcome::TestRelayed { delivered, .. } => {
                self.test_probes += 1;
                if *delivered {
                    self.sent += 1;
                } else {
                    self.rejected += 1;
                }
            }
            MessageOutcome::BroadcastSent { sent, rejected } => {
                self.broadcasts += 1;
                self.sent += sent;
                self.rejected += rejected;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn fetched(raw: &[u8]) -> FetchedMessage {
        FetchedMessage {
            uid: 1,
            raw: raw.to_vec(),
            received_at: Utc.with_ymd_and_hms(2026, 5, 1, 8, 0, 0).unwrap(),
        }
    }

    #[test]
    fn key_prefers_message_id() {
        let raw = b"Message-ID: <abc@x.com>\r\nSubject: hi\r\n\r\nbody";
        assert_eq!(message_key(raw), "<abc@x.com>");
    }

    #[test]
    fn key_falls_back_to_hash() {
        let a = message_key(b"Subject: one\r\n\r\nbody");
        let b = message_key(b"Subject: two\r\n\r\nbody");
        assert!(a.starts_with("sha256:"));
        assert_eq!(a.len(), "sha256:".len() + 64);
        assert_ne!(a, b);
    }

    #[test]
    fn parse_collects_sender_and_recipients() {
        let raw = b"From: Owner <Owner@X.com>\r\n\
To: list@x.com\r\n\
Cc: \"Team\" <team@x.com>\r\n\
Delivered-To: owner+test@x.com\r\n\
Subject: Hello\r\n\
\r\n\
body\r\n";
        let msg = InboundMessage::parse(fetched(raw));
        assert_eq!(msg.sender.as_deref(), Some("owner@x.com"));
        assert!(msg.from_header.contains("Owner@X.com"));
        assert_eq!(msg.subject.as_deref(), Some("Hello"));
        assert!(msg.recipients.contains(&"list@x.com".to_string()));
        assert!(msg.recipients.contains(&"team@x.com".to_string()));
        assert!(msg.recipients.contains(&"owner+test@x.com".to_string()));
        assert!(msg.tree.is_ok());
    }

    #[test]
    fn report_tallies_outcomes() {
        let mut report = PassReport::default();
        report.record(&MessageOutcome::Discarded);
        report.record(&MessageOutcome::BroadcastSent { sent: 3, rejected: 1 });
        report.record(&MessageOutcome::BounceApplied {
            reported: 2,
            unsubscribed: 1,
        });
        report.record(&MessageOutcome::TestRelayed {
            to: "a@x.com".into(),
            delivered: true,
        });
        assert_eq!(report.discarded, 1);
        assert_eq!(report.broadcasts, 1);
        assert_eq!(report.sent, 4);
        assert_eq!(report.rejected, 1);
        assert_eq!(report.unsubscribed, 1);
        assert_eq!(report.test_probes, 1);
    }
}

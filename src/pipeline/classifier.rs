//! Message classifier: cursor check, bounce detection, sender allowlist,
//! test-probe detection. Pure; no I/O.

use tracing::{debug, warn};

use crate::config::RelayConfig;
use crate::mime::Part;
use crate::pipeline::types::{Classification, InboundMessage};
use crate::store::Cursor;

/// Content types that carry a machine-readable delivery report.
pub(crate) const DSN_CONTENT_TYPES: &[&str] =
    &["message/delivery-status", "message/global-delivery-status"];

/// Subject fragments that mark a bounce when no report part is present.
const BOUNCE_SUBJECT_HINTS: &[&str] = &["undelivered", "delivery status notification"];

#[derive(Debug, Clone)]
pub struct Classifier {
    /// Lower-cased broadcaster fragments.
    allowed_senders: Vec<String>,
    /// Lower-cased local-part marker.
    test_marker: String,
    subject_fallback: bool,
}

impl Classifier {
    pub fn new(allowed_senders: &[String], test_marker: &str, subject_fallback: bool) -> Self {
        Self {
            allowed_senders: allowed_senders
                .iter()
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
            test_marker: test_marker.trim().to_lowercase(),
            subject_fallback,
        }
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(
            &config.allowed_senders,
            &config.test_marker,
            config.bounce_subject_fallback,
        )
    }

    /// Decide what to do with one message. The cursor check runs first and
    /// short-circuits everything else.
    pub fn classify(&self, msg: &InboundMessage, cursor: Option<&Cursor>) -> Classification {
        if cursor.is_some_and(|c| c.covers(msg.received_at, &msg.key)) {
            return Classification::Discard;
        }

        if self.is_bounce(msg) {
            return Classification::Bounce;
        }

        if !self.is_allowed(&msg.from_header) {
            debug!(uid = msg.uid, from = %msg.from_header, "Sender not on the broadcaster list");
            return Classification::Ignored;
        }

        if let Some(probe) = self.test_recipient(&msg.recipients) {
            return match &msg.sender {
                Some(sender) => {
                    debug!(uid = msg.uid, probe, "Test probe detected");
                    Classification::TestProbe {
                        sender: sender.clone(),
                    }
                }
                None => {
                    warn!(uid = msg.uid, probe, "Test probe without a sender address");
                    Classification::Ignored
                }
            };
        }

        Classification::Broadcast
    }

    /// Structural report markers first, then (optionally) the subject.
    pub fn is_bounce(&self, msg: &InboundMessage) -> bool {
        if let Ok(tree) = &msg.tree
            && has_delivery_report(tree)
        {
            return true;
        }
        self.subject_fallback
            && msg.subject.as_deref().is_some_and(|subject| {
                let subject = subject.to_lowercase();
                BOUNCE_SUBJECT_HINTS.iter().any(|hint| subject.contains(hint))
            })
    }

    /// Case-insensitive substring match of any broadcaster against `From`.
    pub fn is_allowed(&self, from_header: &str) -> bool {
        let from = from_header.to_lowercase();
        self.allowed_senders.iter().any(|s| from.contains(s.as_str()))
    }

    /// First recipient whose local part carries the test marker.
    pub fn test_recipient<'a>(&self, recipients: &'a [String]) -> Option<&'a str> {
        if self.test_marker.is_empty() {
            return None;
        }
        recipients
            .iter()
            .map(String::as_str)
            .find(|addr| match addr.rsplit_once('@') {
                Some((local, _)) => local.to_lowercase().contains(&self.test_marker),
                None => false,
            })
    }
}

/// `multipart/report; report-type=delivery-status` at the top, or a
/// delivery-status part anywhere.
fn has_delivery_report(tree: &Part) -> bool {
    let root = tree.content_type();
    if root.value() == "multipart/report"
        && root
            .param("report-type")
            .is_some_and(|t| t.eq_ignore_ascii_case("delivery-status"))
    {
        return true;
    }
    tree.walk()
        .iter()
        .any(|part| DSN_CONTENT_TYPES.contains(&part.content_type().value()))
}

//! Bounce processor: pulls failed recipients out of delivery reports.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::mime::header::line_end;
use crate::mime::{Headers, Part};
use crate::pipeline::classifier::DSN_CONTENT_TYPES;
use crate::pipeline::types::{BounceRecipient, BounceReport};

/// Every `Final-Recipient` / `Original-Recipient` named in the message's
/// delivery-status parts, deduplicated case-insensitively.
pub fn extract_recipients(tree: &Part) -> Vec<BounceRecipient> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    for part in tree.walk() {
        if !DSN_CONTENT_TYPES.contains(&part.content_type().value()) {
            continue;
        }
        let body = match part.decoded_body() {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "Unreadable delivery-status part");
                continue;
            }
        };

        for block in field_blocks(&body) {
            let headers = match Headers::parse(&block) {
                Ok((headers, _, _)) => headers,
                Err(e) => {
                    debug!(error = %e, "Skipping malformed delivery-status block");
                    continue;
                }
            };
            let action = headers.get("Action").map(|v| v.trim().to_lowercase());
            let status = headers.get("Status").map(|v| v.trim().to_string());

            let fields: [(&str, fn(BounceReport) -> BounceRecipient); 2] = [
                ("Final-Recipient", BounceRecipient::Final),
                ("Original-Recipient", BounceRecipient::Original),
            ];
            for (field, wrap) in fields {
                for value in headers.get_all(field) {
                    let Some(address) = recipient_address(&value) else {
                        continue;
                    };
                    if seen.insert(address.clone()) {
                        out.push(wrap(BounceReport {
                            address,
                            action: action.clone(),
                            status: status.clone(),
                        }));
                    }
                }
            }
        }
    }

    out
}

/// `rfc822; <User@Host>` → `user@host`.
fn recipient_address(value: &str) -> Option<String> {
    let address = value.split_once(';').map_or(value, |(_, rest)| rest);
    let address = address
        .trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .trim()
        .to_lowercase();
    (address.contains('@')).then_some(address)
}

/// Split a delivery-status body into its blank-line separated field groups.
fn field_blocks(body: &[u8]) -> Vec<Vec<u8>> {
    let mut blocks = Vec::new();
    let mut current = Vec::new();
    let mut pos = 0;
    while pos < body.len() {
        let end = line_end(body, pos);
        let line = &body[pos..end];
        if line.iter().all(|b| b.is_ascii_whitespace()) {
            if !current.is_empty() {
                blocks.push(std::mem::take(&mut current));
            }
        } else {
            current.extend_from_slice(line);
        }
        pos = end;
    }
    if !current.is_empty() {
        blocks.push(current);
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(body: &str) -> Part {
        let raw = format!(
            "Content-Type: multipart/report; report-type=delivery-status; boundary=R\r\n\
\r\n\
--R\r\n\
Content-Type: text/plain\r\n\
\r\n\
Delivery failed.\r\n\
--R\r\n\
Content-Type: message/delivery-status\r\n\
\r\n\
{body}\r\n\
--R--\r\n"
        );
        Part::parse_message(raw.as_bytes()).unwrap()
    }

    #[test]
    fn extracts_final_recipient_with_status() {
        let tree = report(
            "Reporting-MTA: dns; mx.example\r\n\
\r\n\
Final-Recipient: rfc822; A@X.com\r\n\
Action: failed\r\n\
Status: 5.1.1",
        );
        let recipients = extract_recipients(&tree);
        assert_eq!(
            recipients,
            vec![BounceRecipient::Final(BounceReport {
                address: "a@x.com".into(),
                action: Some("failed".into()),
                status: Some("5.1.1".into()),
            })]
        );
        assert_eq!(recipients[0].field(), "Final-Recipient");
    }

    #[test]
    fn original_and_final_deduplicated() {
        let tree = report(
            "Reporting-MTA: dns; mx.example\r\n\
\r\n\
Original-Recipient: rfc822;a@x.com\r\n\
Final-Recipient: rfc822; <A@x.com>\r\n\
Action: failed\r\n\
\r\n\
Original-Recipient: rfc822; b@x.com\r\n\
Final-Recipient: rfc822; b-alias@x.com\r\n\
Action: delayed",
        );
        let addresses: Vec<String> = extract_recipients(&tree)
            .iter()
            .map(|r| r.address().to_string())
            .collect();
        assert_eq!(addresses, vec!["a@x.com", "b-alias@x.com", "b@x.com"]);
    }

    #[test]
    fn original_only_is_tagged_original() {
        let tree = report("Original-Recipient: rfc822; c@x.com\r\nAction: failed");
        let recipients = extract_recipients(&tree);
        assert!(matches!(&recipients[..], [BounceRecipient::Original(r)] if r.address == "c@x.com"));
    }

    #[test]
    fn no_report_part_no_recipients() {
        let tree = Part::parse_message(b"Subject: Undelivered\r\n\r\nFinal-Recipient: rfc822; a@x.com\r\n").unwrap();
        assert!(extract_recipients(&tree).is_empty());
    }

    #[test]
    fn recipient_address_forms() {
        assert_eq!(recipient_address("rfc822; User@Host.com"), Some("user@host.com".into()));
        assert_eq!(recipient_address("<x@y.z>"), Some("x@y.z".into()));
        assert_eq!(recipient_address("rfc822; "), None);
    }
}

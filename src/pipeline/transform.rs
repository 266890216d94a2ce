//! Transform engine: turns one inbound broadcast into per-recipient copies.
//!
//! The image step runs once per message in [`TransformEngine::prepare`]; the
//! header rewrite and unsubscribe notice run per recipient on a clone of the
//! prepared tree. Everything outside the touched headers and text leaves is
//! written back byte-for-byte.

use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::config::{ReplyToMode, TransformConfig};
use crate::error::TransformError;
use crate::mime::Part;
use crate::mime::encoding::{decode_text, encode_text};
use crate::pipeline::images::ImageTranscoder;
use crate::signing::UnsubscribeSigner;
use crate::store::Subscriber;

static BODY_CLOSE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)</body\s*>").unwrap());

pub struct TransformEngine {
    config: TransformConfig,
    signer: UnsubscribeSigner,
    images: ImageTranscoder,
}

impl TransformEngine {
    pub fn new(config: &TransformConfig, signer: UnsubscribeSigner) -> Self {
        Self {
            images: ImageTranscoder::new(config.max_image_width),
            config: config.clone(),
            signer,
        }
    }

    /// Recipient-independent work: shrink oversized images.
    pub fn prepare(&self, tree: &Part) -> Part {
        let mut prepared = tree.clone();
        let rewritten = self.images.transcode_tree(&mut prepared);
        if rewritten > 0 {
            debug!(images = rewritten, "Images re-encoded");
        }
        prepared
    }

    /// The copy one subscriber receives.
    pub fn broadcast(
        &self,
        prepared: &Part,
        recipient: &Subscriber,
    ) -> Result<Vec<u8>, TransformError> {
        let link = self.signer.link(&recipient.email, &recipient.token);
        let mut message = prepared.clone();

        message.headers.set("To", &recipient.email);
        message.headers.set("From", &self.config.from_header);
        if self.config.reply_to == ReplyToMode::List {
            message.headers.set("Reply-To", &self.config.from_header);
        }
        message.headers.set("List-Unsubscribe", &format!("<{link}>"));

        append_notice(&mut message, &link)?;
        Ok(message.to_bytes())
    }

    /// The copy a test probe sends back to its author. No unsubscribe link.
    pub fn test_probe(&self, prepared: &Part, sender: &str) -> Vec<u8> {
        let mut message = prepared.clone();
        message.headers.set("To", sender);
        message.headers.set("From", &self.config.from_header);

        let marker = &self.config.subject_marker;
        let subject = match message.headers.get("Subject") {
            Some(subject) if !subject.is_empty() => format!("{marker} {subject}"),
            _ => marker.clone(),
        };
        message.headers.set("Subject", &subject);
        message.to_bytes()
    }
}

// ── Unsubscribe notice ──────────────────────────────────────────────

#[derive(Clone, Copy)]
enum TextKind {
    Plain,
    Html,
}

/// Add the notice to every inline text leaf. Attachments are skipped.
fn append_notice(message: &mut Part, link: &str) -> Result<(), TransformError> {
    let mut failure = None;
    message.for_each_leaf_mut(&mut |part| {
        if failure.is_some() || part.is_attachment() {
            return;
        }
        let content_type = part.content_type();
        let kind = match content_type.value() {
            "text/plain" => TextKind::Plain,
            "text/html" => TextKind::Html,
            _ => return,
        };
        let charset = content_type.param("charset").map(str::to_string);
        if let Err(e) = rewrite_text(part, kind, charset.as_deref(), link) {
            failure = Some(e);
        }
    });
    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn rewrite_text(
    part: &mut Part,
    kind: TextKind,
    charset: Option<&str>,
    link: &str,
) -> Result<(), TransformError> {
    let (text, encoding) = decode_text(&part.decoded_body()?, charset);
    let eol = part.headers.line_ending().as_str();
    let text = match kind {
        TextKind::Plain => plain_notice(&text, link, eol),
        TextKind::Html => html_notice(&text, link),
    };
    part.set_decoded_body(&encode_text(&text, encoding));
    Ok(())
}

fn plain_notice(text: &str, link: &str, eol: &str) -> String {
    format!("{text}{eol}{eol}Unsubscribe: {link}{eol}")
}

fn html_notice(html: &str, link: &str) -> String {
    let href = link.replace('&', "&amp;");
    let notice = format!("<br><br><p>Unsubscribe: <a href=\"{href}\">{href}</a></p>");
    match BODY_CLOSE.find_iter(html).last() {
        Some(close) => format!("{}{notice}{}", &html[..close.start()], &html[close.start()..]),
        None => format!("{html}{notice}"),
    }
}

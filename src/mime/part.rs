//! The MIME part tree.
//!
//! Leaves hold their body exactly as it appeared on the wire (still
//! transfer-encoded). Multipart bodies remember their preamble, delimiter
//! lines and epilogue byte-for-byte, so an untouched tree serializes back to
//! its input.

use crate::error::TransformError;
use crate::mime::encoding::TransferEncoding;
use crate::mime::header::{Headers, MimeField, line_end, trim_eol};

/// One node of a message: headers plus either a leaf body or child parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    pub headers: Headers,
    separator: Vec<u8>,
    pub body: Body,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Leaf(Vec<u8>),
    Multipart(Multipart),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Multipart {
    preamble: Vec<u8>,
    children: Vec<Child>,
    /// Closing delimiter line and everything after it.
    closing: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Child {
    delimiter: Vec<u8>,
    part: Part,
    /// Line break that belongs to the following delimiter.
    trailer: Vec<u8>,
}

impl Part {
    /// Parse a full message or body part.
    pub fn parse(data: &[u8]) -> Result<Self, TransformError> {
        let (headers, separator, rest) = Headers::parse(data)?;
        let content_type = content_type_of(&headers);

        let body = if content_type.main_type() == "multipart" {
            let boundary = content_type.param("boundary").ok_or_else(|| {
                TransformError::Malformed(format!(
                    "{} part without a boundary",
                    content_type.value()
                ))
            })?;
            Body::Multipart(Multipart::parse(boundary, rest)?)
        } else {
            Body::Leaf(rest.to_vec())
        };

        Ok(Self {
            headers,
            separator,
            body,
        })
    }

    /// Parse a top-level message, which must carry at least one header.
    pub fn parse_message(data: &[u8]) -> Result<Self, TransformError> {
        let part = Self::parse(data)?;
        if part.headers.is_empty() {
            return Err(TransformError::Malformed("message has no headers".into()));
        }
        Ok(part)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write_to(&mut out);
        out
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        self.headers.write_to(out);
        out.extend_from_slice(&self.separator);
        match &self.body {
            Body::Leaf(bytes) => out.extend_from_slice(bytes),
            Body::Multipart(multi) => multi.write_to(out),
        }
    }

    /// `Content-Type`, defaulting to `text/plain` as RFC 2045 does.
    pub fn content_type(&self) -> MimeField {
        content_type_of(&self.headers)
    }

    pub fn disposition(&self) -> Option<MimeField> {
        self.headers
            .get("Content-Disposition")
            .map(|v| MimeField::parse(&v))
    }

    pub fn is_attachment(&self) -> bool {
        self.disposition()
            .is_some_and(|d| d.value() == "attachment")
    }

    pub fn transfer_encoding(&self) -> TransferEncoding {
        TransferEncoding::parse(self.headers.get("Content-Transfer-Encoding").as_deref())
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.body, Body::Leaf(_))
    }

    /// Leaf body with the transfer encoding removed.
    pub fn decoded_body(&self) -> Result<Vec<u8>, TransformError> {
        match &self.body {
            Body::Leaf(bytes) => self.transfer_encoding().decode(bytes),
            Body::Multipart(_) => Err(TransformError::Malformed(
                "cannot decode a multipart body".into(),
            )),
        }
    }

    /// Replace the leaf body, encoding it with the part's current
    /// `Content-Transfer-Encoding`.
    pub fn set_decoded_body(&mut self, data: &[u8]) {
        let eol = self.headers.line_ending().as_str();
        let encoded = self.transfer_encoding().encode(data, eol);
        if self.separator.is_empty() {
            self.separator = eol.as_bytes().to_vec();
        }
        self.body = Body::Leaf(encoded);
    }

    /// Every part in the tree, depth first, the root included.
    pub fn walk(&self) -> Vec<&Part> {
        let mut out = vec![self];
        if let Body::Multipart(multi) = &self.body {
            for child in &multi.children {
                out.extend(child.part.walk());
            }
        }
        out
    }

    /// Visit every leaf part mutably, depth first.
    pub fn for_each_leaf_mut<F>(&mut self, f: &mut F)
    where
        F: FnMut(&mut Part),
    {
        if self.is_leaf() {
            f(self);
            return;
        }
        if let Body::Multipart(multi) = &mut self.body {
            for child in &mut multi.children {
                child.part.for_each_leaf_mut(f);
            }
        }
    }
}

impl Multipart {
    fn parse(boundary: &str, body: &[u8]) -> Result<Self, TransformError> {
        let dash = format!("--{boundary}").into_bytes();

        // (line start, line end, is closing)
        let mut delimiters: Vec<(usize, usize, bool)> = Vec::new();
        let mut pos = 0;
        while pos < body.len() {
            let end = line_end(body, pos);
            let line = trim_eol(&body[pos..end]);
            if let Some(rest) = line.strip_prefix(dash.as_slice()) {
                if let Some(after) = rest.strip_prefix(b"--") {
                    if is_padding(after) {
                        delimiters.push((pos, end, true));
                        break;
                    }
                } else if is_padding(rest) {
                    delimiters.push((pos, end, false));
                }
            }
            pos = end;
        }

        let Some(&(first_start, _, first_closing)) = delimiters.first() else {
            return Err(TransformError::Malformed(format!(
                "no delimiter for boundary {boundary:?}"
            )));
        };
        if first_closing {
            return Err(TransformError::Malformed(format!(
                "multipart with boundary {boundary:?} has no parts"
            )));
        }

        let mut children = Vec::new();
        let mut closing = Vec::new();
        for (i, &(start, end, is_closing)) in delimiters.iter().enumerate() {
            if is_closing {
                closing = body[start..].to_vec();
                break;
            }
            let (content_end, trailer) = match delimiters.get(i + 1) {
                Some(&(next_start, _, _)) => {
                    let span = &body[end..next_start];
                    let eol_len = span.len() - trim_eol(span).len();
                    (next_start - eol_len, body[next_start - eol_len..next_start].to_vec())
                }
                None => (body.len(), Vec::new()),
            };
            let content_end = content_end.max(end);
            children.push(Child {
                delimiter: body[start..end].to_vec(),
                part: Part::parse(&body[end..content_end])?,
                trailer,
            });
        }

        Ok(Self {
            preamble: body[..first_start].to_vec(),
            children,
            closing,
        })
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.preamble);
        for child in &self.children {
            out.extend_from_slice(&child.delimiter);
            child.part.write_to(out);
            out.extend_from_slice(&child.trailer);
        }
        out.extend_from_slice(&self.closing);
    }
}

fn content_type_of(headers: &Headers) -> MimeField {
    headers
        .get("Content-Type")
        .map(|v| MimeField::parse(&v))
        .filter(|f| f.value().contains('/'))
        .unwrap_or_else(|| MimeField::parse("text/plain"))
}

fn is_padding(bytes: &[u8]) -> bool {
    bytes.iter().all(|&b| b == b' ' || b == b'\t')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn children(part: &Part) -> Vec<&Part> {
        match &part.body {
            Body::Leaf(_) => Vec::new(),
            Body::Multipart(multi) => multi.children.iter().map(|c| &c.part).collect(),
        }
    }

    const MIXED: &[u8] = b"From: owner@x.com\r\n\
Subject: hi\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"XYZ\"\r\n\
\r\n\
This is a preamble.\r\n\
--XYZ\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
Hello there\r\n\
--XYZ\r\n\
Content-Type: multipart/alternative; boundary=inner\r\n\
\r\n\
--inner\r\n\
Content-Type: text/html\r\n\
\r\n\
<p>Hi</p>\r\n\
--inner--\r\n\
--XYZ--\r\n\
epilogue\r\n";

    #[test]
    fn untouched_tree_round_trips() {
        let part = Part::parse_message(MIXED).unwrap();
        assert_eq!(part.to_bytes(), MIXED);
    }

    #[test]
    fn walk_visits_all_parts() {
        let part = Part::parse_message(MIXED).unwrap();
        let types: Vec<String> = part
            .walk()
            .iter()
            .map(|p| p.content_type().value().to_string())
            .collect();
        assert_eq!(
            types,
            vec![
                "multipart/mixed",
                "text/plain",
                "multipart/alternative",
                "text/html"
            ]
        );
        assert_eq!(children(&part).len(), 2);
    }

    #[test]
    fn leaf_body_excludes_delimiter_line_break() {
        let part = Part::parse_message(MIXED).unwrap();
        let text = children(&part)[0];
        assert_eq!(text.decoded_body().unwrap(), b"Hello there");
    }

    #[test]
    fn editing_one_leaf_leaves_siblings_alone() {
        let mut part = Part::parse_message(MIXED).unwrap();
        part.for_each_leaf_mut(&mut |leaf| {
            if leaf.content_type().value() == "text/plain" {
                leaf.set_decoded_body(b"Changed");
            }
        });
        let out = String::from_utf8(part.to_bytes()).unwrap();
        assert!(out.contains("\r\n\r\nChanged\r\n--XYZ\r\n"));
        assert!(out.contains("<p>Hi</p>\r\n--inner--"));
        assert!(out.ends_with("--XYZ--\r\nepilogue\r\n"));
    }

    #[test]
    fn missing_boundary_is_malformed() {
        let data = b"Content-Type: multipart/mixed\r\n\r\nbody";
        assert!(matches!(
            Part::parse_message(data),
            Err(TransformError::Malformed(_))
        ));
    }

    #[test]
    fn boundary_never_seen_is_malformed() {
        let data = b"Content-Type: multipart/mixed; boundary=abc\r\n\r\n--abd\r\n\r\nx";
        assert!(Part::parse_message(data).is_err());
    }

    #[test]
    fn unterminated_multipart_still_round_trips() {
        let data = b"Content-Type: multipart/mixed; boundary=b\n\n--b\nContent-Type: text/plain\n\ntext\n";
        let part = Part::parse_message(data).unwrap();
        assert_eq!(part.to_bytes(), data);
    }

    #[test]
    fn single_part_message() {
        let data = b"From: a@x.com\nContent-Transfer-Encoding: base64\n\naGVsbG8=\n";
        let part = Part::parse_message(data).unwrap();
        assert!(part.is_leaf());
        assert_eq!(part.content_type().value(), "text/plain");
        assert_eq!(part.decoded_body().unwrap(), b"hello");
    }
}

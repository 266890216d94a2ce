//! Ordered, case-insensitive header fields that keep their wire bytes.
//!
//! A field that is never touched serializes back exactly as it was read,
//! folding and all. Replacing a field keeps its position; adding one
//! appends at the end of the block.

use std::fmt;

use crate::error::TransformError;

/// Line terminator used when rendering new fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineEnding {
    #[default]
    CrLf,
    Lf,
}

impl LineEnding {
    pub fn as_str(self) -> &'static str {
        match self {
            LineEnding::CrLf => "\r\n",
            LineEnding::Lf => "\n",
        }
    }

    fn of(line: &[u8]) -> Option<Self> {
        if line.ends_with(b"\r\n") {
            Some(LineEnding::CrLf)
        } else if line.ends_with(b"\n") {
            Some(LineEnding::Lf)
        } else {
            None
        }
    }
}

/// A single header field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    name: String,
    raw: Vec<u8>,
}

impl Header {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The unfolded, trimmed field body.
    pub fn value(&self) -> String {
        let colon = self.raw.iter().position(|&b| b == b':').unwrap_or(0);
        let body = &self.raw[(colon + 1).min(self.raw.len())..];
        let unfolded: Vec<u8> = body
            .iter()
            .copied()
            .filter(|&b| b != b'\r' && b != b'\n')
            .collect();
        String::from_utf8_lossy(&unfolded).trim().to_string()
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// Header block of one MIME part.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    fields: Vec<Header>,
    eol: LineEnding,
}

impl Headers {
    pub fn new(eol: LineEnding) -> Self {
        Self {
            fields: Vec::new(),
            eol,
        }
    }

    pub fn line_ending(&self) -> LineEnding {
        self.eol
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<String> {
        self.fields.iter().find(|h| h.is(name)).map(Header::value)
    }

    /// Every value for `name`, in order.
    pub fn get_all(&self, name: &str) -> Vec<String> {
        self.fields
            .iter()
            .filter(|h| h.is(name))
            .map(Header::value)
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|h| h.is(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.fields.iter()
    }

    /// Replace the first `name` field in place, or append one.
    ///
    /// Later fields with the same name are dropped so exactly one remains.
    pub fn set(&mut self, name: &str, value: &str) {
        let field = Header {
            name: name.to_string(),
            raw: format!("{name}: {value}{}", self.eol.as_str()).into_bytes(),
        };
        match self.fields.iter().position(|h| h.is(name)) {
            Some(first) => {
                self.fields[first] = field;
                let mut index = 0;
                self.fields.retain(|h| {
                    let keep = index <= first || !h.is(name);
                    index += 1;
                    keep
                });
            }
            None => self.fields.push(field),
        }
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        for field in &self.fields {
            out.extend_from_slice(&field.raw);
        }
    }

    /// Parse a header block off the front of `data`.
    ///
    /// Returns the headers, the raw blank line that ended the block (empty if
    /// the data ran out first) and the remaining body bytes.
    pub fn parse(data: &[u8]) -> Result<(Headers, Vec<u8>, &[u8]), TransformError> {
        let mut fields: Vec<Header> = Vec::new();
        let mut eol = None;
        let mut pos = 0;

        while pos < data.len() {
            let end = line_end(data, pos);
            let line = &data[pos..end];
            let content = trim_eol(line);

            if content.is_empty() {
                let headers = Headers {
                    fields,
                    eol: eol.or_else(|| LineEnding::of(line)).unwrap_or_default(),
                };
                return Ok((headers, line.to_vec(), &data[end..]));
            }

            if eol.is_none() {
                eol = LineEnding::of(line);
            }

            if content[0] == b' ' || content[0] == b'\t' {
                let Some(last) = fields.last_mut() else {
                    return Err(TransformError::Malformed(
                        "continuation line before first header".into(),
                    ));
                };
                last.raw.extend_from_slice(line);
            } else {
                let colon = content.iter().position(|&b| b == b':').ok_or_else(|| {
                    TransformError::Malformed(format!(
                        "invalid header line: {}",
                        String::from_utf8_lossy(&content[..content.len().min(60)])
                    ))
                })?;
                let name = String::from_utf8_lossy(&content[..colon]).trim().to_string();
                if name.is_empty() || name.contains(char::is_whitespace) {
                    return Err(TransformError::Malformed(format!(
                        "invalid header name: {name:?}"
                    )));
                }
                fields.push(Header {
                    name,
                    raw: line.to_vec(),
                });
            }
            pos = end;
        }

        let headers = Headers {
            fields,
            eol: eol.unwrap_or_default(),
        };
        Ok((headers, Vec::new(), &data[data.len()..]))
    }
}

/// Index just past the next `\n` at or after `pos`, or `data.len()`.
pub(crate) fn line_end(data: &[u8], pos: usize) -> usize {
    data[pos..]
        .iter()
        .position(|&b| b == b'\n')
        .map_or(data.len(), |i| pos + i + 1)
}

/// Strip a trailing `\r\n` or `\n`.
pub(crate) fn trim_eol(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// A structured header value such as `Content-Type` or `Content-Disposition`:
/// a primary token followed by `; key=value` parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MimeField {
    value: String,
    params: Vec<(String, String)>,
}

impl MimeField {
    pub fn parse(raw: &str) -> Self {
        let mut segments = split_params(raw).into_iter();
        let value = segments
            .next()
            .map(|s| s.trim().to_ascii_lowercase())
            .unwrap_or_default();
        let params = segments
            .filter_map(|seg| {
                let (key, val) = seg.split_once('=')?;
                let val = val.trim();
                let val = val
                    .strip_prefix('"')
                    .and_then(|v| v.strip_suffix('"'))
                    .map(|v| v.replace("\\\"", "\"").replace("\\\\", "\\"))
                    .unwrap_or_else(|| val.to_string());
                Some((key.trim().to_ascii_lowercase(), val))
            })
            .collect();
        Self { value, params }
    }

    /// Lower-cased primary value, e.g. `multipart/mixed` or `attachment`.
    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn set_value(&mut self, value: &str) {
        self.value = value.to_ascii_lowercase();
    }

    /// Replace a parameter in place if present.
    pub fn replace_param(&mut self, name: &str, value: &str) -> bool {
        match self.params.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
            Some(slot) => {
                slot.1 = value.to_string();
                true
            }
            None => false,
        }
    }

    /// Replace a parameter, or append it when absent.
    pub fn set_param(&mut self, name: &str, value: &str) {
        if !self.replace_param(name, value) {
            self.params.push((name.to_ascii_lowercase(), value.to_string()));
        }
    }

    pub fn main_type(&self) -> &str {
        self.value.split('/').next().unwrap_or("")
    }
}

impl fmt::Display for MimeField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)?;
        for (key, val) in &self.params {
            let escaped = val.replace('\\', "\\\\").replace('"', "\\\"");
            write!(f, "; {key}=\"{escaped}\"")?;
        }
        Ok(())
    }
}

/// Split on `;` outside double quotes.
fn split_params(raw: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    let mut escaped = false;
    for (i, ch) in raw.char_indices() {
        match ch {
            _ if escaped => escaped = false,
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            ';' if !in_quotes => {
                out.push(&raw[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(&raw[start..]);
    out.into_iter().filter(|s| !s.trim().is_empty()).collect()
}

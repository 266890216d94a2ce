//! Content-Transfer-Encoding and charset helpers.

use std::fmt::Write as _;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::error::TransformError;

/// Maximum encoded line length for base64 and quoted-printable bodies.
const MAX_LINE_LENGTH: usize = 76;

/// Transfer encodings we know how to reverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEncoding {
    Base64,
    QuotedPrintable,
    /// 7bit, 8bit, binary or absent: bytes are taken as-is.
    Identity,
}

impl TransferEncoding {
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("base64") => TransferEncoding::Base64,
            Some("quoted-printable") => TransferEncoding::QuotedPrintable,
            _ => TransferEncoding::Identity,
        }
    }

    pub fn decode(self, data: &[u8]) -> Result<Vec<u8>, TransformError> {
        match self {
            TransferEncoding::Base64 => decode_base64(data),
            TransferEncoding::QuotedPrintable => Ok(decode_quoted_printable(data)),
            TransferEncoding::Identity => Ok(data.to_vec()),
        }
    }

    pub fn encode(self, data: &[u8], eol: &str) -> Vec<u8> {
        match self {
            TransferEncoding::Base64 => encode_base64_lines(data, eol),
            TransferEncoding::QuotedPrintable => encode_quoted_printable(data, eol),
            TransferEncoding::Identity => data.to_vec(),
        }
    }
}

/// Decode base64, ignoring line breaks and other whitespace.
pub fn decode_base64(data: &[u8]) -> Result<Vec<u8>, TransformError> {
    let compact: Vec<u8> = data
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    STANDARD
        .decode(compact)
        .map_err(|e| TransformError::Encoding(format!("base64: {e}")))
}

/// Encode as base64 wrapped at 76 columns, each line terminated by `eol`.
pub fn encode_base64_lines(data: &[u8], eol: &str) -> Vec<u8> {
    let encoded = STANDARD.encode(data);
    let mut out = Vec::with_capacity(encoded.len() + encoded.len() / MAX_LINE_LENGTH * 2 + 2);
    for chunk in encoded.as_bytes().chunks(MAX_LINE_LENGTH) {
        out.extend_from_slice(chunk);
        out.extend_from_slice(eol.as_bytes());
    }
    out
}

/// Decode quoted-printable (RFC 2045). Malformed escapes are kept literally.
pub fn decode_quoted_printable(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        let byte = data[i];
        if byte != b'=' {
            out.push(byte);
            i += 1;
            continue;
        }
        match (data.get(i + 1), data.get(i + 2)) {
            (Some(b'\r'), Some(b'\n')) => i += 3,
            (Some(b'\n'), _) => i += 2,
            (Some(&hi), Some(&lo)) if hi.is_ascii_hexdigit() && lo.is_ascii_hexdigit() => {
                out.push(hex_value(hi) << 4 | hex_value(lo));
                i += 3;
            }
            _ => {
                out.push(b'=');
                i += 1;
            }
        }
    }
    out
}

fn hex_value(b: u8) -> u8 {
    match b {
        b'0'..=b'9' => b - b'0',
        b'a'..=b'f' => b - b'a' + 10,
        _ => b - b'A' + 10,
    }
}

/// Encode as quoted-printable, keeping hard line breaks as `eol`.
pub fn encode_quoted_printable(data: &[u8], eol: &str) -> Vec<u8> {
    let mut out = String::with_capacity(data.len() + data.len() / 10);
    for (n, line) in data.split(|&b| b == b'\n').enumerate() {
        if n > 0 {
            out.push_str(eol);
        }
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let mut column = 0;
        for (i, &byte) in line.iter().enumerate() {
            let last = i + 1 == line.len();
            let literal = matches!(byte, b'!'..=b'<' | b'>'..=b'~')
                || ((byte == b' ' || byte == b'\t') && !last);
            let width = if literal { 1 } else { 3 };
            if column + width > MAX_LINE_LENGTH - 1 {
                out.push('=');
                out.push_str(eol);
                column = 0;
            }
            if literal {
                out.push(byte as char);
            } else {
                let _ = write!(out, "={byte:02X}");
            }
            column += width;
        }
    }
    out.into_bytes()
}

/// Decode a text body from its declared charset.
pub fn decode_text(data: &[u8], charset: Option<&str>) -> (String, &'static encoding_rs::Encoding) {
    let encoding = charset
        .and_then(|c| encoding_rs::Encoding::for_label(c.trim().as_bytes()))
        .unwrap_or(encoding_rs::UTF_8);
    let (text, actual, _) = encoding.decode(data);
    (text.into_owned(), actual)
}

/// Encode text back into the charset it was read from.
pub fn encode_text(text: &str, encoding: &'static encoding_rs::Encoding) -> Vec<u8> {
    let (bytes, _, _) = encoding.encode(text);
    bytes.into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_ignores_line_breaks() {
        let decoded = decode_base64(b"SGVsbG8s\r\nIFdvcmxkIQ==\r\n").unwrap();
        assert_eq!(decoded, b"Hello, World!");
    }

    #[test]
    fn base64_wraps_long_output() {
        let data = vec![0u8; 120];
        let encoded = encode_base64_lines(&data, "\r\n");
        let lines: Vec<&[u8]> = encoded
            .split(|&b| b == b'\n')
            .filter(|l| !l.is_empty())
            .collect();
        assert_eq!(lines.len(), 3);
        assert!(lines.iter().all(|l| l.len() <= MAX_LINE_LENGTH + 1));
        assert_eq!(decode_base64(&encoded).unwrap(), data);
    }

    #[test]
    fn quoted_printable_decodes_soft_breaks_and_escapes() {
        let decoded = decode_quoted_printable(b"caf=C3=A9 au=\r\n lait=3D ok");
        assert_eq!(String::from_utf8(decoded).unwrap(), "café au lait= ok");
    }

    #[test]
    fn quoted_printable_keeps_bad_escape() {
        assert_eq!(decode_quoted_printable(b"50=ZZ"), b"50=ZZ");
    }

    #[test]
    fn quoted_printable_encodes_trailing_space_and_breaks() {
        let encoded = encode_quoted_printable("a \nb=c\n".as_bytes(), "\r\n");
        assert_eq!(encoded, b"a=20\r\nb=3Dc\r\n");
    }

    #[test]
    fn quoted_printable_soft_wraps() {
        let line = "x".repeat(200);
        let encoded = encode_quoted_printable(line.as_bytes(), "\n");
        for l in encoded.split(|&b| b == b'\n') {
            assert!(l.len() <= MAX_LINE_LENGTH);
        }
        assert_eq!(decode_quoted_printable(&encoded), line.as_bytes());
    }

    #[test]
    fn text_round_trips_through_latin1() {
        let (text, enc) = decode_text(b"caf\xe9", Some("ISO-8859-1"));
        assert_eq!(text, "café");
        assert_eq!(encode_text(&text, enc), b"caf\xe9");
    }
}

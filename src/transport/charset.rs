//! Text detection and charset decoding.
//!
//! Responsibilities:
//! - Decide from the `Content-Type` alone whether a body is text.
//! - Pick a charset: declared header charset, then a confident statistical
//!   guess, then an in-document `charset=` declaration, then UTF-8.
//! - Decode lossily; a bad byte never fails a fetch.

use encoding_rs::{Encoding, UTF_8, UTF_16BE, UTF_16LE};
use once_cell::sync::Lazy;
use regex::bytes::Regex;

use super::DecodeError;

/// Detector results at or below this confidence are ignored.
const DETECTOR_CONFIDENCE: f32 = 0.8;

/// MIME fragments treated as textual in addition to `text/*`.
const TEXTUAL_TYPES: &[&str] = &[
    "text/html",
    "text/javascript",
    "text/css",
    "application/json",
    "application/xml",
    "application/atom+xml",
];

static META_CHARSET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)charset\s*=\s*["']?([a-z0-9_\-:.]+)"#).expect("invalid charset regex")
});

/// Decoded body of a fetched page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageContent {
    Text(String),
    Bytes(Vec<u8>),
}

impl PageContent {
    pub fn is_text(&self) -> bool {
        matches!(self, PageContent::Text(_))
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            PageContent::Text(text) => Some(text),
            PageContent::Bytes(_) => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            PageContent::Text(text) => text.as_bytes(),
            PageContent::Bytes(bytes) => bytes,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            PageContent::Text(text) => text.into_bytes(),
            PageContent::Bytes(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Whether the MIME part of `content_type` names a text payload.
pub fn is_textual(content_type: &str) -> bool {
    let mime = mime_type(content_type);
    mime.starts_with("text") || TEXTUAL_TYPES.iter().any(|textual| mime.contains(textual))
}

/// Content type with parameters removed, lowercased.
pub fn mime_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// `charset` parameter of a `Content-Type` header, if any.
pub fn declared_charset(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches(|c| c == '"' || c == '\'').to_string())
            .filter(|value| !value.is_empty())
    })
}

/// Turn a decompressed body into text or leave it as bytes.
pub fn decode_text(body: &[u8], content_type: Option<&str>) -> PageContent {
    let Some(content_type) = content_type else {
        log::warn!("no content type, leaving {} bytes undecoded", body.len());
        return PageContent::Bytes(body.to_vec());
    };

    if !is_textual(content_type) {
        return PageContent::Bytes(body.to_vec());
    }

    let label = declared_charset(content_type).or_else(|| sniff_charset(body));
    let encoding = label
        .as_deref()
        .and_then(|label| Encoding::for_label(label.trim().as_bytes()))
        .unwrap_or_else(|| {
            if let Some(label) = &label {
                log::debug!("unknown charset `{label}`, falling back to utf-8");
            }
            UTF_8
        });

    let (text, used, had_errors) = encoding.decode(body);
    if had_errors {
        log::debug!("lossy {} decode of {} bytes", used.name(), body.len());
    }
    PageContent::Text(text.into_owned())
}

fn sniff_charset(body: &[u8]) -> Option<String> {
    let (charset, confidence, _) = chardet::detect(&body.to_vec());
    if confidence > DETECTOR_CONFIDENCE && !charset.is_empty() {
        log::trace!("detected charset {charset} ({confidence:.2})");
        return Some(chardet::charset2encoding(&charset).to_string());
    }

    META_CHARSET
        .captures(body)
        .and_then(|caps| caps.get(1))
        .map(|found| String::from_utf8_lossy(found.as_bytes()).into_owned())
}

/// Unicode encodings a JSON text can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonEncoding {
    Utf8,
    Utf16Be,
    Utf16Le,
    Utf32Be,
    Utf32Le,
}

/// Infer the encoding of a JSON byte string from the null pattern of its
/// first octets (RFC 4627 section 3).
pub fn determine_json_encoding(body: &[u8]) -> Result<JsonEncoding, DecodeError> {
    let unknown = || DecodeError::JsonEncoding("unknown encoding".into());

    if body.len() > 4 {
        return match (body[0] == 0, body[1] == 0, body[2] == 0, body[3] == 0) {
            (true, true, true, false) => Ok(JsonEncoding::Utf32Be),
            (true, false, true, false) => Ok(JsonEncoding::Utf16Be),
            (false, true, true, true) => Ok(JsonEncoding::Utf32Le),
            (false, true, false, true) => Ok(JsonEncoding::Utf16Le),
            (false, false, false, false) => Ok(JsonEncoding::Utf8),
            _ => Err(unknown()),
        };
    }

    if body.len() > 2 {
        return match (body[0] == 0, body[1] == 0) {
            (true, true) => Ok(JsonEncoding::Utf32Be),
            (true, false) => Ok(JsonEncoding::Utf16Be),
            (false, true) => Err(DecodeError::JsonEncoding(
                "json string too short to infer encoding".into(),
            )),
            (false, false) => Ok(JsonEncoding::Utf8),
        };
    }

    Err(DecodeError::JsonEncoding("input too short to guess encoding".into()))
}

/// Decode a JSON byte string using [`determine_json_encoding`].
pub fn decode_json_bytes(body: &[u8]) -> Result<String, DecodeError> {
    let text = match determine_json_encoding(body)? {
        JsonEncoding::Utf8 => UTF_8.decode(body).0.into_owned(),
        JsonEncoding::Utf16Be => UTF_16BE.decode(body).0.into_owned(),
        JsonEncoding::Utf16Le => UTF_16LE.decode(body).0.into_owned(),
        JsonEncoding::Utf32Be => decode_utf32(body, u32::from_be_bytes),
        JsonEncoding::Utf32Le => decode_utf32(body, u32::from_le_bytes),
    };
    Ok(text)
}

fn decode_utf32(body: &[u8], read: fn([u8; 4]) -> u32) -> String {
    body.chunks(4)
        .map(|chunk| match <[u8; 4]>::try_from(chunk) {
            Ok(quad) => char::from_u32(read(quad)).unwrap_or(char::REPLACEMENT_CHARACTER),
            Err(_) => char::REPLACEMENT_CHARACTER,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_types_stay_bytes() {
        let body = b"\x89PNG\r\n\x1a\n";
        assert_eq!(decode_text(body, Some("image/png")), PageContent::Bytes(body.to_vec()));
        assert_eq!(decode_text(body, None), PageContent::Bytes(body.to_vec()));
    }

    #[test]
    fn header_charset_wins() {
        let body = b"caf\xe9";
        let content = decode_text(body, Some("text/html; charset=windows-1252"));
        assert_eq!(content.as_text(), Some("café"));
    }

    #[test]
    fn plain_text_defaults_to_utf8() {
        let content = decode_text("naïve résumé".as_bytes(), Some("text/plain"));
        assert_eq!(content.as_text(), Some("naïve résumé"));
    }

    #[test]
    fn invalid_bytes_decode_lossily() {
        let content = decode_text(b"ok \xff\xfe", Some("application/json; charset=utf-8"));
        let text = content.as_text().unwrap();
        assert!(text.starts_with("ok "));
        assert!(text.contains('\u{fffd}'));
    }

    #[test]
    fn unknown_charset_label_falls_back() {
        let content = decode_text(b"plain", Some("text/html; charset=x-made-up"));
        assert_eq!(content.as_text(), Some("plain"));
    }

    #[test]
    fn parses_declared_charset() {
        assert_eq!(declared_charset("text/html; charset=\"UTF-8\""), Some("UTF-8".into()));
        assert_eq!(declared_charset("text/html"), None);
        assert_eq!(mime_type("Text/HTML; charset=utf-8"), "text/html");
        assert!(is_textual("application/atom+xml"));
        assert!(!is_textual("application/octet-stream"));
    }

    #[test]
    fn json_encoding_from_null_pattern() {
        assert_eq!(determine_json_encoding(b"{\"a\": 1}").unwrap(), JsonEncoding::Utf8);
        assert_eq!(determine_json_encoding(b"\0{\0\"\0a").unwrap(), JsonEncoding::Utf16Be);
        assert_eq!(determine_json_encoding(b"{\0\"\0a\0").unwrap(), JsonEncoding::Utf16Le);
        assert_eq!(determine_json_encoding(b"\0\0\0{\0").unwrap(), JsonEncoding::Utf32Be);
        assert_eq!(determine_json_encoding(b"{\0\0\0\"").unwrap(), JsonEncoding::Utf32Le);
        assert!(determine_json_encoding(b"1").is_err());
        assert!(determine_json_encoding(b"1\0\0").is_err());
    }

    #[test]
    fn decodes_utf16_and_utf32_json() {
        let utf16: Vec<u8> = "[1,2]".encode_utf16().flat_map(u16::to_le_bytes).collect();
        assert_eq!(decode_json_bytes(&utf16).unwrap(), "[1,2]");

        let utf32: Vec<u8> = "[1,2]".chars().flat_map(|c| (c as u32).to_be_bytes()).collect();
        assert_eq!(decode_json_bytes(&utf32).unwrap(), "[1,2]");
    }
}

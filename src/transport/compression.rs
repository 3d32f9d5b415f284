//! `Content-Encoding` removal.
//!
//! `deflate` is notoriously inconsistent in the wild: servers send raw DEFLATE,
//! zlib-wrapped streams, gzip containers, and streams built with unusual window
//! sizes. Decoding walks [`DEFLATE_FRAMINGS`] in order and keeps the first
//! framing that inflates cleanly.

use std::io::Read;

use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use once_cell::sync::Lazy;

use super::DecodeError;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const MAX_WINDOW_BITS: u8 = 15;
const MIN_WINDOW_BITS: u8 = 8;

/// Container and window size a deflate payload is tried with.
///
/// `window_bits == 0` on [`DeflateFraming::Auto`] means "take the window size
/// from the stream header".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeflateFraming {
    Raw { window_bits: u8 },
    Zlib { window_bits: u8 },
    Gzip { window_bits: u8 },
    Auto { window_bits: u8 },
}

/// Compression layer that was removed from a body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionKind {
    Identity,
    Gzip,
    Deflate(DeflateFraming),
}

impl CompressionKind {
    pub fn label(&self) -> &'static str {
        match self {
            CompressionKind::Identity => "none",
            CompressionKind::Gzip => "gzip",
            CompressionKind::Deflate(_) => "deflate",
        }
    }
}

/// Ordered list of framings attempted for `Content-Encoding: deflate`.
pub static DEFLATE_FRAMINGS: Lazy<Vec<DeflateFraming>> = Lazy::new(|| {
    let mut framings = vec![
        DeflateFraming::Raw { window_bits: MAX_WINDOW_BITS },
        DeflateFraming::Zlib { window_bits: MAX_WINDOW_BITS },
        DeflateFraming::Gzip { window_bits: MAX_WINDOW_BITS },
        DeflateFraming::Auto { window_bits: MAX_WINDOW_BITS },
        DeflateFraming::Auto { window_bits: 0 },
    ];
    let sizes = MIN_WINDOW_BITS..=MAX_WINDOW_BITS;
    framings.extend(sizes.clone().map(|window_bits| DeflateFraming::Raw { window_bits }));
    framings.extend(sizes.clone().map(|window_bits| DeflateFraming::Zlib { window_bits }));
    framings.extend(sizes.clone().map(|window_bits| DeflateFraming::Gzip { window_bits }));
    framings.extend(sizes.map(|window_bits| DeflateFraming::Auto { window_bits }));
    framings
});

/// Remove the transfer encoding named by `encoding` from `body`.
pub fn decompress(encoding: Option<&str>, body: &[u8]) -> Result<(CompressionKind, Vec<u8>), DecodeError> {
    let encoding = encoding.map(|value| value.trim().to_ascii_lowercase()).unwrap_or_default();

    match encoding.as_str() {
        "" | "identity" | "none" => Ok((CompressionKind::Identity, body.to_vec())),
        "gzip" | "x-gzip" => {
            let decoded = read_all(GzDecoder::new(body)).map_err(DecodeError::Gzip)?;
            Ok((CompressionKind::Gzip, decoded))
        }
        "deflate" => inflate_any(body),
        other => Err(DecodeError::UnsupportedEncoding(other.to_string())),
    }
}

fn inflate_any(body: &[u8]) -> Result<(CompressionKind, Vec<u8>), DecodeError> {
    if body.is_empty() {
        return Ok((CompressionKind::Deflate(DEFLATE_FRAMINGS[0]), Vec::new()));
    }

    let mut last_error = None;
    for framing in DEFLATE_FRAMINGS.iter().copied() {
        match inflate(framing, body) {
            Ok(decoded) => {
                log::trace!("deflate body decoded with {framing:?}");
                return Ok((CompressionKind::Deflate(framing), decoded));
            }
            Err(source) => last_error = Some(DecodeError::Inflate { framing, source }),
        }
    }

    Err(last_error.unwrap_or_else(|| DecodeError::UnsupportedEncoding("deflate".into())))
}

fn inflate(framing: DeflateFraming, body: &[u8]) -> std::io::Result<Vec<u8>> {
    match framing {
        DeflateFraming::Raw { .. } => read_all(DeflateDecoder::new(body)),
        DeflateFraming::Zlib { window_bits } => {
            check_zlib_window(body, window_bits)?;
            read_all(ZlibDecoder::new(body))
        }
        DeflateFraming::Gzip { .. } => {
            if !body.starts_with(&GZIP_MAGIC) {
                return Err(invalid("missing gzip magic"));
            }
            read_all(GzDecoder::new(body))
        }
        DeflateFraming::Auto { window_bits } => {
            if body.starts_with(&GZIP_MAGIC) {
                read_all(GzDecoder::new(body))
            } else {
                check_zlib_window(body, window_bits)?;
                read_all(ZlibDecoder::new(body))
            }
        }
    }
}

/// Reject zlib streams whose header asks for a larger window than allowed.
fn check_zlib_window(body: &[u8], window_bits: u8) -> std::io::Result<()> {
    let (cmf, flg) = match body {
        [cmf, flg, ..] => (*cmf, *flg),
        _ => return Err(invalid("zlib header truncated")),
    };

    if cmf & 0x0f != 8 || (u16::from(cmf) << 8 | u16::from(flg)) % 31 != 0 {
        return Err(invalid("not a zlib header"));
    }

    let declared = (cmf >> 4) + 8;
    if declared > MAX_WINDOW_BITS {
        return Err(invalid("zlib window exceeds 32K"));
    }
    if window_bits != 0 && declared > window_bits {
        return Err(invalid("zlib window larger than allowed"));
    }
    Ok(())
}

fn read_all<R: Read>(mut reader: R) -> std::io::Result<Vec<u8>> {
    let mut decoded = Vec::new();
    reader.read_to_end(&mut decoded)?;
    Ok(decoded)
}

fn invalid(message: &'static str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, message)
}

//! Content transport decoding.
//!
//! Turns the raw transfer body into usable content: strips the
//! `Content-Encoding` layer first, then decides whether the payload is text
//! and decodes it with the best charset available. Nothing in here performs
//! I/O.

pub mod charset;
pub mod compression;

pub use charset::{JsonEncoding, PageContent, decode_json_bytes, decode_text, determine_json_encoding};
pub use compression::{CompressionKind, DEFLATE_FRAMINGS, DeflateFraming, decompress};

use thiserror::Error;

/// Errors raised while decoding transfer content.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unsupported content encoding `{0}`")]
    UnsupportedEncoding(String),
    #[error("{framing:?} stream could not be inflated: {source}")]
    Inflate {
        framing: DeflateFraming,
        #[source]
        source: std::io::Error,
    },
    #[error("gzip stream could not be decoded: {0}")]
    Gzip(#[source] std::io::Error),
    #[error("cannot infer json encoding: {0}")]
    JsonEncoding(String),
}

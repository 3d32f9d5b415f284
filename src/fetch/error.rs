use thiserror::Error;

use crate::challenges::detectors::ChallengeKind;
use crate::challenges::solvers::SolverError;
use crate::config::ConfigError;
use crate::cookies::CookieError;
use crate::external_deps::captcha::CaptchaError;
use crate::transport::{DecodeError, PageContent};

/// Result alias used across the fetch layer.
pub type FetchResultT<T> = Result<T, FetchError>;

/// Every failure a fetch (or one of its convenience wrappers) can surface.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("content type error: {0}")]
    ContentType(String),
    #[error("invalid argument: {0}")]
    Argument(String),
    #[error("{message}: {url}")]
    FetchFailure {
        message: String,
        url: String,
        /// Decompressed body of the last error response, if one was received.
        content: Option<PageContent>,
        reason: Option<String>,
        /// HTTP status of the last failure; `None` for transport-level errors.
        code: Option<u16>,
    },
    #[error("requested {requested}, redirected to {actual}")]
    Redirected { requested: String, actual: String },
    #[error("{kind} challenge detected on {url}")]
    ChallengeDetected { kind: ChallengeKind, url: String },
    #[error("no solver registered for {0} challenges")]
    NoSolverRegistered(ChallengeKind),
    #[error("captcha solver failure: {0}")]
    CaptchaSolverFailure(#[from] CaptchaError),
    #[error("unsupported content encoding `{0}`")]
    UnsupportedEncoding(String),
    #[error("invalid url `{url}`: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("cookie error: {0}")]
    Cookie(#[from] CookieError),
    #[error("challenge solver error: {0}")]
    Solver(#[from] SolverError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl FetchError {
    pub(crate) fn failure(message: impl Into<String>, url: impl Into<String>) -> Self {
        FetchError::FetchFailure {
            message: message.into(),
            url: url.into(),
            content: None,
            reason: None,
            code: None,
        }
    }

    /// HTTP status carried by a [`FetchError::FetchFailure`], if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            FetchError::FetchFailure { code, .. } => *code,
            FetchError::Transport(err) => err.status().map(|status| status.as_u16()),
            _ => None,
        }
    }

    /// Body of the last failed response, when the server sent one.
    pub fn error_content(&self) -> Option<&PageContent> {
        match self {
            FetchError::FetchFailure { content, .. } => content.as_ref(),
            _ => None,
        }
    }
}

impl From<DecodeError> for FetchError {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::UnsupportedEncoding(encoding) => FetchError::UnsupportedEncoding(encoding),
            DecodeError::JsonEncoding(message) => FetchError::ContentType(message),
            other => FetchError::FetchFailure {
                message: "failed to decode response body".into(),
                url: String::new(),
                content: None,
                reason: Some(other.to_string()),
                code: None,
            },
        }
    }
}

use crate::transport::PageContent;

use super::error::FetchError;

/// Most recent failure seen by the retry loop.
#[derive(Debug)]
pub struct LastError {
    pub reason: String,
    pub code: Option<u16>,
    pub content: Option<PageContent>,
    /// The underlying client error, kept for `native_error` callers.
    pub native: Option<reqwest::Error>,
}

impl LastError {
    pub fn transport(err: reqwest::Error) -> Self {
        Self {
            reason: err.to_string(),
            code: err.status().map(|status| status.as_u16()),
            content: None,
            native: Some(err),
        }
    }

    pub fn status(code: u16, reason: impl Into<String>, content: Option<PageContent>, native: Option<reqwest::Error>) -> Self {
        Self {
            reason: reason.into(),
            code: Some(code),
            content,
            native,
        }
    }

    pub fn decode(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            code: None,
            content: None,
            native: None,
        }
    }
}

/// Attempt bookkeeping for one `fetch` call.
#[derive(Debug)]
pub struct RetryState {
    attempt: u32,
    max_attempts: u32,
    last_error: Option<LastError>,
}

impl RetryState {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempt: 0,
            max_attempts: max_attempts.max(1),
            last_error: None,
        }
    }

    /// Count a new attempt. Returns `false` once the budget is spent.
    pub fn begin_attempt(&mut self) -> bool {
        self.attempt += 1;
        self.attempt <= self.max_attempts
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn has_remaining(&self) -> bool {
        self.attempt < self.max_attempts
    }

    pub fn record(&mut self, error: LastError) {
        self.last_error = Some(error);
    }

    pub fn last_error(&self) -> Option<&LastError> {
        self.last_error.as_ref()
    }

    /// Convert the last recorded failure into the error returned to the
    /// caller.
    pub fn into_error(self, url: &str, native_error: bool) -> FetchError {
        let Some(last) = self.last_error else {
            return FetchError::failure("Failed to retrieve page", url);
        };
        if native_error && let Some(native) = last.native {
            return FetchError::Transport(native);
        }
        FetchError::FetchFailure {
            message: "Failed to retrieve page".into(),
            url: url.to_string(),
            content: last.content,
            reason: Some(last.reason),
            code: last.code,
        }
    }
}

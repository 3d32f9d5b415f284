//! The fetch retry loop.
//!
//! One call to [`FetchEngine::fetch`] owns its [`RetryState`]. Every attempt
//! builds a fresh request so default headers, credentials and the cookies
//! currently in the jar are re-applied. A 404 is fatal, any other failure
//! waits the fixed retry delay and tries again until the attempt budget is
//! spent. Successful bodies are decompressed, scanned for WAF signatures
//! and only then decoded.

use std::sync::Arc;
use std::time::Duration;

use http::header::{CONTENT_ENCODING, CONTENT_TYPE};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use tokio::time::{Instant, sleep};
use url::Url;

use super::error::{FetchError, FetchResultT};
use super::request::{FetchOptions, ProgressCallback, RequestBody, normalize_header_value};
use super::response::{FetchOutcome, FetchResult};
use super::retry::{LastError, RetryState};
use crate::challenges::detectors::ChallengeDetector;
use crate::config::Credential;
use crate::modules::events::{
    ChallengeStage, EventDispatcher, FetchEvent, PostResponseEvent, PreRequestEvent,
};
use crate::transport::{DecodeError, decode_text, decompress};

const MAX_PREALLOC: u64 = 4 * 1024 * 1024;

/// Engine-wide settings, fixed at construction.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub default_headers: Vec<(String, String)>,
    pub credentials: Vec<Credential>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            retry_delay: Duration::from_millis(10),
            default_headers: Vec::new(),
            credentials: Vec::new(),
        }
    }
}

/// Sequential fetcher over a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct FetchEngine {
    client: reqwest::Client,
    settings: EngineSettings,
    detector: ChallengeDetector,
    events: Arc<EventDispatcher>,
}

impl FetchEngine {
    pub fn new(client: reqwest::Client, settings: EngineSettings, events: Arc<EventDispatcher>) -> Self {
        Self {
            client,
            settings,
            detector: ChallengeDetector::new(),
            events,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn retry_delay(&self) -> Duration {
        self.settings.retry_delay
    }

    pub fn events(&self) -> &Arc<EventDispatcher> {
        &self.events
    }

    /// Run the retry loop for `url`.
    pub async fn fetch(&self, url: &Url, options: &FetchOptions) -> FetchResultT<FetchOutcome> {
        let method = options.resolved_method();
        let max_attempts = options.max_attempts.unwrap_or(self.settings.max_attempts);
        let mut state = RetryState::new(max_attempts);

        while state.begin_attempt() {
            self.events.dispatch(FetchEvent::PreRequest(PreRequestEvent {
                url: url.to_string(),
                method: method.clone(),
                attempt: state.attempt(),
                timestamp: chrono::Utc::now(),
            }));

            let request = self.build_request(&method, url, options)?;
            let started = Instant::now();
            let response = match request.send().await {
                Ok(response) => response,
                Err(err) => {
                    self.events.error(url.as_str(), &err);
                    state.record(LastError::transport(err));
                    self.pause(url, &state).await;
                    continue;
                }
            };

            let status = response.status();
            if status.is_client_error() || status.is_server_error() {
                let native = response.error_for_status_ref().err();
                let content_type = header_str(response.headers(), &CONTENT_TYPE);
                let encoding = header_str(response.headers(), &CONTENT_ENCODING);
                let body = read_body(response, None)
                    .await
                    .ok()
                    .filter(|body| !body.is_empty())
                    .and_then(|body| decompress(encoding.as_deref(), &body).ok())
                    .map(|(_, body)| body);

                log::warn!(
                    "Error opening page: {url} on attempt {} ({status})",
                    state.attempt()
                );

                if status == StatusCode::NOT_FOUND {
                    log::error!("Unrecoverable - page not found: {url}");
                    let content = body.map(|body| decode_text(&body, content_type.as_deref()));
                    state.record(LastError::status(404, reason_phrase(status), content, native));
                    return Err(state.into_error(url.as_str(), options.native_error));
                }

                if matches!(status, StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE)
                    && let Some(body) = &body
                    && let Some(detection) = self.detector.scan(body, url.as_str())
                {
                    self.events.challenge(url.as_str(), detection.kind, ChallengeStage::Detected);
                    return Ok(FetchOutcome::Challenge(detection));
                }

                let content = body.map(|body| decode_text(&body, content_type.as_deref()));
                state.record(LastError::status(status.as_u16(), reason_phrase(status), content, native));
                self.pause(url, &state).await;
                continue;
            }

            let final_url = response.url().clone();
            let headers = response.headers().clone();
            let encoding = header_str(&headers, &CONTENT_ENCODING);
            let content_type = header_str(&headers, &CONTENT_TYPE);
            log::info!(
                "Request for {url} succeeded on attempt {}. Receiving...",
                state.attempt()
            );

            let raw = match read_body(response, options.progress.as_ref()).await {
                Ok(raw) => raw,
                Err(err) => {
                    self.events.error(url.as_str(), &err);
                    state.record(LastError::transport(err));
                    self.pause(url, &state).await;
                    continue;
                }
            };

            let (compression, body) = match decompress(encoding.as_deref(), &raw) {
                Ok(decoded) => decoded,
                Err(DecodeError::UnsupportedEncoding(encoding)) => {
                    return Err(FetchError::UnsupportedEncoding(encoding));
                }
                Err(err) => {
                    self.events.error(url.as_str(), &err);
                    state.record(LastError::decode(err.to_string()));
                    self.pause(url, &state).await;
                    continue;
                }
            };

            self.events.dispatch(FetchEvent::PostResponse(PostResponseEvent {
                url: url.to_string(),
                final_url: final_url.to_string(),
                method: method.clone(),
                status: status.as_u16(),
                compression: compression.label(),
                bytes: body.len(),
                latency: started.elapsed(),
                timestamp: chrono::Utc::now(),
            }));

            if let Some(detection) = self.detector.scan(&body, url.as_str()) {
                self.events.challenge(url.as_str(), detection.kind, ChallengeStage::Detected);
                return Ok(FetchOutcome::Challenge(detection));
            }

            if options.forbid_redirects && final_url != *url {
                log::error!("Requested {url}, redirected to {final_url}. Raising error");
                return Err(FetchError::Redirected {
                    requested: url.to_string(),
                    actual: final_url.to_string(),
                });
            }

            return Ok(FetchOutcome::Page(FetchResult {
                content: decode_text(&body, content_type.as_deref()),
                url: final_url,
                requested_url: url.clone(),
                headers,
                status: status.as_u16(),
                compression,
            }));
        }

        log::error!(
            "Failed to retrieve {url}: all {} attempts exhausted",
            state.max_attempts()
        );
        Err(state.into_error(url.as_str(), options.native_error))
    }

    /// `HEAD` request returning the final URL after redirects. A 500 that
    /// still carries a URL counts as an answer.
    pub async fn head(&self, url: &Url, attempts: u32, headers: &[(String, String)]) -> FetchResultT<Url> {
        let options = FetchOptions {
            headers: headers.to_vec(),
            ..FetchOptions::default()
        };
        let mut state = RetryState::new(attempts);

        while state.begin_attempt() {
            log::info!("Doing HTTP HEAD request for '{url}'");
            match self.build_request(&Method::HEAD, url, &options)?.send().await {
                Ok(response) => {
                    let status = response.status();
                    let final_url = response.url().clone();
                    if !(status.is_client_error() || status.is_server_error())
                        || status == StatusCode::INTERNAL_SERVER_ERROR
                    {
                        if final_url != *url {
                            log::info!("HEAD request returned a different URL '{final_url}'");
                        }
                        return Ok(final_url);
                    }
                    let native = response.error_for_status_ref().err();
                    state.record(LastError::status(status.as_u16(), reason_phrase(status), None, native));
                }
                Err(err) => state.record(LastError::transport(err)),
            }
            log::info!("HEAD request failed, retrying....");
        }

        log::error!("Failure fetching: {url}");
        Err(state.into_error(url.as_str(), false))
    }

    fn build_request(&self, method: &Method, url: &Url, options: &FetchOptions) -> FetchResultT<reqwest::RequestBuilder> {
        let mut headers = HeaderMap::new();
        for (name, value) in self.settings.default_headers.iter().chain(options.headers.iter()) {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| FetchError::Argument(format!("invalid header name `{name}`")))?;
            let header_value = HeaderValue::from_str(&normalize_header_value(name, value))
                .map_err(|_| FetchError::Argument(format!("invalid value for header `{name}`")))?;
            headers.insert(header_name, header_value);
        }

        let mut builder = self.client.request(method.clone(), url.clone()).headers(headers);

        if let Some(credential) = self
            .settings
            .credentials
            .iter()
            .find(|credential| url.as_str().starts_with(&credential.url_prefix))
        {
            builder = builder.basic_auth(&credential.username, Some(&credential.password));
        }

        builder = match &options.body {
            None => builder,
            Some(RequestBody::Raw(bytes)) => builder.body(bytes.clone()),
            Some(RequestBody::Text(text)) => builder.body(text.clone()),
            Some(RequestBody::Form(pairs)) => builder.form(pairs),
            Some(RequestBody::Multipart(form)) => builder.multipart(form.to_form()?),
        };
        Ok(builder)
    }

    async fn pause(&self, url: &Url, state: &RetryState) {
        if !state.has_remaining() {
            return;
        }
        let reason = state
            .last_error()
            .map(|err| err.reason.clone())
            .unwrap_or_default();
        self.events
            .retry(url.as_str(), state.attempt() + 1, reason, self.settings.retry_delay);
        sleep(self.settings.retry_delay).await;
    }
}

/// Read the body chunk by chunk, reporting progress after each chunk.
async fn read_body(mut response: reqwest::Response, progress: Option<&ProgressCallback>) -> Result<Vec<u8>, reqwest::Error> {
    let total = response.content_length();
    let mut body = Vec::with_capacity(total.unwrap_or(0).min(MAX_PREALLOC) as usize);
    while let Some(chunk) = response.chunk().await? {
        body.extend_from_slice(&chunk);
        if let Some(progress) = progress {
            progress(body.len() as u64, total);
        }
    }
    Ok(body)
}

/// Progress callback that logs each report.
pub fn log_progress(so_far: u64, total: Option<u64>) {
    match total {
        Some(total) if total > 0 => {
            let percent = so_far as f64 / total as f64 * 100.0;
            log::info!("Downloaded {so_far} of {total} bytes ({percent:.2}%)");
        }
        _ => log::info!("Downloaded {so_far} bytes"),
    }
}

fn header_str(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn reason_phrase(status: StatusCode) -> String {
    status.canonical_reason().unwrap_or("HTTP error").to_string()
}

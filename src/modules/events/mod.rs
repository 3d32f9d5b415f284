//! Fetch lifecycle events.
//!
//! The fetch engine and escalation dispatcher publish structured events;
//! handlers decide what to do with them. [`LoggingHandler`] routes them to the
//! `log` facade and is installed by default.

use chrono::{DateTime, Utc};
use http::Method;
use std::sync::Arc;
use std::time::Duration;

use crate::challenges::detectors::ChallengeKind;

/// Structured pre-request event.
#[derive(Debug, Clone)]
pub struct PreRequestEvent {
    pub url: String,
    pub method: Method,
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
}

/// Structured post-response event.
#[derive(Debug, Clone)]
pub struct PostResponseEvent {
    pub url: String,
    pub final_url: String,
    pub method: Method,
    pub status: u16,
    pub compression: &'static str,
    pub bytes: usize,
    pub latency: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ChallengeEvent {
    pub url: String,
    pub kind: ChallengeKind,
    pub stage: ChallengeStage,
    pub timestamp: DateTime<Utc>,
}

/// Where in the escalation flow a challenge event was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeStage {
    Detected,
    Preempted,
    Solved,
    SolveFailed,
    Replayed,
}

#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub url: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RetryEvent {
    pub url: String,
    pub attempt: u32,
    pub reason: String,
    pub scheduled_after: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum FetchEvent {
    PreRequest(PreRequestEvent),
    PostResponse(PostResponseEvent),
    Challenge(ChallengeEvent),
    Error(ErrorEvent),
    Retry(RetryEvent),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &FetchEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default, Clone)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    /// Dispatcher with only the [`LoggingHandler`] installed.
    pub fn with_logging() -> Self {
        let mut dispatcher = Self::new();
        dispatcher.register_handler(Arc::new(LoggingHandler));
        dispatcher
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn dispatch(&self, event: FetchEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }

    pub(crate) fn retry(&self, url: &str, attempt: u32, reason: impl Into<String>, delay: Duration) {
        self.dispatch(FetchEvent::Retry(RetryEvent {
            url: url.to_string(),
            attempt,
            reason: reason.into(),
            scheduled_after: delay,
            timestamp: Utc::now(),
        }));
    }

    pub(crate) fn challenge(&self, url: &str, kind: ChallengeKind, stage: ChallengeStage) {
        self.dispatch(FetchEvent::Challenge(ChallengeEvent {
            url: url.to_string(),
            kind,
            stage,
            timestamp: Utc::now(),
        }));
    }

    pub(crate) fn error(&self, url: &str, error: impl ToString) {
        self.dispatch(FetchEvent::Error(ErrorEvent {
            url: url.to_string(),
            error: error.to_string(),
            timestamp: Utc::now(),
        }));
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &FetchEvent) {
        match event {
            FetchEvent::PreRequest(pre) => {
                log::info!("Fetching: {} {} (attempt {})", pre.method, pre.url, pre.attempt);
            }
            FetchEvent::PostResponse(post) => {
                if post.final_url != post.url {
                    log::info!("{} was redirected to {}", post.url, post.final_url);
                }
                log::debug!(
                    "<- {} {} -> {} ({:.2}s, compression {}, {:.3}K)",
                    post.method,
                    post.url,
                    post.status,
                    post.latency.as_secs_f64(),
                    post.compression,
                    post.bytes as f64 / 1000.0
                );
            }
            FetchEvent::Challenge(challenge) => {
                log::info!("{} challenge on {}: {:?}", challenge.kind, challenge.url, challenge.stage);
            }
            FetchEvent::Error(error) => {
                log::warn!("error fetching {} -> {}", error.url, error.error);
            }
            FetchEvent::Retry(retry) => {
                log::info!(
                    "retry {} attempt {} after {:.2}s ({})",
                    retry.url,
                    retry.attempt,
                    retry.scheduled_after.as_secs_f64(),
                    retry.reason
                );
            }
        }
    }
}

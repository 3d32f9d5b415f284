//! Challenge solver interface.
//!
//! A solver takes a URL behind a WAF interstitial and returns whatever
//! cookies it collected while getting through it. Solvers are registered per
//! [`ChallengeKind`] on the escalation dispatcher.

pub mod browser;

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;
use url::Url;

use crate::challenges::detectors::ChallengeKind;
use crate::cookies::CookieEntry;
use crate::fetch::{FetchError, FetchResultT};

/// Errors raised by solver backends.
#[derive(Debug, Error)]
pub enum SolverError {
    #[error("browser backend error: {0}")]
    Backend(String),
    #[error("tab pool is closed")]
    PoolClosed,
    #[error("tab pool has no tabs")]
    EmptyPool,
}

/// Page-title predicate a solver polls until the interstitial is gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TitleCondition {
    /// The real page's title contains this text.
    Contains(String),
    /// The interstitial's title contains this text; any other non-empty
    /// title means the challenge passed.
    NotContains(String),
}

impl TitleCondition {
    /// Build from the two optional parts. Exactly one must be given.
    pub fn from_parts(contains: Option<&str>, not_contains: Option<&str>) -> FetchResultT<Self> {
        let contains = contains.filter(|text| !text.is_empty());
        let not_contains = not_contains.filter(|text| !text.is_empty());
        match (contains, not_contains) {
            (Some(text), None) => Ok(TitleCondition::Contains(text.to_string())),
            (None, Some(text)) => Ok(TitleCondition::NotContains(text.to_string())),
            (Some(_), Some(_)) => Err(FetchError::Argument(
                "only a single title condition may be given".into(),
            )),
            (None, None) => Err(FetchError::Argument(
                "either a title the page should contain or one it should not contain is required".into(),
            )),
        }
    }

    /// Default condition for a WAF's interstitial.
    pub fn for_kind(kind: ChallengeKind) -> Self {
        match kind {
            ChallengeKind::Cloudflare => TitleCondition::NotContains("Just a moment...".into()),
            ChallengeKind::Sucuri => TitleCondition::NotContains("You are being redirected...".into()),
        }
    }

    pub fn matches(&self, title: &str) -> bool {
        match self {
            TitleCondition::Contains(text) => title.contains(text.as_str()),
            TitleCondition::NotContains(text) => !title.is_empty() && !title.contains(text.as_str()),
        }
    }
}

impl fmt::Display for TitleCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TitleCondition::Contains(text) => write!(f, "title contains '{text}'"),
            TitleCondition::NotContains(text) => write!(f, "title does not contain '{text}'"),
        }
    }
}

/// Input handed to a solver.
#[derive(Debug, Clone)]
pub struct SolveRequest {
    pub url: Url,
    pub condition: TitleCondition,
    /// Cookies currently in the jar for `url`, to seed the solver's session.
    pub cookies: Vec<CookieEntry>,
    /// Headers the fetch engine would send, so the solver can look alike.
    pub headers: Vec<(String, String)>,
}

/// Solver result. Cookies are returned even when `success` is false.
#[derive(Debug, Clone, Default)]
pub struct SolveOutcome {
    pub success: bool,
    pub cookies: Vec<CookieEntry>,
    pub title: Option<String>,
}

#[async_trait]
pub trait ChallengeSolver: Send + Sync {
    fn name(&self) -> &'static str;

    async fn solve(&self, request: SolveRequest) -> Result<SolveOutcome, SolverError>;
}

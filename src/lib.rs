//! # webget-rs
//!
//! A retrying, decoding HTTP fetcher that recognises WAF challenge pages
//! (Cloudflare, Sucuri) and escalates them to pluggable solvers.
//!
//! ## Features
//!
//! - Fixed-delay retries with a per-call attempt budget
//! - gzip / deflate decoding and charset detection
//! - WAF interstitial detection with automatic step-through and replay
//! - Cookie jar persisted in LWP format
//! - Captcha provider adapters with a NAT-mapped SOCKS5 relay
//!
//! ## Example
//!
//! ```no_run
//! use webget_rs::WebGet;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let web = WebGet::new()?;
//!     let json = web.get_json("https://httpbin.org/json").await?;
//!     println!("Response: {json}");
//!     Ok(())
//! }
//! ```

mod webget;

pub mod challenges;
pub mod config;
pub mod cookies;
pub mod external_deps;
pub mod fetch;
pub mod modules;
pub mod transport;

pub use crate::webget::{WebGet, WebGetBuilder};

pub use crate::challenges::detectors::{ChallengeDetection, ChallengeDetector, ChallengeKind};

pub use crate::challenges::escalation::EscalationDispatcher;

pub use crate::challenges::solvers::{
    ChallengeSolver,
    SolveOutcome,
    SolveRequest,
    SolverError,
    TitleCondition,
};

pub use crate::challenges::solvers::browser::{
    BrowserChallengeSolver,
    FetchBackend,
    TabLease,
    TabPool,
};

pub use crate::config::{ConfigError, Credential, StepThroughConfig, WebGetConfig};

pub use crate::cookies::{
    BrowserCookie,
    CookieEntry,
    CookieError,
    CookieJar,
    CookieLock,
    SaveOutcome,
};

pub use crate::external_deps::captcha::{
    AntiCaptchaProvider,
    CaptchaConfig,
    CaptchaError,
    CaptchaProvider,
    CaptchaResult,
    CaptchaSolution,
    CaptchaTask,
    CaptchaTaskId,
    PollStatus,
    TwoCaptchaProvider,
    solve_with_relay,
};

pub use crate::fetch::{
    FetchError,
    FetchOptions,
    FetchOutcome,
    FetchResult,
    FetchResultT,
    MultipartForm,
    RequestBody,
    log_progress,
};

pub use crate::modules::{
    ChallengeStage,
    EventDispatcher,
    EventHandler,
    FetchEvent,
    LoggingHandler,
    NatError,
    NatTraversal,
    PeerPolicy,
    ProxyRelay,
    RelayError,
};

pub use crate::transport::{CompressionKind, DecodeError, PageContent};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

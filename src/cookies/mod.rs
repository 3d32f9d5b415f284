//! Cookie storage shared by the HTTP transport and the challenge solvers.
//!
//! [`CookieJar`] is the single owner of every cookie the client knows about.
//! It plugs into reqwest as its cookie provider, accepts cookies handed back by
//! solvers (last write wins on name + domain + path), and optionally persists
//! itself to an LWP cookie file using load-merge-save semantics guarded by an
//! explicit [`CookieLock`].

mod adapters;
mod lwp;

pub use adapters::BrowserCookie;
pub use lwp::{LWP_HEADER, parse_lwp, render_lwp};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use reqwest::header::HeaderValue;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use url::Url;

/// Expiry timestamps are clamped to this many seconds since the epoch.
pub const MAX_COOKIE_EXPIRY: i64 = 30_000_000_000;

/// How long a save waits for the cookie lock before giving up.
pub const COOKIE_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors surfaced by cookie parsing and persistence.
#[derive(Debug, Error)]
pub enum CookieError {
    #[error("cookie file i/o failed for {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed cookie file line {line}: {reason}")]
    Malformed { line: usize, reason: String },
    #[error("invalid Set-Cookie header: {0}")]
    SetCookie(String),
    #[error("cookie has no domain and none could be derived")]
    MissingDomain,
    #[error("cookie domain `{domain}` does not cover host `{host}`")]
    DomainMismatch { domain: String, host: String },
}

/// Canonical cookie representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieEntry {
    pub name: String,
    pub value: String,
    /// Leading dot marks a domain cookie that also matches subdomains.
    pub domain: String,
    pub path: String,
    pub secure: bool,
    /// Unix seconds; `None` is a session cookie.
    pub expires: Option<i64>,
    pub domain_specified: bool,
    pub http_only: bool,
}

impl CookieEntry {
    pub fn new(name: impl Into<String>, value: impl Into<String>, domain: impl Into<String>) -> Self {
        let domain = domain.into().to_ascii_lowercase();
        Self {
            name: name.into(),
            value: value.into(),
            domain_specified: domain.starts_with('.'),
            domain,
            path: "/".into(),
            secure: false,
            expires: None,
            http_only: false,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn with_http_only(mut self, http_only: bool) -> Self {
        self.http_only = http_only;
        self
    }

    /// Set the expiry, clamping it to [`MAX_COOKIE_EXPIRY`].
    pub fn with_expires(mut self, expires: Option<i64>) -> Self {
        self.expires = expires.map(clamp_expiry);
        self
    }

    /// Identity used for last-write-wins replacement.
    pub fn key(&self) -> CookieKey {
        CookieKey {
            domain: self.domain.clone(),
            path: self.path.clone(),
            name: self.name.clone(),
        }
    }

    pub fn is_session(&self) -> bool {
        self.expires.is_none()
    }

    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires.is_some_and(|expires| expires <= now)
    }

    /// Whether this cookie should be sent with a request for `url`.
    pub fn matches_url(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        if self.secure && url.scheme() != "https" {
            return false;
        }
        domain_matches(&self.domain, self.domain_specified, host) && path_matches(&self.path, url.path())
    }
}

/// Sort key of a cookie inside the jar.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CookieKey {
    pub domain: String,
    pub path: String,
    pub name: String,
}

pub(crate) fn clamp_expiry(expires: i64) -> i64 {
    expires.min(MAX_COOKIE_EXPIRY)
}

fn domain_matches(domain: &str, domain_specified: bool, host: &str) -> bool {
    let host = host.to_ascii_lowercase();
    let bare = domain.trim_start_matches('.');
    if host == bare {
        return true;
    }
    (domain_specified || domain.starts_with('.')) && host.ends_with(&format!(".{bare}"))
}

fn path_matches(cookie_path: &str, request_path: &str) -> bool {
    if cookie_path.is_empty() || cookie_path == "/" || request_path == cookie_path {
        return true;
    }
    request_path.starts_with(cookie_path)
        && (cookie_path.ends_with('/') || request_path[cookie_path.len()..].starts_with('/'))
}

/// Inter-process style guard around cookie file writes.
///
/// Clones share the same underlying lock. Acquisition waits at most
/// [`COOKIE_LOCK_TIMEOUT`].
#[derive(Debug, Clone, Default)]
pub struct CookieLock {
    inner: Arc<Mutex<()>>,
}

impl CookieLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self) -> Option<MutexGuard<'_, ()>> {
        self.acquire_within(COOKIE_LOCK_TIMEOUT).await
    }

    pub async fn acquire_within(&self, timeout: Duration) -> Option<MutexGuard<'_, ()>> {
        tokio::time::timeout(timeout, self.inner.lock()).await.ok()
    }
}

/// Result of a [`CookieJar::save`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved { cookies: usize },
    NoFile,
    LockTimeout,
}

/// Thread-safe cookie jar keyed by domain, path and name.
#[derive(Debug, Default)]
pub struct CookieJar {
    entries: RwLock<BTreeMap<CookieKey, CookieEntry>>,
    file: Option<PathBuf>,
    lock: Option<CookieLock>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jar persisted to `file`. Existing file contents are loaded eagerly; a
    /// corrupt file is logged and removed.
    pub fn with_file(file: impl Into<PathBuf>, lock: Option<CookieLock>) -> Self {
        let jar = Self {
            entries: RwLock::new(BTreeMap::new()),
            file: Some(file.into()),
            lock,
        };
        if let Some(path) = jar.file.as_deref()
            && path.is_file()
        {
            match lwp::read_file(path) {
                Ok(entries) => jar.merge(entries),
                Err(err) => {
                    log::error!("cookie file is corrupt or damaged ({err}), removing it");
                    if let Err(err) = std::fs::remove_file(path) {
                        log::warn!("could not remove cookie file {path:?}: {err}");
                    }
                }
            }
        }
        jar
    }

    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<CookieKey, CookieEntry>> {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<CookieKey, CookieEntry>> {
        self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert or replace a single cookie.
    pub fn add(&self, entry: CookieEntry) {
        log::debug!("updating cookie {}@{}{}", entry.name, entry.domain, entry.path);
        let expires = entry.expires;
        let entry = entry.with_expires(expires);
        self.write().insert(entry.key(), entry);
    }

    /// Merge many cookies; later entries overwrite earlier ones with the same key.
    pub fn merge<I>(&self, entries: I)
    where
        I: IntoIterator<Item = CookieEntry>,
    {
        let mut guard = self.write();
        for entry in entries {
            let expires = entry.expires;
            let entry = entry.with_expires(expires);
            guard.insert(entry.key(), entry);
        }
    }

    /// Snapshot of every stored cookie.
    pub fn all(&self) -> Vec<CookieEntry> {
        self.read().values().cloned().collect()
    }

    pub fn get(&self, domain: &str, path: &str, name: &str) -> Option<CookieEntry> {
        let key = CookieKey {
            domain: domain.to_ascii_lowercase(),
            path: path.to_string(),
            name: name.to_string(),
        };
        self.read().get(&key).cloned()
    }

    /// Unexpired cookies that apply to `url`.
    pub fn matching(&self, url: &Url) -> Vec<CookieEntry> {
        let now = chrono::Utc::now().timestamp();
        self.read()
            .values()
            .filter(|entry| !entry.is_expired_at(now) && entry.matches_url(url))
            .cloned()
            .collect()
    }

    /// Whether any cookie for `host` starts with `prefix`.
    pub fn has_cookie_prefix(&self, host: &str, prefix: &str) -> bool {
        let now = chrono::Utc::now().timestamp();
        let host = host.to_ascii_lowercase();
        self.read().values().any(|entry| {
            entry.name.starts_with(prefix)
                && !entry.is_expired_at(now)
                && domain_matches(&entry.domain, true, &host)
        })
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Drop every cookie, and rewrite the cookie file when one is configured.
    pub async fn clear(&self) -> Result<SaveOutcome, CookieError> {
        let _guard = match &self.lock {
            Some(lock) => match lock.acquire().await {
                Some(guard) => Some(guard),
                None => {
                    log::error!("failed to acquire cookie-lock, cookies not cleared");
                    return Ok(SaveOutcome::LockTimeout);
                }
            },
            None => None,
        };

        self.write().clear();
        match self.file.as_deref() {
            Some(path) => {
                lwp::write_file(path, &[])?;
                Ok(SaveOutcome::Saved { cookies: 0 })
            }
            None => Ok(SaveOutcome::NoFile),
        }
    }

    /// Load the cookie file, merge it underneath the in-memory cookies and
    /// write the union back.
    ///
    /// A lock that cannot be taken within [`COOKIE_LOCK_TIMEOUT`] skips the
    /// save with an error log; it never fails the caller.
    pub async fn save(&self) -> Result<SaveOutcome, CookieError> {
        let Some(path) = self.file.as_deref() else {
            log::debug!("no cookie file configured, nothing to save");
            return Ok(SaveOutcome::NoFile);
        };

        let _guard = match &self.lock {
            Some(lock) => match lock.acquire().await {
                Some(guard) => Some(guard),
                None => {
                    log::error!("failed to acquire cookie-lock, skipping cookie save");
                    return Ok(SaveOutcome::LockTimeout);
                }
            },
            None => None,
        };

        self.sync_from_file(path)?;

        let now = chrono::Utc::now().timestamp();
        let persisted: Vec<CookieEntry> = self
            .read()
            .values()
            .filter(|entry| !entry.is_session() && !entry.is_expired_at(now))
            .cloned()
            .collect();
        lwp::write_file(path, &persisted)?;
        log::debug!("saved {} cookies to {path:?}", persisted.len());
        Ok(SaveOutcome::Saved {
            cookies: persisted.len(),
        })
    }

    /// Pull cookies changed on disk into memory without clobbering newer
    /// in-memory values.
    fn sync_from_file(&self, path: &Path) -> Result<(), CookieError> {
        if !path.is_file() {
            return Ok(());
        }
        let on_disk = lwp::read_file(path)?;
        let mut guard = self.write();
        for entry in on_disk {
            guard.entry(entry.key()).or_insert(entry);
        }
        Ok(())
    }
}

impl reqwest::cookie::CookieStore for CookieJar {
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &Url) {
        let parsed: Vec<CookieEntry> = cookie_headers
            .filter_map(|value| value.to_str().ok())
            .filter_map(|raw| match CookieEntry::from_set_cookie(raw, url) {
                Ok(entry) => Some(entry),
                Err(err) => {
                    log::debug!("ignoring cookie from {url}: {err}");
                    None
                }
            })
            .collect();
        self.merge(parsed);
    }

    fn cookies(&self, url: &Url) -> Option<HeaderValue> {
        let header = self
            .matching(url)
            .iter()
            .map(|entry| format!("{}={}", entry.name, entry.value))
            .collect::<Vec<_>>()
            .join("; ");
        if header.is_empty() {
            return None;
        }
        HeaderValue::from_str(&header).ok()
    }
}

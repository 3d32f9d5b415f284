//! Browser-driven challenge solver.
//!
//! The solver does not embed a browser. Anything that can navigate, report
//! its page title and export cookies implements [`FetchBackend`]; a
//! [`TabPool`] hands those backends out one caller at a time.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::sleep;
use url::Url;

use super::{ChallengeSolver, SolveOutcome, SolveRequest, SolverError};
use crate::cookies::{BrowserCookie, CookieEntry};

pub const DEFAULT_MAX_STEPS: u32 = 20;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// One browser tab (or headless page) the solver can drive.
#[async_trait]
pub trait FetchBackend: Send + Sync {
    async fn navigate(&mut self, url: &Url) -> Result<(), SolverError>;

    async fn title(&mut self) -> Result<String, SolverError>;

    async fn cookies(&mut self) -> Result<Vec<BrowserCookie>, SolverError>;

    async fn set_cookies(&mut self, cookies: &[BrowserCookie]) -> Result<(), SolverError>;

    /// Install request headers (user agent and friends). Backends that
    /// cannot override headers keep the default no-op.
    async fn set_headers(&mut self, _headers: &[(String, String)]) -> Result<(), SolverError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SolverError>;
}

/// Fixed set of backend tabs shared between solvers.
pub struct TabPool<B> {
    permits: Arc<Semaphore>,
    tabs: Mutex<Vec<B>>,
    capacity: usize,
}

impl<B> std::fmt::Debug for TabPool<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TabPool")
            .field("capacity", &self.capacity)
            .field("available", &self.permits.available_permits())
            .finish()
    }
}

impl<B: FetchBackend> TabPool<B> {
    pub fn new(tabs: Vec<B>) -> Self {
        let capacity = tabs.len();
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            tabs: Mutex::new(tabs),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait for a free tab. The tab goes back to the pool when the lease is
    /// dropped.
    pub async fn checkout(self: &Arc<Self>) -> Result<TabLease<B>, SolverError> {
        if self.capacity == 0 {
            return Err(SolverError::EmptyPool);
        }
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SolverError::PoolClosed)?;
        let tab = self
            .tabs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .ok_or(SolverError::PoolClosed)?;
        Ok(TabLease {
            pool: Arc::clone(self),
            tab: Some(tab),
            _permit: permit,
        })
    }

    /// Stop handing out tabs and close every idle one. Leased tabs are
    /// dropped, not returned, once their lease ends.
    pub async fn close(&self) -> Result<(), SolverError> {
        self.permits.close();
        let idle: Vec<B> = std::mem::take(&mut *self.tabs.lock().unwrap_or_else(PoisonError::into_inner));
        for mut tab in idle {
            tab.close().await?;
        }
        Ok(())
    }

    fn give_back(&self, tab: B) {
        if self.permits.is_closed() {
            return;
        }
        self.tabs.lock().unwrap_or_else(PoisonError::into_inner).push(tab);
    }
}

/// Exclusive use of one pooled tab.
pub struct TabLease<B: FetchBackend> {
    pool: Arc<TabPool<B>>,
    tab: Option<B>,
    _permit: OwnedSemaphorePermit,
}

impl<B: FetchBackend> Deref for TabLease<B> {
    type Target = B;

    fn deref(&self) -> &B {
        self.tab.as_ref().unwrap_or_else(|| unreachable!("tab taken before drop"))
    }
}

impl<B: FetchBackend> DerefMut for TabLease<B> {
    fn deref_mut(&mut self) -> &mut B {
        self.tab.as_mut().unwrap_or_else(|| unreachable!("tab taken before drop"))
    }
}

impl<B: FetchBackend> Drop for TabLease<B> {
    fn drop(&mut self) {
        // The tab must be back in the vec before the permit is released.
        if let Some(tab) = self.tab.take() {
            self.pool.give_back(tab);
        }
    }
}

/// Navigates a pooled tab to the challenged URL and polls its title until
/// the condition holds or the step budget runs out.
pub struct BrowserChallengeSolver<B> {
    pool: Arc<TabPool<B>>,
    max_steps: u32,
    poll_interval: Duration,
}

impl<B: FetchBackend> BrowserChallengeSolver<B> {
    pub fn new(pool: Arc<TabPool<B>>) -> Self {
        Self {
            pool,
            max_steps: DEFAULT_MAX_STEPS,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_max_steps(mut self, steps: u32) -> Self {
        self.max_steps = steps.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn pool(&self) -> &Arc<TabPool<B>> {
        &self.pool
    }
}

#[async_trait]
impl<B: FetchBackend + 'static> ChallengeSolver for BrowserChallengeSolver<B> {
    fn name(&self) -> &'static str {
        "browser"
    }

    async fn solve(&self, request: SolveRequest) -> Result<SolveOutcome, SolverError> {
        log::info!("Attempting to access {} through WAF browser verification.", request.url);
        let mut tab = self.pool.checkout().await?;

        tab.set_headers(&request.headers).await?;
        if !request.cookies.is_empty() {
            let seeded: Vec<BrowserCookie> = request.cookies.iter().map(BrowserCookie::from).collect();
            tab.set_cookies(&seeded).await?;
        }
        tab.navigate(&request.url).await?;

        let mut title = None;
        let mut success = false;
        for step in 1..=self.max_steps {
            sleep(self.poll_interval).await;
            let current = tab.title().await?;
            if request.condition.matches(&current) {
                log::info!("Step-through succeeded after {step} steps (title '{current}')");
                title = Some(current);
                success = true;
                break;
            }
            log::debug!("step {step}: '{current}' does not satisfy {}", request.condition);
            title = Some(current);
        }

        if !success {
            log::error!(
                "Failed to step through {} after {} steps. Last title: {:?}",
                request.url,
                self.max_steps,
                title
            );
        }

        let cookies = tab
            .cookies()
            .await?
            .iter()
            .map(CookieEntry::from_browser)
            .collect();

        Ok(SolveOutcome {
            success,
            cookies,
            title,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::challenges::solvers::TitleCondition;
    use std::collections::VecDeque;

    /// Tab that serves a scripted sequence of titles and then sets a
    /// clearance cookie.
    pub(crate) struct ScriptedTab {
        titles: VecDeque<String>,
        last: String,
        pub(crate) visited: Vec<Url>,
        seeded: Vec<BrowserCookie>,
        clearance: BrowserCookie,
        pub(crate) closed: bool,
    }

    impl ScriptedTab {
        pub(crate) fn new(titles: &[&str], clearance: BrowserCookie) -> Self {
            Self {
                titles: titles.iter().map(|title| title.to_string()).collect(),
                last: String::new(),
                visited: Vec::new(),
                seeded: Vec::new(),
                clearance,
                closed: false,
            }
        }
    }

    #[async_trait]
    impl FetchBackend for ScriptedTab {
        async fn navigate(&mut self, url: &Url) -> Result<(), SolverError> {
            self.visited.push(url.clone());
            Ok(())
        }

        async fn title(&mut self) -> Result<String, SolverError> {
            if let Some(next) = self.titles.pop_front() {
                self.last = next;
            }
            Ok(self.last.clone())
        }

        async fn cookies(&mut self) -> Result<Vec<BrowserCookie>, SolverError> {
            let mut cookies = self.seeded.clone();
            cookies.push(self.clearance.clone());
            Ok(cookies)
        }

        async fn set_cookies(&mut self, cookies: &[BrowserCookie]) -> Result<(), SolverError> {
            self.seeded.extend_from_slice(cookies);
            Ok(())
        }

        async fn close(&mut self) -> Result<(), SolverError> {
            self.closed = true;
            Ok(())
        }
    }

    fn request(condition: TitleCondition) -> SolveRequest {
        SolveRequest {
            url: Url::parse("https://example.com/").unwrap(),
            condition,
            cookies: vec![CookieEntry::new("session", "abc", "example.com")],
            headers: Vec::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn polls_until_title_changes() {
        let tab = ScriptedTab::new(
            &["Just a moment...", "Just a moment...", "Example Domain"],
            BrowserCookie::new("cf_clearance", "ok", ".example.com"),
        );
        let pool = Arc::new(TabPool::new(vec![tab]));
        let solver = BrowserChallengeSolver::new(pool.clone());

        let started = tokio::time::Instant::now();
        let outcome = solver
            .solve(request(TitleCondition::NotContains("Just a moment...".into())))
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.title.as_deref(), Some("Example Domain"));
        assert_eq!(started.elapsed(), Duration::from_secs(3));
        let names: Vec<_> = outcome.cookies.iter().map(|cookie| cookie.name.as_str()).collect();
        assert_eq!(names, ["session", "cf_clearance"]);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_steps_but_keeps_cookies() {
        let tab = ScriptedTab::new(
            &["You are being redirected..."],
            BrowserCookie::new("sucuri_cloudproxy_uuid_1", "x", "example.com"),
        );
        let solver = BrowserChallengeSolver::new(Arc::new(TabPool::new(vec![tab]))).with_max_steps(5);

        let started = tokio::time::Instant::now();
        let outcome = solver
            .solve(request(TitleCondition::NotContains("You are being redirected...".into())))
            .await
            .unwrap();

        assert!(!outcome.success);
        assert_eq!(started.elapsed(), Duration::from_secs(5));
        assert!(outcome.cookies.iter().any(|cookie| cookie.name == "sucuri_cloudproxy_uuid_1"));
    }

    #[tokio::test]
    async fn pool_serialises_access_and_closes_idle_tabs() {
        let tab = ScriptedTab::new(&[], BrowserCookie::new("a", "b", "example.com"));
        let pool = Arc::new(TabPool::new(vec![tab]));

        let lease = pool.checkout().await.unwrap();
        assert_eq!(pool.available(), 0);
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.checkout().await.map(|lease| lease.visited.len()) })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        drop(lease);
        assert_eq!(waiter.await.unwrap().unwrap(), 0);

        pool.close().await.unwrap();
        assert!(matches!(pool.checkout().await, Err(SolverError::PoolClosed)));
        assert!(matches!(
            Arc::new(TabPool::<ScriptedTab>::new(Vec::new())).checkout().await,
            Err(SolverError::EmptyPool)
        ));
    }
}

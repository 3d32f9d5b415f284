//! Captcha provider integrations.
//!
//! Providers expose a two-step `submit`/`poll` API; the shared
//! [`CaptchaProvider::solve`] loop turns that into a single call. Token
//! captchas such as reCAPTCHA have to be solved from this host's address, so
//! [`solve_with_relay`] opens a [`ProxyRelay`] restricted to the provider's
//! worker IPs and hands the provider its WAN address as a SOCKS5 proxy.

mod anticaptcha;
mod twocaptcha;

pub use anticaptcha::{ANTICAPTCHA_WORKER_IPS, AntiCaptchaProvider};
pub use twocaptcha::{TWOCAPTCHA_WORKER_IPS, TwoCaptchaProvider};

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::{Instant, sleep};
use url::Url;

use crate::fetch::FetchError;
use crate::modules::nat::{NatError, NatTraversal};
use crate::modules::proxy::{PeerPolicy, ProxyRelay, RelayError};

/// Timing used by the submit/poll loop.
#[derive(Debug, Clone)]
pub struct CaptchaConfig {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for CaptchaConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60 * 5),
            poll_interval: Duration::from_secs(8),
        }
    }
}

/// Default time allowed for token captchas.
pub const RECAPTCHA_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Work submitted to a provider.
#[derive(Debug, Clone)]
pub enum CaptchaTask {
    /// Plain image captcha; the answer is the text in the image.
    Image { data: Vec<u8>, file_name: String },
    /// reCAPTCHA v2 to be solved through `proxy`.
    Recaptcha {
        site_key: String,
        page_url: Url,
        proxy: Option<SocketAddr>,
        user_agent: Option<String>,
    },
}

impl CaptchaTask {
    pub fn image(data: impl Into<Vec<u8>>, file_name: impl Into<String>) -> Self {
        CaptchaTask::Image {
            data: data.into(),
            file_name: file_name.into(),
        }
    }

    pub fn recaptcha(site_key: impl Into<String>, page_url: Url) -> Self {
        CaptchaTask::Recaptcha {
            site_key: site_key.into(),
            page_url,
            proxy: None,
            user_agent: None,
        }
    }

    pub fn with_proxy(mut self, address: SocketAddr) -> Self {
        if let CaptchaTask::Recaptcha { proxy, .. } = &mut self {
            *proxy = Some(address);
        }
        self
    }

    pub fn with_user_agent(mut self, agent: impl Into<String>) -> Self {
        if let CaptchaTask::Recaptcha { user_agent, .. } = &mut self {
            *user_agent = Some(agent.into());
        }
        self
    }
}

/// Provider-side identifier of a submitted task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptchaTaskId(pub String);

impl fmt::Display for CaptchaTaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    Ready(String),
    NotReady,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptchaSolution {
    pub token: String,
    pub task_id: CaptchaTaskId,
}

pub type CaptchaResult<T> = Result<T, CaptchaError>;

#[derive(Debug, Error)]
pub enum CaptchaError {
    #[error("captcha not ready yet")]
    NotReady,
    #[error("captcha provider returned failure: {0}")]
    Provider(String),
    #[error("solving captcha timed out after {0:?}")]
    Timeout(Duration),
    #[error("captcha provider misconfigured: {0}")]
    Configuration(String),
    #[error("malformed provider response: {0}")]
    Malformed(String),
    #[error("captcha api call failed: {0}")]
    Fetch(Box<FetchError>),
    #[error("nat traversal failed: {0}")]
    Nat(#[from] NatError),
    #[error("proxy relay failed: {0}")]
    Relay(#[from] RelayError),
}

impl From<FetchError> for CaptchaError {
    fn from(err: FetchError) -> Self {
        CaptchaError::Fetch(Box::new(err))
    }
}

#[async_trait]
pub trait CaptchaProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn config(&self) -> &CaptchaConfig;

    /// Addresses the provider's workers connect from.
    fn worker_ips(&self) -> Vec<IpAddr>;

    async fn balance(&self) -> CaptchaResult<f64>;

    async fn submit(&self, task: &CaptchaTask) -> CaptchaResult<CaptchaTaskId>;

    async fn poll(&self, id: &CaptchaTaskId) -> CaptchaResult<PollStatus>;

    /// Submit `task` and poll every `poll_interval` until it is solved or
    /// `timeout` (default: the provider's configured timeout) passes.
    async fn solve(&self, task: &CaptchaTask, timeout: Option<Duration>) -> CaptchaResult<CaptchaSolution> {
        let config = self.config();
        let timeout = timeout.unwrap_or(config.timeout);
        let interval = config.poll_interval.max(Duration::from_millis(1));
        let polls = (timeout.as_millis() / interval.as_millis()) as u64 + 1;

        let task_id = self.submit(task).await?;
        log::info!("{} accepted captcha task {task_id}", self.name());

        let started = Instant::now();
        for poll in 1..=polls {
            log::info!(
                "Sleeping {:?} (poll {poll} of {polls}, elapsed {:.2}s of {:.2}s).",
                interval,
                started.elapsed().as_secs_f64(),
                timeout.as_secs_f64()
            );
            sleep(interval).await;

            match self.poll(&task_id).await {
                Ok(PollStatus::Ready(token)) => {
                    log::info!("captcha task {task_id} solved");
                    return Ok(CaptchaSolution { token, task_id });
                }
                Ok(PollStatus::NotReady) | Err(CaptchaError::NotReady) => {
                    log::info!("Captcha not ready. Waiting longer.");
                }
                Err(err) => return Err(err),
            }
        }

        Err(CaptchaError::Timeout(started.elapsed()))
    }
}

/// Solve a reCAPTCHA through a relay on this host.
///
/// The relay only admits the provider's worker IPs and is stopped whether
/// or not solving succeeds.
pub async fn solve_with_relay(
    provider: &dyn CaptchaProvider,
    nat: Arc<NatTraversal>,
    site_key: &str,
    page_url: &Url,
    user_agent: Option<&str>,
    timeout: Option<Duration>,
) -> CaptchaResult<CaptchaSolution> {
    let mut relay = ProxyRelay::start(nat, PeerPolicy::only(provider.worker_ips())).await?;

    let result = async {
        let proxy = relay.wan_address().await?;
        log::info!("{} will reach {page_url} through relay {proxy}", provider.name());
        let mut task = CaptchaTask::recaptcha(site_key, page_url.clone()).with_proxy(proxy);
        if let Some(agent) = user_agent {
            task = task.with_user_agent(agent);
        }
        provider
            .solve(&task, Some(timeout.unwrap_or(RECAPTCHA_TIMEOUT)))
            .await
    }
    .await;

    if let Err(err) = relay.stop().await {
        log::warn!("failed to stop captcha relay cleanly: {err}");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::nat::tests::FakeGateway;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountdownProvider {
        config: CaptchaConfig,
        remaining: AtomicUsize,
        submitted: Mutex<Vec<CaptchaTask>>,
    }

    impl CountdownProvider {
        fn new(polls_until_ready: usize) -> Self {
            Self {
                config: CaptchaConfig::default(),
                remaining: AtomicUsize::new(polls_until_ready),
                submitted: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CaptchaProvider for CountdownProvider {
        fn name(&self) -> &'static str {
            "countdown"
        }

        fn config(&self) -> &CaptchaConfig {
            &self.config
        }

        fn worker_ips(&self) -> Vec<IpAddr> {
            vec![IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7))]
        }

        async fn balance(&self) -> CaptchaResult<f64> {
            Ok(1.0)
        }

        async fn submit(&self, task: &CaptchaTask) -> CaptchaResult<CaptchaTaskId> {
            self.submitted.lock().unwrap().push(task.clone());
            Ok(CaptchaTaskId("42".into()))
        }

        async fn poll(&self, _id: &CaptchaTaskId) -> CaptchaResult<PollStatus> {
            match self.remaining.fetch_sub(1, Ordering::SeqCst) {
                1 => Ok(PollStatus::Ready("token".into())),
                0 => Err(CaptchaError::Provider("ERROR_CAPTCHA_UNSOLVABLE".into())),
                _ => Err(CaptchaError::NotReady),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn solve_polls_until_ready() {
        let provider = CountdownProvider::new(3);
        let started = Instant::now();
        let solution = provider
            .solve(&CaptchaTask::image(vec![1, 2, 3], "captcha.png"), None)
            .await
            .unwrap();
        assert_eq!(solution.token, "token");
        assert_eq!(solution.task_id, CaptchaTaskId("42".into()));
        assert_eq!(started.elapsed(), Duration::from_secs(24));
    }

    #[tokio::test(start_paused = true)]
    async fn solve_times_out() {
        let provider = CountdownProvider::new(usize::MAX);
        let err = provider
            .solve(
                &CaptchaTask::image(vec![1], "captcha.png"),
                Some(Duration::from_secs(20)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CaptchaError::Timeout(elapsed) if elapsed == Duration::from_secs(24)));
    }

    #[tokio::test]
    async fn relay_is_stopped_after_solving() {
        let gateway = Arc::new(FakeGateway::default());
        let nat = Arc::new(NatTraversal::with_gateway(
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)),
            gateway.clone(),
        ));
        let provider = CountdownProvider {
            config: CaptchaConfig {
                timeout: Duration::from_secs(1),
                poll_interval: Duration::from_millis(5),
            },
            remaining: AtomicUsize::new(1),
            submitted: Mutex::new(Vec::new()),
        };

        let page = Url::parse("https://example.com/form").unwrap();
        let solution = solve_with_relay(&provider, nat, "site-key", &page, Some("agent/1.0"), None)
            .await
            .unwrap();
        assert_eq!(solution.token, "token");
        assert_eq!(gateway.active(), 0);

        let submitted = provider.submitted.lock().unwrap();
        match &submitted[0] {
            CaptchaTask::Recaptcha { proxy, user_agent, site_key, .. } => {
                let proxy = proxy.unwrap();
                assert_eq!(proxy.ip(), IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)));
                assert_eq!(user_agent.as_deref(), Some("agent/1.0"));
                assert_eq!(site_key, "site-key");
            }
            other => panic!("unexpected task {other:?}"),
        }
    }
}

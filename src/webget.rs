//! High level fetch client.
//!
//! Wires the fetch engine, cookie jar and challenge escalation together. A
//! page that turns out to be a WAF interstitial is handed to the solver
//! registered for that WAF, the solver's cookies land in the shared jar and
//! the request is replayed once.

use std::borrow::Cow;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use scraper::Html;
use serde_json::Value;
use tokio::time::sleep;
use url::Url;

use crate::challenges::detectors::{ChallengeDetection, ChallengeKind};
use crate::challenges::escalation::EscalationDispatcher;
use crate::challenges::solvers::browser::{BrowserChallengeSolver, FetchBackend, TabPool};
use crate::challenges::solvers::{ChallengeSolver, TitleCondition};
use crate::config::{Credential, StepThroughConfig, WebGetConfig};
use crate::cookies::{BrowserCookie, CookieEntry, CookieJar, CookieLock, SaveOutcome};
use crate::fetch::{
	EngineSettings, FetchEngine, FetchError, FetchOptions, FetchOutcome, FetchResult, FetchResultT,
	normalize_iri,
};
use crate::modules::events::{ChallengeStage, EventDispatcher, EventHandler};
use crate::transport::{PageContent, decode_json_bytes};

const PREEMPTIVE_SIGNATURE: &str = "preemptive-host";

type SolverFactory = Box<dyn FnOnce(&StepThroughConfig) -> Arc<dyn ChallengeSolver> + Send>;

/// Fluent builder for [`WebGet`].
pub struct WebGetBuilder {
	config: WebGetConfig,
	solvers: Vec<(ChallengeKind, SolverFactory)>,
	handlers: Vec<Arc<dyn EventHandler>>,
	cookie_lock: Option<CookieLock>,
	log_events: bool,
}

impl WebGetBuilder {
	pub fn new() -> Self {
		Self {
			config: WebGetConfig::default(),
			solvers: Vec::new(),
			handlers: Vec::new(),
			cookie_lock: None,
			log_events: true,
		}
	}

	/// Replace the whole configuration. Setters called afterwards adjust it.
	pub fn with_config(mut self, config: WebGetConfig) -> Self {
		self.config = config;
		self
	}

	pub fn max_attempts(mut self, attempts: u32) -> Self {
		self.config.max_attempts = attempts.max(1);
		self
	}

	pub fn retry_delay(mut self, delay: Duration) -> Self {
		self.config.retry_delay_ms = delay.as_millis() as u64;
		self
	}

	pub fn auto_waf(mut self, enabled: bool) -> Self {
		self.config.auto_waf = enabled;
		self
	}

	pub fn cookie_file(mut self, path: impl Into<PathBuf>) -> Self {
		self.config.cookie_file = Some(path.into());
		self
	}

	/// Guard cookie file writes with a lock shared between clients.
	pub fn cookie_lock(mut self, lock: CookieLock) -> Self {
		self.cookie_lock = Some(lock);
		self
	}

	pub fn default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
		self.config.default_headers.insert(name.into(), value.into());
		self
	}

	pub fn credential(mut self, credential: Credential) -> Self {
		self.config.credentials.push(credential);
		self
	}

	/// Route every fetch through a SOCKS proxy; `None` keeps the configured
	/// endpoint.
	pub fn use_socks(mut self, proxy: Option<&str>) -> Self {
		self.config.use_socks = true;
		if let Some(proxy) = proxy {
			self.config.socks_proxy = proxy.to_string();
		}
		self
	}

	/// Treat `host` as WAF-wrapped even before any challenge was seen.
	pub fn preemptive_host(mut self, host: impl Into<String>, kind: ChallengeKind) -> Self {
		self.config
			.preemptive_waf_hosts
			.insert(host.into().to_ascii_lowercase(), kind);
		self
	}

	pub fn with_solver(mut self, kind: ChallengeKind, solver: Arc<dyn ChallengeSolver>) -> Self {
		let factory: SolverFactory = Box::new(move |_: &StepThroughConfig| solver);
		self.solvers.push((kind, factory));
		self
	}

	/// Register a browser solver over `pool`, using the step-through limits
	/// of the final configuration.
	pub fn with_browser_solver<B>(mut self, kind: ChallengeKind, pool: Arc<TabPool<B>>) -> Self
	where
		B: FetchBackend + 'static,
	{
		let factory: SolverFactory = Box::new(move |step_through: &StepThroughConfig| {
			let solver: Arc<dyn ChallengeSolver> = Arc::new(
				BrowserChallengeSolver::new(pool)
					.with_max_steps(step_through.max_steps)
					.with_poll_interval(step_through.poll_interval()),
			);
			solver
		});
		self.solvers.push((kind, factory));
		self
	}

	pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
		self.handlers.push(handler);
		self
	}

	/// Do not install the default logging handler.
	pub fn without_event_logging(mut self) -> Self {
		self.log_events = false;
		self
	}

	pub fn build(self) -> FetchResultT<WebGet> {
		let config = self.config;
		config.validate()?;

		let jar = Arc::new(match &config.cookie_file {
			Some(path) => CookieJar::with_file(path.clone(), self.cookie_lock),
			None => CookieJar::new(),
		});

		let mut events = if self.log_events {
			EventDispatcher::with_logging()
		} else {
			EventDispatcher::new()
		};
		for handler in self.handlers {
			events.register_handler(handler);
		}
		let events = Arc::new(events);

		let client = build_client(&config, jar.clone())?;
		let engine = FetchEngine::new(
			client,
			EngineSettings {
				max_attempts: config.max_attempts,
				retry_delay: config.retry_delay(),
				default_headers: config.header_list(),
				credentials: config.credentials.clone(),
			},
			events.clone(),
		);

		let mut escalation = EscalationDispatcher::new(events.clone());
		for (kind, factory) in self.solvers {
			escalation.register(kind, factory(&config.step_through));
		}

		Ok(WebGet {
			inner: Arc::new(WebGetInner {
				config,
				engine,
				jar,
				escalation,
				events,
			}),
		})
	}
}

impl Default for WebGetBuilder {
	fn default() -> Self {
		Self::new()
	}
}

fn build_client(config: &WebGetConfig, jar: Arc<CookieJar>) -> FetchResultT<reqwest::Client> {
	let mut builder = reqwest::Client::builder()
		.cookie_provider(jar)
		.timeout(config.request_timeout())
		.connect_timeout(config.socket_timeout());

	if config.use_socks {
		log::info!("Routing fetches through SOCKS proxy {}", config.socks_proxy);
		builder = builder.proxy(reqwest::Proxy::all(config.socks_proxy.as_str())?);
	}

	Ok(builder.build()?)
}

struct WebGetInner {
	config: WebGetConfig,
	engine: FetchEngine,
	jar: Arc<CookieJar>,
	escalation: EscalationDispatcher,
	events: Arc<EventDispatcher>,
}

/// Retrying, WAF-aware HTTP client. Clones share the engine and cookie jar.
#[derive(Clone)]
pub struct WebGet {
	inner: Arc<WebGetInner>,
}

impl fmt::Debug for WebGet {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("WebGet")
			.field("max_attempts", &self.inner.config.max_attempts)
			.field("auto_waf", &self.inner.config.auto_waf)
			.field("cookies", &self.inner.jar.len())
			.field("escalation", &self.inner.escalation)
			.finish()
	}
}

impl WebGet {
	/// Client with the default configuration.
	pub fn new() -> FetchResultT<Self> {
		WebGetBuilder::new().build()
	}

	pub fn builder() -> WebGetBuilder {
		WebGetBuilder::new()
	}

	pub fn from_config(config: WebGetConfig) -> FetchResultT<Self> {
		WebGetBuilder::new().with_config(config).build()
	}

	pub fn config(&self) -> &WebGetConfig {
		&self.inner.config
	}

	pub fn cookie_jar(&self) -> &Arc<CookieJar> {
		&self.inner.jar
	}

	pub fn escalation(&self) -> &EscalationDispatcher {
		&self.inner.escalation
	}

	pub fn events(&self) -> &Arc<EventDispatcher> {
		&self.inner.events
	}

	/// Fetch `url`, stepping through a WAF challenge when one is met.
	pub async fn fetch(&self, url: &str, options: FetchOptions) -> FetchResultT<FetchResult> {
		let url = normalize_iri(url)?;
		self.fetch_url(&url, &options).await
	}

	async fn fetch_url(&self, url: &Url, options: &FetchOptions) -> FetchResultT<FetchResult> {
		let inner = &self.inner;
		let outcome = match self.preemptive_challenge(url) {
			Some(detection) => FetchOutcome::Challenge(detection),
			None => inner.engine.fetch(url, options).await?,
		};

		let detection = match outcome {
			FetchOutcome::Page(page) => return Ok(page),
			FetchOutcome::Challenge(detection) => detection,
		};

		if !inner.config.auto_waf {
			return Err(FetchError::ChallengeDetected {
				kind: detection.kind,
				url: detection.url,
			});
		}

		let kind = detection.kind;
		let solved = inner
			.escalation
			.attempt_escalation(kind, url, &inner.jar, &inner.config.header_list())
			.await?;
		if !solved {
			return Err(FetchError::failure(
				format!("Could not step through {kind} challenge"),
				url.as_str(),
			));
		}

		match inner.engine.fetch(url, options).await? {
			FetchOutcome::Page(page) => {
				inner.events.challenge(url.as_str(), kind, ChallengeStage::Replayed);
				Ok(page)
			}
			FetchOutcome::Challenge(again) => {
				log::error!("{url} still returned a {} challenge after stepping through", again.kind);
				Err(FetchError::failure(
					format!("Still blocked by {} challenge after step-through", again.kind),
					url.as_str(),
				))
			}
		}
	}

	/// A synthetic detection for pre-emptive hosts we hold no clearance
	/// cookie for.
	fn preemptive_challenge(&self, url: &Url) -> Option<ChallengeDetection> {
		let host = url.host_str()?;
		let kind = self.inner.config.preemptive_kind(host)?;
		if self
			.inner
			.jar
			.has_cookie_prefix(host, kind.clearance_cookie_prefix())
		{
			return None;
		}
		log::info!("{host} is a known {kind} host and we hold no clearance cookie");
		self.inner
			.events
			.challenge(url.as_str(), kind, ChallengeStage::Preempted);
		Some(ChallengeDetection {
			kind,
			signature_id: PREEMPTIVE_SIGNATURE,
			url: url.to_string(),
		})
	}

	/// Decoded content of `url`: text for textual types, bytes otherwise.
	pub async fn get_page(&self, url: &str) -> FetchResultT<PageContent> {
		Ok(self.fetch(url, FetchOptions::new()).await?.content)
	}

	pub async fn get_soup(&self, url: &str) -> FetchResultT<Html> {
		self.get_soup_with(url, FetchOptions::new()).await
	}

	pub async fn get_soup_with(&self, url: &str, options: FetchOptions) -> FetchResultT<Html> {
		let page = self.fetch(url, options).await?;
		match page.content {
			PageContent::Text(text) => Ok(Html::parse_document(&text)),
			PageContent::Bytes(_) => Err(FetchError::ContentType(format!(
				"Asked to parse binary content from {} as HTML ({})",
				page.url,
				page.content_type().unwrap_or("no content type")
			))),
		}
	}

	/// Parse `url` as HTML, failing with [`FetchError::Redirected`] if the
	/// server redirects.
	pub async fn get_soup_no_redirects(&self, url: &str) -> FetchResultT<Html> {
		self.get_soup_with(url, FetchOptions::new().forbid_redirects()).await
	}

	pub async fn get_json(&self, url: &str) -> FetchResultT<Value> {
		self.get_json_with(url, FetchOptions::new()).await
	}

	/// Fetch and parse JSON. A body that does not parse is fetched once more
	/// after the retry delay before giving up.
	pub async fn get_json_with(&self, url: &str, options: FetchOptions) -> FetchResultT<Value> {
		let url = normalize_iri(url)?;
		let mut refetched = false;
		loop {
			let page = self.fetch_url(&url, &options).await?;
			let text = match &page.content {
				PageContent::Text(text) => Cow::Borrowed(text.as_str()),
				PageContent::Bytes(bytes) => Cow::Owned(decode_json_bytes(bytes)?),
			};

			match serde_json::from_str(&text) {
				Ok(value) => return Ok(value),
				Err(err) if !refetched => {
					log::warn!("Response from {url} is not valid json ({err}), fetching it again");
					refetched = true;
					sleep(self.inner.engine.retry_delay()).await;
				}
				Err(err) => {
					log::error!("Could not decode json from {url}: {err}");
					return Err(err.into());
				}
			}
		}
	}

	/// Raw content and file name of `url`.
	pub async fn get_file_and_name(&self, url: &str) -> FetchResultT<(Vec<u8>, String)> {
		let (content, name, _) = self.get_file_name_mime(url).await?;
		Ok((content, name))
	}

	/// Raw content, file name and mime type of `url`.
	pub async fn get_file_name_mime(&self, url: &str) -> FetchResultT<(Vec<u8>, String, Option<String>)> {
		let page = self.fetch(url, FetchOptions::new()).await?;
		let name = page.file_name();
		let mime = page.mime_type();
		Ok((page.content.into_bytes(), name, mime))
	}

	/// Final URL of `url` after redirects, found with `HEAD` requests.
	pub async fn get_head(&self, url: &str) -> FetchResultT<Url> {
		let url = normalize_iri(url)?;
		self.inner
			.engine
			.head(&url, self.inner.config.head_attempts, &[])
			.await
	}

	/// Drive the first registered solver through an arbitrary JS WAF until
	/// `condition` holds for the page title.
	pub async fn step_through_js_waf(&self, url: &str, condition: TitleCondition) -> FetchResultT<bool> {
		let url = normalize_iri(url)?;
		self.inner
			.escalation
			.step_through(&url, condition, &self.inner.jar, &self.inner.config.header_list())
			.await
	}

	pub async fn step_through_cloudflare(&self, url: &str) -> FetchResultT<bool> {
		self.step_through_js_waf(url, TitleCondition::for_kind(ChallengeKind::Cloudflare))
			.await
	}

	pub async fn step_through_sucuri(&self, url: &str) -> FetchResultT<bool> {
		self.step_through_js_waf(url, TitleCondition::for_kind(ChallengeKind::Sucuri))
			.await
	}

	pub fn add_cookie(&self, cookie: CookieEntry) {
		self.inner.jar.add(cookie);
	}

	pub fn add_browser_cookie(&self, cookie: &BrowserCookie) {
		self.inner.jar.add(CookieEntry::from_browser(cookie));
	}

	pub fn cookies(&self) -> Vec<CookieEntry> {
		self.inner.jar.all()
	}

	pub async fn clear_cookies(&self) -> FetchResultT<SaveOutcome> {
		Ok(self.inner.jar.clear().await?)
	}

	pub async fn save_cookies(&self) -> FetchResultT<SaveOutcome> {
		Ok(self.inner.jar.save().await?)
	}
}

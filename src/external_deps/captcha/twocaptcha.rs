use std::net::{IpAddr, Ipv4Addr};

use async_trait::async_trait;
use serde_json::Value;
use url::Url;

use super::{CaptchaConfig, CaptchaError, CaptchaProvider, CaptchaResult, CaptchaTask, CaptchaTaskId, PollStatus};
use crate::fetch::{FetchOptions, MultipartForm};
use crate::webget::WebGet;

/// Address 2captcha workers connect from.
pub const TWOCAPTCHA_WORKER_IPS: [IpAddr; 1] = [IpAddr::V4(Ipv4Addr::new(138, 201, 188, 166))];

const DEFAULT_BASE_URL: &str = "https://2captcha.com";
const NOT_READY: &str = "CAPCHA_NOT_READY";

/// 2captcha.com adapter over the `in.php` / `res.php` JSON API.
#[derive(Debug, Clone)]
pub struct TwoCaptchaProvider {
    api_key: String,
    web: WebGet,
    base_url: Url,
    config: CaptchaConfig,
}

impl TwoCaptchaProvider {
    pub fn new(api_key: impl Into<String>, web: WebGet) -> CaptchaResult<Self> {
        let base_url = Url::parse(DEFAULT_BASE_URL)
            .map_err(|err| CaptchaError::Configuration(err.to_string()))?;
        Ok(Self {
            api_key: api_key.into(),
            web,
            base_url,
            config: CaptchaConfig::default(),
        })
    }

    /// Point the adapter at another API host.
    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = base_url;
        self
    }

    pub fn with_config(mut self, config: CaptchaConfig) -> Self {
        self.config = config;
        self
    }

    fn endpoint(&self, path: &str, query: &[(&str, String)]) -> CaptchaResult<Url> {
        let mut url = self
            .base_url
            .join(path)
            .map_err(|err| CaptchaError::Configuration(err.to_string()))?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("key", &self.api_key);
            for (name, value) in query {
                pairs.append_pair(name, value);
            }
            pairs.append_pair("json", "1");
        }
        Ok(url)
    }

    async fn call(&self, path: &str, query: &[(&str, String)]) -> CaptchaResult<String> {
        let url = self.endpoint(path, query)?;
        let response = self.web.get_json(url.as_str()).await?;
        process_response(&response)
    }
}

/// Unwrap `{"status": 1, "request": ...}`; `CAPCHA_NOT_READY` becomes
/// [`CaptchaError::NotReady`], any other non-1 status is a provider error.
fn process_response(response: &Value) -> CaptchaResult<String> {
    let request = match response.get("request") {
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
        None => return Err(CaptchaError::Malformed(response.to_string())),
    };
    match response.get("status").and_then(Value::as_i64) {
        Some(1) => Ok(request),
        _ if request == NOT_READY => Err(CaptchaError::NotReady),
        _ => {
            log::error!("[TwoCaptchaProvider] error response: {request}");
            Err(CaptchaError::Provider(request))
        }
    }
}

#[async_trait]
impl CaptchaProvider for TwoCaptchaProvider {
    fn name(&self) -> &'static str {
        "twocaptcha"
    }

    fn config(&self) -> &CaptchaConfig {
        &self.config
    }

    fn worker_ips(&self) -> Vec<IpAddr> {
        TWOCAPTCHA_WORKER_IPS.to_vec()
    }

    async fn balance(&self) -> CaptchaResult<f64> {
        let balance = self.call("res.php", &[("action", "getbalance".into())]).await?;
        balance
            .trim()
            .parse()
            .map_err(|_| CaptchaError::Malformed(format!("balance `{balance}`")))
    }

    async fn submit(&self, task: &CaptchaTask) -> CaptchaResult<CaptchaTaskId> {
        let id = match task {
            CaptchaTask::Image { data, file_name } => {
                log::info!("Uploading to 2Captcha.com.");
                let url = self.endpoint("in.php", &[])?;
                let form = MultipartForm::new()
                    .text("key", self.api_key.clone())
                    .text("method", "post")
                    .text("json", "1")
                    .file("file", file_name.clone(), None, data.clone());
                let response = self
                    .web
                    .get_json_with(url.as_str(), FetchOptions::new().multipart(form))
                    .await?;
                process_response(&response)?
            }
            CaptchaTask::Recaptcha {
                site_key,
                page_url,
                proxy,
                ..
            } => {
                let mut query = vec![
                    ("method", "userrecaptcha".to_string()),
                    ("googlekey", site_key.clone()),
                    ("pageurl", page_url.to_string()),
                ];
                if let Some(proxy) = proxy {
                    query.push(("proxy", proxy.to_string()));
                    query.push(("proxytype", "SOCKS5".to_string()));
                }
                self.call("in.php", &query).await?
            }
        };
        Ok(CaptchaTaskId(id))
    }

    async fn poll(&self, id: &CaptchaTaskId) -> CaptchaResult<PollStatus> {
        match self
            .call("res.php", &[("action", "get".into()), ("id", id.0.clone())])
            .await
        {
            Ok(token) => Ok(PollStatus::Ready(token)),
            Err(CaptchaError::NotReady) => Ok(PollStatus::NotReady),
            Err(err) => Err(err),
        }
    }
}

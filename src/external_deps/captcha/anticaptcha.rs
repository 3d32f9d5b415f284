use std::net::{IpAddr, Ipv4Addr};

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use serde_json::{Value, json};
use url::Url;

use super::{CaptchaConfig, CaptchaError, CaptchaProvider, CaptchaResult, CaptchaTask, CaptchaTaskId, PollStatus};
use crate::fetch::FetchOptions;
use crate::webget::WebGet;

/// Addresses anti-captcha workers connect from.
pub const ANTICAPTCHA_WORKER_IPS: [IpAddr; 2] = [
    IpAddr::V4(Ipv4Addr::new(69, 65, 41, 21)),
    IpAddr::V4(Ipv4Addr::new(209, 212, 146, 168)),
];

const DEFAULT_BASE_URL: &str = "https://api.anti-captcha.com";

/// Envelope shared by every anti-captcha API response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiResponse {
    #[serde(default)]
    error_id: i64,
    error_code: Option<String>,
    error_description: Option<String>,
    task_id: Option<Value>,
    status: Option<String>,
    solution: Option<Solution>,
    balance: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Solution {
    text: Option<String>,
    g_recaptcha_response: Option<String>,
}

impl ApiResponse {
    fn into_result(self) -> CaptchaResult<Self> {
        if self.error_id == 0 {
            return Ok(self);
        }
        Err(CaptchaError::Provider(format!(
            "Failure solving captcha: {}, {}, {}",
            self.error_id,
            self.error_code.as_deref().unwrap_or("unknown"),
            self.error_description.as_deref().unwrap_or("")
        )))
    }
}

/// anti-captcha.com adapter over the `createTask` / `getTaskResult` API.
#[derive(Debug, Clone)]
pub struct AntiCaptchaProvider {
    api_key: String,
    web: WebGet,
    base_url: Url,
    config: CaptchaConfig,
}

impl AntiCaptchaProvider {
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

    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = base_url;
        self
    }

    pub fn with_config(mut self, config: CaptchaConfig) -> Self {
        self.config = config;
        self
    }

    async fn call(&self, method: &str, mut payload: Value) -> CaptchaResult<ApiResponse> {
        let url = self
            .base_url
            .join(method)
            .map_err(|err| CaptchaError::Configuration(err.to_string()))?;
        payload["clientKey"] = Value::String(self.api_key.clone());
        let body = serde_json::to_vec(&payload).map_err(|err| CaptchaError::Malformed(err.to_string()))?;

        let options = FetchOptions::new()
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .raw_body(body);
        let response = self.web.get_json_with(url.as_str(), options).await?;
        let parsed: ApiResponse =
            serde_json::from_value(response).map_err(|err| CaptchaError::Malformed(err.to_string()))?;
        parsed.into_result()
    }

    fn task_payload(task: &CaptchaTask) -> CaptchaResult<Value> {
        match task {
            CaptchaTask::Image { data, .. } => Ok(json!({
                "type": "ImageToTextTask",
                "body": STANDARD.encode(data),
            })),
            CaptchaTask::Recaptcha {
                site_key,
                page_url,
                proxy,
                user_agent,
            } => {
                let proxy = proxy.ok_or_else(|| {
                    CaptchaError::Configuration("anti-captcha recaptcha tasks need a proxy".into())
                })?;
                Ok(json!({
                    "type": "NoCaptchaTask",
                    "websiteURL": page_url.as_str(),
                    "websiteKey": site_key,
                    "proxyType": "socks5",
                    "proxyAddress": proxy.ip().to_string(),
                    "proxyPort": proxy.port(),
                    "userAgent": user_agent.as_deref().unwrap_or_default(),
                }))
            }
        }
    }
}

#[async_trait]
impl CaptchaProvider for AntiCaptchaProvider {
    fn name(&self) -> &'static str {
        "anticaptcha"
    }

    fn config(&self) -> &CaptchaConfig {
        &self.config
    }

    fn worker_ips(&self) -> Vec<IpAddr> {
        ANTICAPTCHA_WORKER_IPS.to_vec()
    }

    async fn balance(&self) -> CaptchaResult<f64> {
        self.call("getBalance", json!({}))
            .await?
            .balance
            .ok_or_else(|| CaptchaError::Malformed("balance missing".into()))
    }

    async fn submit(&self, task: &CaptchaTask) -> CaptchaResult<CaptchaTaskId> {
        let payload = json!({ "task": Self::task_payload(task)? });
        let response = self.call("createTask", payload).await?;
        match response.task_id {
            Some(Value::String(id)) => Ok(CaptchaTaskId(id)),
            Some(Value::Number(id)) => Ok(CaptchaTaskId(id.to_string())),
            _ => Err(CaptchaError::Malformed("taskId missing".into())),
        }
    }

    async fn poll(&self, id: &CaptchaTaskId) -> CaptchaResult<PollStatus> {
        let task_id = id.0.parse::<u64>().map(Value::from).unwrap_or_else(|_| Value::String(id.0.clone()));
        let response = self.call("getTaskResult", json!({ "taskId": task_id })).await?;
        if response.status.as_deref() != Some("ready") {
            return Ok(PollStatus::NotReady);
        }
        let solution = response
            .solution
            .ok_or_else(|| CaptchaError::Malformed("ready task without solution".into()))?;
        solution
            .g_recaptcha_response
            .or(solution.text)
            .map(PollStatus::Ready)
            .ok_or_else(|| CaptchaError::Malformed("solution carries no answer".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> AntiCaptchaProvider {
        AntiCaptchaProvider::new("secret", WebGet::new().unwrap())
            .unwrap()
            .with_base_url(Url::parse(&server.uri()).unwrap())
            .with_config(CaptchaConfig {
                timeout: Duration::from_secs(1),
                poll_interval: Duration::from_millis(10),
            })
    }

    #[tokio::test]
    async fn image_task_is_base64_encoded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/createTask"))
            .and(body_partial_json(json!({
                "clientKey": "secret",
                "task": {"type": "ImageToTextTask", "body": "AQID"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"errorId": 0, "taskId": 31})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/getTaskResult"))
            .and(body_partial_json(json!({"taskId": 31})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errorId": 0,
                "status": "ready",
                "solution": {"text": "w4xyz"}
            })))
            .mount(&server)
            .await;

        let solution = provider(&server)
            .solve(&CaptchaTask::image(vec![1, 2, 3], "c.png"), None)
            .await
            .unwrap();
        assert_eq!(solution.token, "w4xyz");
        assert_eq!(solution.task_id, CaptchaTaskId("31".into()));
    }

    #[tokio::test]
    async fn api_errors_surface_as_provider_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/getBalance"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errorId": 1,
                "errorCode": "ERROR_KEY_DOES_NOT_EXIST",
                "errorDescription": "Account authorization key not found in the system"
            })))
            .mount(&server)
            .await;

        let err = provider(&server).balance().await.unwrap_err();
        assert!(matches!(err, CaptchaError::Provider(ref msg) if msg.contains("ERROR_KEY_DOES_NOT_EXIST")));
    }

    #[test]
    fn recaptcha_requires_proxy() {
        let task = CaptchaTask::recaptcha("key", Url::parse("https://example.com/").unwrap());
        assert!(matches!(
            AntiCaptchaProvider::task_payload(&task),
            Err(CaptchaError::Configuration(_))
        ));

        let payload = AntiCaptchaProvider::task_payload(
            &task.with_proxy("203.0.113.9:40000".parse().unwrap()).with_user_agent("agent"),
        )
        .unwrap();
        assert_eq!(payload["proxyAddress"], "203.0.113.9");
        assert_eq!(payload["proxyPort"], 40000);
        assert_eq!(payload["type"], "NoCaptchaTask");
    }
}

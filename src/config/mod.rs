//! Client configuration.
//!
//! [`WebGetConfig`] carries every tunable of a `WebGet` client. It can be
//! deserialised from JSON (all fields optional, missing ones take their
//! defaults) and is otherwise adjusted through `WebGetBuilder`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::challenges::detectors::ChallengeKind;

pub const DEFAULT_SOCKS_PROXY: &str = "socks5h://127.0.0.1:9050";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// HTTP basic-auth credentials sent pre-emptively to every URL starting
/// with `url_prefix`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub url_prefix: String,
    pub username: String,
    pub password: String,
}

/// Browser step-through polling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepThroughConfig {
    pub max_steps: u32,
    pub poll_interval_ms: u64,
}

impl Default for StepThroughConfig {
    fn default() -> Self {
        Self {
            max_steps: 20,
            poll_interval_ms: 1000,
        }
    }
}

impl StepThroughConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebGetConfig {
    /// Attempts per fetch; 1 means no retry.
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub request_timeout_secs: u64,
    /// Connect timeout, also used by NAT discovery.
    pub socket_timeout_secs: u64,
    /// Escalate detected challenges to registered solvers.
    pub auto_waf: bool,
    pub cookie_file: Option<PathBuf>,
    pub default_headers: BTreeMap<String, String>,
    pub use_socks: bool,
    pub socks_proxy: String,
    pub credentials: Vec<Credential>,
    /// Hosts known to sit behind a WAF, keyed by lowercase host name.
    pub preemptive_waf_hosts: BTreeMap<String, ChallengeKind>,
    pub step_through: StepThroughConfig,
    pub head_attempts: u32,
}

impl Default for WebGetConfig {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            retry_delay_ms: 10,
            request_timeout_secs: 30,
            socket_timeout_secs: 5,
            auto_waf: true,
            cookie_file: None,
            default_headers: default_headers(),
            use_socks: false,
            socks_proxy: DEFAULT_SOCKS_PROXY.to_string(),
            credentials: Vec::new(),
            preemptive_waf_hosts: BTreeMap::new(),
            step_through: StepThroughConfig::default(),
            head_attempts: 4,
        }
    }
}

fn default_headers() -> BTreeMap<String, String> {
    [
        (
            "User-Agent",
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
        ),
        (
            "Accept",
            "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
        ),
        ("Accept-Language", "en-US,en;q=0.9"),
        ("Accept-Encoding", "gzip, deflate"),
    ]
    .into_iter()
    .map(|(name, value)| (name.to_string(), value.to_string()))
    .collect()
}

impl WebGetConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json_str(&contents)?;
        log::debug!("loaded client configuration from {path:?}");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be at least 1".into()));
        }
        if self.head_attempts == 0 {
            return Err(ConfigError::Invalid("head_attempts must be at least 1".into()));
        }
        if self.step_through.max_steps == 0 {
            return Err(ConfigError::Invalid("step_through.max_steps must be at least 1".into()));
        }
        if self.use_socks && url::Url::parse(&self.socks_proxy).is_err() {
            return Err(ConfigError::Invalid(format!(
                "socks_proxy `{}` is not a url",
                self.socks_proxy
            )));
        }
        Ok(())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_timeout_secs)
    }

    pub fn header_list(&self) -> Vec<(String, String)> {
        self.default_headers
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    /// WAF expected in front of `host`, if it is listed as pre-emptive.
    pub fn preemptive_kind(&self, host: &str) -> Option<ChallengeKind> {
        self.preemptive_waf_hosts.get(&host.to_ascii_lowercase()).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let config = WebGetConfig::default();
        assert_eq!(config.max_attempts, 1);
        assert_eq!(config.retry_delay(), Duration::from_millis(10));
        assert_eq!(config.step_through.max_steps, 20);
        assert_eq!(config.step_through.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.head_attempts, 4);
        assert!(config.auto_waf);
        assert!(config.cookie_file.is_none());
        assert_eq!(config.socks_proxy, DEFAULT_SOCKS_PROXY);
    }

    #[test]
    fn loads_partial_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "max_attempts": 3,
                "auto_waf": false,
                "preemptive_waf_hosts": {{"www.example.org": "sucuri"}},
                "credentials": [{{"url_prefix": "https://intra.example/", "username": "u", "password": "p"}}],
                "step_through": {{"max_steps": 5}}
            }}"#
        )
        .unwrap();

        let config = WebGetConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.max_attempts, 3);
        assert!(!config.auto_waf);
        assert_eq!(config.preemptive_kind("WWW.EXAMPLE.ORG"), Some(ChallengeKind::Sucuri));
        assert_eq!(config.credentials[0].username, "u");
        assert_eq!(config.step_through.max_steps, 5);
        assert_eq!(config.step_through.poll_interval_ms, 1000);
        assert_eq!(config.request_timeout_secs, 30);
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(matches!(
            WebGetConfig::from_json_str(r#"{"max_attempts": 0}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            WebGetConfig::from_json_str("{not json"),
            Err(ConfigError::Json(_))
        ));
        assert!(matches!(
            WebGetConfig::from_json_file("/definitely/not/here.json"),
            Err(ConfigError::Io { .. })
        ));
    }
}

//! Fetch results.

use http::HeaderMap;
use http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use url::Url;

use super::error::{FetchError, FetchResultT};
use crate::challenges::detectors::ChallengeDetection;
use crate::transport::{CompressionKind, PageContent};

/// A successfully fetched and decoded page.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub content: PageContent,
    /// URL after redirects.
    pub url: Url,
    pub requested_url: Url,
    pub headers: HeaderMap,
    pub status: u16,
    pub compression: CompressionKind,
}

impl FetchResult {
    pub fn text(&self) -> Option<&str> {
        self.content.as_text()
    }

    pub fn bytes(&self) -> &[u8] {
        self.content.as_bytes()
    }

    pub fn is_redirected(&self) -> bool {
        self.url != self.requested_url
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE).and_then(|value| value.to_str().ok())
    }

    /// Content type without parameters. Some servers URL-encode the slash,
    /// which is repaired here.
    pub fn mime_type(&self) -> Option<String> {
        let content_type = self.content_type()?;
        let mime = content_type.split(';').next().unwrap_or_default().trim();
        Some(mime.replace("%2F", "/"))
    }

    /// File name from `Content-Disposition: ...filename=`, else the last
    /// segment of the final URL path.
    pub fn file_name(&self) -> String {
        let from_header = self
            .headers
            .get(CONTENT_DISPOSITION)
            .and_then(|value| value.to_str().ok())
            .and_then(disposition_file_name)
            .filter(|name| !name.trim().is_empty());

        let name = from_header.unwrap_or_else(|| {
            self.url
                .path()
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .trim()
                .to_string()
        });

        match name.rsplit_once('/') {
            Some((_, tail)) => tail.to_string(),
            None => name,
        }
    }
}

fn disposition_file_name(disposition: &str) -> Option<String> {
    let (_, name) = disposition.split_once("filename=")?;
    let quoted = name.len() >= 2
        && ((name.starts_with('"') && name.ends_with('"'))
            || (name.starts_with('\'') && name.ends_with('\'')));
    if quoted {
        Some(name[1..name.len() - 1].to_string())
    } else {
        Some(name.to_string())
    }
}

/// What a single fetch produced: a page, or a recognised WAF interstitial.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Page(FetchResult),
    Challenge(ChallengeDetection),
}

impl FetchOutcome {
    pub fn is_challenge(&self) -> bool {
        matches!(self, FetchOutcome::Challenge(_))
    }

    /// The page, or [`FetchError::ChallengeDetected`] for a challenge.
    pub fn into_page(self) -> FetchResultT<FetchResult> {
        match self {
            FetchOutcome::Page(page) => Ok(page),
            FetchOutcome::Challenge(detection) => Err(FetchError::ChallengeDetected {
                kind: detection.kind,
                url: detection.url,
            }),
        }
    }
}

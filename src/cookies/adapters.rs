//! Conversions from foreign cookie shapes into [`CookieEntry`].

use cookie::Cookie;
use serde::Deserialize;
use url::Url;

use super::{CookieEntry, CookieError, clamp_expiry};

impl CookieEntry {
    /// Build an entry from a `Set-Cookie` header received for `url`.
    pub fn from_set_cookie(header: &str, url: &Url) -> Result<Self, CookieError> {
        let parsed = Cookie::parse(header).map_err(|err| CookieError::SetCookie(err.to_string()))?;

        let host = url.host_str().ok_or(CookieError::MissingDomain)?.to_ascii_lowercase();
        let (domain, domain_specified) = match parsed.domain() {
            Some(domain) if !domain.is_empty() => {
                let bare = domain.trim_start_matches('.').to_ascii_lowercase();
                if host != bare && !host.ends_with(&format!(".{bare}")) {
                    return Err(CookieError::DomainMismatch { domain: bare, host });
                }
                (format!(".{bare}"), true)
            }
            _ => (host, false),
        };

        let path = parsed
            .path()
            .filter(|path| path.starts_with('/'))
            .map(str::to_string)
            .unwrap_or_else(|| default_path(url));

        let expires = match parsed.max_age() {
            Some(max_age) => Some(clamp_expiry(
                chrono::Utc::now().timestamp().saturating_add(max_age.whole_seconds()),
            )),
            None => parsed
                .expires()
                .and_then(|expiration| expiration.datetime())
                .map(|datetime| datetime.unix_timestamp()),
        };

        let mut entry = CookieEntry::new(parsed.name(), parsed.value(), domain)
            .with_path(path)
            .with_secure(parsed.secure().unwrap_or(false))
            .with_http_only(parsed.http_only().unwrap_or(false))
            .with_expires(expires);
        entry.domain_specified = domain_specified;
        Ok(entry)
    }

    /// Build an entry from a cookie exported by a browser backend.
    pub fn from_browser(cookie: &BrowserCookie) -> Self {
        let expires = cookie
            .expires
            .filter(|expires| *expires >= 0.0)
            .map(|expires| expires as i64);
        let mut entry = CookieEntry::new(&cookie.name, &cookie.value, &cookie.domain)
            .with_path(cookie.path.clone().unwrap_or_else(|| "/".into()))
            .with_secure(cookie.secure)
            .with_http_only(cookie.http_only)
            .with_expires(expires);
        entry.domain_specified = entry.domain.starts_with('.');
        entry
    }
}

/// Cookie as exported by browser automation (DevTools / WebDriver shape).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub secure: bool,
    #[serde(default, alias = "httponly")]
    pub http_only: bool,
    /// Unix seconds; negative or absent for session cookies.
    #[serde(default, alias = "expiry")]
    pub expires: Option<f64>,
}

impl BrowserCookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: domain.into(),
            path: Some("/".into()),
            secure: false,
            http_only: false,
            expires: None,
        }
    }
}

impl From<&CookieEntry> for BrowserCookie {
    fn from(entry: &CookieEntry) -> Self {
        Self {
            name: entry.name.clone(),
            value: entry.value.clone(),
            domain: entry.domain.clone(),
            path: Some(entry.path.clone()),
            secure: entry.secure,
            http_only: entry.http_only,
            expires: entry.expires.map(|expires| expires as f64),
        }
    }
}

fn default_path(url: &Url) -> String {
    let path = url.path();
    match path.rfind('/') {
        Some(0) | None => "/".into(),
        Some(index) => path[..index].to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cookies::MAX_COOKIE_EXPIRY;

    #[test]
    fn set_cookie_with_domain_attribute() {
        let url = Url::parse("https://www.example.com/a/b").unwrap();
        let entry = CookieEntry::from_set_cookie(
            "cf_clearance=xyz; Domain=example.com; Path=/; Secure; HttpOnly; Expires=Wed, 01 Jan 2031 00:00:00 GMT",
            &url,
        )
        .unwrap();
        assert_eq!(entry.domain, ".example.com");
        assert!(entry.domain_specified);
        assert!(entry.secure && entry.http_only);
        assert_eq!(entry.expires, Some(1_924_992_000));
    }

    #[test]
    fn set_cookie_defaults_to_request_host_and_directory() {
        let url = Url::parse("http://example.com/dir/page.html").unwrap();
        let entry = CookieEntry::from_set_cookie("sid=1", &url).unwrap();
        assert_eq!(entry.domain, "example.com");
        assert!(!entry.domain_specified);
        assert_eq!(entry.path, "/dir");
        assert!(entry.is_session());
    }

    #[test]
    fn huge_max_age_is_clamped() {
        let url = Url::parse("https://example.com/").unwrap();
        let entry = CookieEntry::from_set_cookie("cf_clearance=x; Max-Age=99999999999999999999", &url).unwrap();
        assert_eq!(entry.expires, Some(MAX_COOKIE_EXPIRY));
    }

    #[test]
    fn foreign_domain_attribute_is_rejected() {
        let url = Url::parse("http://evil.test/").unwrap();
        assert!(matches!(
            CookieEntry::from_set_cookie("sid=attacker; Domain=victim.test", &url),
            Err(CookieError::DomainMismatch { .. })
        ));
        assert!(CookieEntry::from_set_cookie("sid=1; Domain=test", &url).is_ok());

        let sub = Url::parse("http://www.victim.test/").unwrap();
        let entry = CookieEntry::from_set_cookie("sid=1; Domain=Victim.test", &sub).unwrap();
        assert_eq!(entry.domain, ".victim.test");
    }

    #[test]
    fn browser_host_only_cookie_stays_host_only() {
        let host_only = CookieEntry::from_browser(&BrowserCookie::new("a", "b", "example.com"));
        assert!(!host_only.domain_specified);
        let domain = CookieEntry::from_browser(&BrowserCookie::new("a", "b", ".example.com"));
        assert!(domain.domain_specified);
    }

    #[test]
    fn browser_cookie_json_is_accepted() {
        let raw = r#"{"name":"sucuri_cloudproxy_uuid_1","value":"v","domain":"example.com","path":"/","secure":false,"httpOnly":true,"expires":99999999999.5}"#;
        let cookie: BrowserCookie = serde_json::from_str(raw).unwrap();
        let entry = CookieEntry::from_browser(&cookie);
        assert!(entry.http_only);
        assert_eq!(entry.expires, Some(MAX_COOKIE_EXPIRY));

        let session = BrowserCookie {
            expires: Some(-1.0),
            ..BrowserCookie::new("a", "b", "example.com")
        };
        assert!(CookieEntry::from_browser(&session).is_session());
    }
}

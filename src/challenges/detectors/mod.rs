//! Challenge detection module.
//!
//! Scans decompressed (but not yet text-decoded) bodies for byte signatures
//! of known WAF interstitial pages. Detection is a pure function of the body.

use std::fmt;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// WAF products whose interstitials the detector recognises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeKind {
    Cloudflare,
    Sucuri,
}

impl ChallengeKind {
    pub fn name(&self) -> &'static str {
        match self {
            ChallengeKind::Cloudflare => "cloudflare",
            ChallengeKind::Sucuri => "sucuri",
        }
    }

    /// Cookie-name prefix a successful solve leaves in the jar.
    pub fn clearance_cookie_prefix(&self) -> &'static str {
        match self {
            ChallengeKind::Cloudflare => "cf_clearance",
            ChallengeKind::Sucuri => "sucuri_cloudproxy_uuid_",
        }
    }
}

impl fmt::Display for ChallengeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Byte sequence identifying one challenge page variant.
#[derive(Debug, Clone)]
pub struct ChallengeSignature {
    pub id: &'static str,
    pub kind: ChallengeKind,
    pub needle: &'static [u8],
}

impl ChallengeSignature {
    const fn new(id: &'static str, kind: ChallengeKind, needle: &'static [u8]) -> Self {
        Self { id, kind, needle }
    }

    fn matches(&self, body: &[u8]) -> bool {
        !self.needle.is_empty()
            && body
                .windows(self.needle.len())
                .any(|window| window == self.needle)
    }
}

/// Static list of known challenge signatures, checked in order.
static KNOWN_SIGNATURES: Lazy<Vec<ChallengeSignature>> = Lazy::new(|| {
    vec![
        ChallengeSignature::new(
            "sucuri_cloudproxy_js",
            ChallengeKind::Sucuri,
            b"sucuri_cloudproxy_js=",
        ),
        ChallengeSignature::new(
            "cf_automatic_redirect",
            ChallengeKind::Cloudflare,
            b"This process is automatic. Your browser will redirect to your requested content shortly.",
        ),
        ChallengeSignature::new(
            "cf_always_online",
            ChallengeKind::Cloudflare,
            b"is currently offline. However, because the site uses Cloudflare's Always Online",
        ),
    ]
});

/// Detection output returned to the fetch engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeDetection {
    pub kind: ChallengeKind,
    pub signature_id: &'static str,
    pub url: String,
}

/// Signature scanner over decompressed response bodies.
#[derive(Debug, Clone, Default)]
pub struct ChallengeDetector;

impl ChallengeDetector {
    pub fn new() -> Self {
        Self
    }

    /// All signatures the detector knows about.
    pub fn signatures(&self) -> &'static [ChallengeSignature] {
        KNOWN_SIGNATURES.as_slice()
    }

    /// Return the first signature found in `body`, if any.
    pub fn scan(&self, body: &[u8], url: &str) -> Option<ChallengeDetection> {
        let signature = KNOWN_SIGNATURES.iter().find(|signature| signature.matches(body))?;
        log::debug!("{} challenge signature `{}` on {url}", signature.kind, signature.id);
        Some(ChallengeDetection {
            kind: signature.kind,
            signature_id: signature.id,
            url: url.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "https://example.com/";

    #[test]
    fn detects_sucuri() {
        let body = b"<html><script>S='c3VjdXJp';sucuri_cloudproxy_js='';</script></html>";
        let detection = ChallengeDetector::new().scan(body, URL).expect("should detect");
        assert_eq!(detection.kind, ChallengeKind::Sucuri);
        assert_eq!(detection.signature_id, "sucuri_cloudproxy_js");
    }

    #[test]
    fn detects_cloudflare_variants() {
        let detector = ChallengeDetector::new();
        let iuam = b"<p>This process is automatic. Your browser will redirect to your requested content shortly.</p>";
        let offline = b"example.com is currently offline. However, because the site uses Cloudflare's Always Online";
        assert_eq!(detector.scan(iuam, URL).unwrap().kind, ChallengeKind::Cloudflare);
        assert_eq!(
            detector.scan(offline, URL).unwrap().signature_id,
            "cf_always_online"
        );
    }

    #[test]
    fn ignores_ordinary_pages() {
        let detector = ChallengeDetector::new();
        assert!(detector.scan(b"<html><title>Just a page</title></html>", URL).is_none());
        assert!(detector.scan(b"", URL).is_none());
    }

    #[test]
    fn signatures_are_case_sensitive_bytes() {
        let body = b"SUCURI_CLOUDPROXY_JS=";
        assert!(ChallengeDetector::new().scan(body, URL).is_none());
    }
}

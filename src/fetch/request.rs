//! Per-call request options.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use http::Method;
use url::Url;

use super::error::{FetchError, FetchResultT};

/// Progress hook invoked after every received chunk with
/// `(bytes_so_far, total)`; `total` comes from `Content-Length`.
pub type ProgressCallback = Arc<dyn Fn(u64, Option<u64>) + Send + Sync>;

/// Request payload.
#[derive(Debug, Clone)]
pub enum RequestBody {
    Raw(Bytes),
    Text(String),
    /// `application/x-www-form-urlencoded` pairs, in order.
    Form(Vec<(String, String)>),
    /// `multipart/form-data`; used for binary uploads.
    Multipart(MultipartForm),
}

/// One part of a multipart body.
#[derive(Debug, Clone)]
pub struct MultipartPart {
    pub name: String,
    pub file_name: Option<String>,
    pub mime: Option<String>,
    pub data: Bytes,
}

/// Multipart body description.
///
/// Kept as plain data so that every retry can build a fresh
/// [`reqwest::multipart::Form`].
#[derive(Debug, Clone, Default)]
pub struct MultipartForm {
    parts: Vec<MultipartPart>,
}

impl MultipartForm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let value: String = value.into();
        self.parts.push(MultipartPart {
            name: name.into(),
            file_name: None,
            mime: None,
            data: Bytes::from(value),
        });
        self
    }

    pub fn file(
        mut self,
        name: impl Into<String>,
        file_name: impl Into<String>,
        mime: Option<&str>,
        data: impl Into<Bytes>,
    ) -> Self {
        self.parts.push(MultipartPart {
            name: name.into(),
            file_name: Some(file_name.into()),
            mime: mime.map(str::to_string),
            data: data.into(),
        });
        self
    }

    pub fn parts(&self) -> &[MultipartPart] {
        &self.parts
    }

    pub(crate) fn to_form(&self) -> FetchResultT<reqwest::multipart::Form> {
        let mut form = reqwest::multipart::Form::new();
        for part in &self.parts {
            let mut rendered = reqwest::multipart::Part::bytes(part.data.to_vec());
            if let Some(file_name) = &part.file_name {
                rendered = rendered.file_name(file_name.clone());
            }
            if let Some(mime) = &part.mime {
                rendered = rendered
                    .mime_str(mime)
                    .map_err(|_| FetchError::Argument(format!("invalid mime type `{mime}`")))?;
            }
            form = form.part(part.name.clone(), rendered);
        }
        Ok(form)
    }
}

/// Options controlling one `fetch` call.
#[derive(Clone, Default)]
pub struct FetchOptions {
    pub(crate) method: Option<Method>,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) body: Option<RequestBody>,
    pub(crate) forbid_redirects: bool,
    pub(crate) native_error: bool,
    pub(crate) max_attempts: Option<u32>,
    pub(crate) progress: Option<ProgressCallback>,
}

impl fmt::Debug for FetchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchOptions")
            .field("method", &self.method)
            .field("headers", &self.headers)
            .field("body", &self.body)
            .field("forbid_redirects", &self.forbid_redirects)
            .field("native_error", &self.native_error)
            .field("max_attempts", &self.max_attempts)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

impl FetchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    /// Additional header for this call. Overrides a default header of the
    /// same name.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: RequestBody) -> Self {
        self.body = Some(body);
        self
    }

    pub fn raw_body(self, body: impl Into<Bytes>) -> Self {
        self.body(RequestBody::Raw(body.into()))
    }

    pub fn text_body(self, body: impl Into<String>) -> Self {
        self.body(RequestBody::Text(body.into()))
    }

    pub fn form<I, K, V>(self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let pairs = pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        self.body(RequestBody::Form(pairs))
    }

    pub fn multipart(self, form: MultipartForm) -> Self {
        self.body(RequestBody::Multipart(form))
    }

    /// Fail with [`FetchError::Redirected`] when the final URL differs from
    /// the requested one.
    pub fn forbid_redirects(mut self) -> Self {
        self.forbid_redirects = true;
        self
    }

    /// Surface the last transport error itself instead of a
    /// [`FetchError::FetchFailure`] once attempts are exhausted.
    pub fn native_error(mut self) -> Self {
        self.native_error = true;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts.max(1));
        self
    }

    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(u64, Option<u64>) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(callback));
        self
    }

    /// Method actually sent: explicit, else `POST` with a body, else `GET`.
    pub fn resolved_method(&self) -> Method {
        match (&self.method, &self.body) {
            (Some(method), _) => method.clone(),
            (None, Some(_)) => Method::POST,
            (None, None) => Method::GET,
        }
    }

    pub fn is_strict(&self) -> bool {
        self.forbid_redirects
    }
}

/// Parse a possibly non-ASCII URL into its URI form (IDNA host,
/// percent-encoded path and query).
pub fn normalize_iri(input: &str) -> FetchResultT<Url> {
    let trimmed = input.trim();
    Url::parse(trimmed).map_err(|source| FetchError::InvalidUrl {
        url: trimmed.to_string(),
        source,
    })
}

/// `Referer` values go through the same IRI normalisation as request URLs;
/// anything else is sent unchanged.
pub(crate) fn normalize_header_value(name: &str, value: &str) -> String {
    if name.eq_ignore_ascii_case("referer")
        && let Ok(url) = Url::parse(value.trim())
    {
        return url.to_string();
    }
    value.to_string()
}

//! Request building, the retry loop and result types.

pub mod engine;
pub mod error;
pub mod request;
pub mod response;
pub mod retry;

pub use engine::{EngineSettings, FetchEngine, log_progress};
pub use error::{FetchError, FetchResultT};
pub use request::{FetchOptions, MultipartForm, MultipartPart, ProgressCallback, RequestBody, normalize_iri};
pub use response::{FetchOutcome, FetchResult};
pub use retry::{LastError, RetryState};

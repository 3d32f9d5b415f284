//! End-to-end fetch behaviour against local mock servers.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use webget_rs::{
    ChallengeKind, ChallengeSolver, CookieEntry, EventHandler, FetchError, FetchEvent, FetchOptions,
    SolveOutcome, SolveRequest, SolverError, WebGet,
};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const CLOUDFLARE_PAGE: &str = "<html><head><title>Just a moment...</title></head><body>\
    This process is automatic. Your browser will redirect to your requested content shortly.\
    </body></html>";

/// Solver that hands out a clearance cookie for whatever host it is sent to.
struct ClearanceSolver {
    calls: AtomicUsize,
    success: bool,
}

impl ClearanceSolver {
    fn new(success: bool) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            success,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChallengeSolver for ClearanceSolver {
    fn name(&self) -> &'static str {
        "clearance"
    }

    async fn solve(&self, request: SolveRequest) -> Result<SolveOutcome, SolverError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let host = request.url.host_str().unwrap_or_default().to_string();
        let expires = chrono::Utc::now().timestamp() + 3600;
        Ok(SolveOutcome {
            success: self.success,
            cookies: vec![CookieEntry::new("cf_clearance", "granted", host).with_expires(Some(expires))],
            title: Some("Example Domain".into()),
        })
    }
}

/// Counts request attempts and scheduled retries.
#[derive(Default)]
struct AttemptCounter {
    attempts: AtomicUsize,
    retries: AtomicUsize,
}

impl EventHandler for AttemptCounter {
    fn handle(&self, event: &FetchEvent) {
        match event {
            FetchEvent::PreRequest(_) => {
                self.attempts.fetch_add(1, Ordering::SeqCst);
            }
            FetchEvent::Retry(_) => {
                self.retries.fetch_add(1, Ordering::SeqCst);
            }
            _ => {}
        }
    }
}

/// Address of a local port nothing is listening on.
fn closed_port_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("http://127.0.0.1:{port}/unreachable")
}

fn html(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/html; charset=utf-8")
        .set_body_string(body)
}

async fn request_count(server: &MockServer) -> usize {
    server.received_requests().await.map(|requests| requests.len()).unwrap_or_default()
}

#[tokio::test]
async fn retries_until_the_server_recovers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(html("<p>finally</p>"))
        .mount(&server)
        .await;

    let web = WebGet::builder()
        .max_attempts(3)
        .retry_delay(Duration::from_millis(1))
        .build()
        .unwrap();
    let page = web.get_page(&format!("{}/flaky", server.uri())).await.unwrap();

    assert_eq!(page.as_text(), Some("<p>finally</p>"));
    assert_eq!(request_count(&server).await, 3);
}

#[tokio::test]
async fn exhausted_attempts_report_the_last_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500).set_body_string("broken"))
        .mount(&server)
        .await;

    let web = WebGet::builder()
        .max_attempts(2)
        .retry_delay(Duration::from_millis(1))
        .build()
        .unwrap();
    let err = web.get_page(&server.uri()).await.unwrap_err();

    assert!(matches!(err, FetchError::FetchFailure { code: Some(500), .. }));
    assert_eq!(request_count(&server).await, 2);
}

#[tokio::test]
async fn not_found_is_never_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404).set_body_string("nope"))
        .expect(1)
        .mount(&server)
        .await;

    let web = WebGet::builder().max_attempts(5).build().unwrap();
    let err = web.get_page(&format!("{}/missing", server.uri())).await.unwrap_err();

    assert_eq!(err.status_code(), Some(404));
    assert_eq!(request_count(&server).await, 1);
}

#[tokio::test]
async fn native_error_mode_surfaces_the_transport_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let web = WebGet::new().unwrap();
    let err = web
        .fetch(&server.uri(), FetchOptions::new().native_error())
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::Transport(_)));
}

#[tokio::test]
async fn challenge_is_solved_and_the_request_replayed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/protected"))
        .and(header("cookie", "cf_clearance=granted"))
        .respond_with(html("<h1>Welcome</h1>"))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/protected"))
        .respond_with(ResponseTemplate::new(503).set_body_string(CLOUDFLARE_PAGE))
        .with_priority(2)
        .mount(&server)
        .await;

    let solver = ClearanceSolver::new(true);
    let web = WebGet::builder()
        .with_solver(ChallengeKind::Cloudflare, solver.clone())
        .build()
        .unwrap();
    let soup = web.get_soup(&format!("{}/protected", server.uri())).await.unwrap();

    let h1 = scraper::Selector::parse("h1").unwrap();
    let heading: String = soup.select(&h1).flat_map(|el| el.text()).collect();
    assert_eq!(heading, "Welcome");
    assert_eq!(solver.calls(), 1);
    assert_eq!(request_count(&server).await, 2);
}

#[tokio::test]
async fn a_second_challenge_after_solving_is_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503).set_body_string(CLOUDFLARE_PAGE))
        .mount(&server)
        .await;

    let solver = ClearanceSolver::new(true);
    let web = WebGet::builder()
        .with_solver(ChallengeKind::Cloudflare, solver.clone())
        .build()
        .unwrap();
    let err = web.get_page(&server.uri()).await.unwrap_err();

    assert!(matches!(err, FetchError::FetchFailure { .. }));
    assert_eq!(solver.calls(), 1);
    assert_eq!(request_count(&server).await, 2);
}

#[tokio::test]
async fn failed_step_through_is_reported_without_replay() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(html(CLOUDFLARE_PAGE))
        .mount(&server)
        .await;

    let solver = ClearanceSolver::new(false);
    let web = WebGet::builder()
        .with_solver(ChallengeKind::Cloudflare, solver.clone())
        .build()
        .unwrap();
    let err = web.get_page(&server.uri()).await.unwrap_err();

    assert!(matches!(err, FetchError::FetchFailure { ref message, .. } if message.contains("Could not step through")));
    assert_eq!(request_count(&server).await, 1);
    assert!(web.cookie_jar().has_cookie_prefix("127.0.0.1", "cf_clearance"));
}

#[tokio::test]
async fn disabled_auto_waf_surfaces_the_challenge() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503).set_body_string(CLOUDFLARE_PAGE))
        .mount(&server)
        .await;

    let solver = ClearanceSolver::new(true);
    let web = WebGet::builder()
        .auto_waf(false)
        .with_solver(ChallengeKind::Cloudflare, solver.clone())
        .build()
        .unwrap();
    let err = web.get_page(&server.uri()).await.unwrap_err();

    assert!(matches!(err, FetchError::ChallengeDetected { kind: ChallengeKind::Cloudflare, .. }));
    assert_eq!(solver.calls(), 0);
}

#[tokio::test]
async fn solver_cookies_are_persisted_to_the_cookie_file() {
    let dir = tempfile::tempdir().unwrap();
    let cookie_file = dir.path().join("cookies.lwp");

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header("cookie", "cf_clearance=granted"))
        .respond_with(html("ok"))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503).set_body_string(CLOUDFLARE_PAGE))
        .with_priority(2)
        .mount(&server)
        .await;

    let web = WebGet::builder()
        .cookie_file(&cookie_file)
        .with_solver(ChallengeKind::Cloudflare, ClearanceSolver::new(true))
        .build()
        .unwrap();
    web.get_page(&server.uri()).await.unwrap();

    let saved = std::fs::read_to_string(&cookie_file).unwrap();
    assert!(saved.starts_with("#LWP-Cookies-2.0"));
    assert!(saved.contains("cf_clearance=granted"));

    let reloaded = WebGet::builder().cookie_file(&cookie_file).build().unwrap();
    assert!(reloaded.cookie_jar().has_cookie_prefix("127.0.0.1", "cf_clearance"));
}

#[tokio::test]
async fn strict_mode_rejects_redirects() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/old"))
        .respond_with(ResponseTemplate::new(302).insert_header("location", "/new"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/new"))
        .respond_with(html("<p>moved</p>"))
        .mount(&server)
        .await;

    let web = WebGet::new().unwrap();
    let old = format!("{}/old", server.uri());

    let followed = web.fetch(&old, FetchOptions::new()).await.unwrap();
    assert!(followed.is_redirected());
    assert_eq!(followed.url.path(), "/new");

    let err = web.get_soup_no_redirects(&old).await.unwrap_err();
    assert!(matches!(err, FetchError::Redirected { ref actual, .. } if actual.ends_with("/new")));
}

#[tokio::test]
async fn json_and_binary_helpers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/json")
                .set_body_string(r#"{"status": 1, "request": "ok"}"#),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/download"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application%2Fpdf; qs=0.001")
                .insert_header("content-disposition", "attachment; filename=\"report.pdf\"")
                .set_body_bytes(vec![0x25, 0x50, 0x44, 0x46, 0xff]),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/files/archive.bin"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/octet-stream")
                .set_body_bytes(vec![1, 2, 3]),
        )
        .mount(&server)
        .await;

    let web = WebGet::new().unwrap();

    let json = web.get_json(&format!("{}/api", server.uri())).await.unwrap();
    assert_eq!(json["request"], "ok");

    let (content, name, mime) = web
        .get_file_name_mime(&format!("{}/download", server.uri()))
        .await
        .unwrap();
    assert_eq!(content, vec![0x25, 0x50, 0x44, 0x46, 0xff]);
    assert_eq!(name, "report.pdf");
    assert_eq!(mime.as_deref(), Some("application/pdf"));

    let (content, name) = web
        .get_file_and_name(&format!("{}/files/archive.bin", server.uri()))
        .await
        .unwrap();
    assert_eq!(content, vec![1, 2, 3]);
    assert_eq!(name, "archive.bin");

    let err = web
        .get_soup(&format!("{}/files/archive.bin", server.uri()))
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::ContentType(_)));
}

#[tokio::test]
async fn invalid_json_is_fetched_once_more() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/json")
                .set_body_string("{truncated"),
        )
        .mount(&server)
        .await;

    let web = WebGet::new().unwrap();
    let err = web.get_json(&server.uri()).await.unwrap_err();

    assert!(matches!(err, FetchError::Json(_)));
    assert_eq!(request_count(&server).await, 2);
}

#[tokio::test]
async fn head_returns_the_final_url() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/short"))
        .respond_with(ResponseTemplate::new(301).insert_header("location", "/long/target"))
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .and(path("/long/target"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let web = WebGet::new().unwrap();
    let url = web.get_head(&format!("{}/short", server.uri())).await.unwrap();
    assert_eq!(url.path(), "/long/target");
}

#[tokio::test]
async fn form_posts_carry_default_headers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/submit"))
        .and(header("x-client", "webget"))
        .and(header("content-type", "application/x-www-form-urlencoded"))
        .respond_with(html("thanks"))
        .expect(1)
        .mount(&server)
        .await;

    let web = WebGet::builder().default_header("X-Client", "webget").build().unwrap();
    let result = web
        .fetch(
            &format!("{}/submit", server.uri()),
            FetchOptions::new().form([("name", "value")]),
        )
        .await
        .unwrap();
    assert_eq!(result.text(), Some("thanks"));
}

#[tokio::test]
async fn connection_refused_is_retried_then_reported() {
    let url = closed_port_url();
    let counter = Arc::new(AttemptCounter::default());
    let delay = Duration::from_millis(150);
    let web = WebGet::builder()
        .max_attempts(2)
        .retry_delay(delay)
        .with_event_handler(counter.clone())
        .build()
        .unwrap();

    let started = Instant::now();
    let err = web.get_page(&url).await.unwrap_err();
    assert!(started.elapsed() >= delay);
    assert_eq!(counter.attempts.load(Ordering::SeqCst), 2);
    assert_eq!(counter.retries.load(Ordering::SeqCst), 1);
    match err {
        FetchError::FetchFailure { code, url: failed, content, reason, .. } => {
            assert_eq!(code, None);
            assert_eq!(failed, url);
            assert!(content.is_none());
            assert!(reason.is_some());
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let err = web.fetch(&url, FetchOptions::new().native_error()).await.unwrap_err();
    assert_eq!(counter.attempts.load(Ordering::SeqCst), 4);
    match err {
        FetchError::Transport(native) => assert!(native.is_connect()),
        other => panic!("unexpected error: {other:?}"),
    }
}

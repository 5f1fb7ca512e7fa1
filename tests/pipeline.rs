//! End-to-end pipeline behavior against a local HTTP server.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Html;
use axum::routing::get;
use axum::Router;

use aiaaic_harvest::{
    AcquisitionScheduler, FetchExecutor, HarvestControls, Incident, RecordStore, RetryPolicy,
    RunMode,
};

const PAGE_HTML: &str = r#"
<html>
  <head><meta property="og:description" content="Meta summary for fallback."></head>
  <body>
    <div role="main">
      <h1>Acme chatbot gave harmful advice</h1>
      <p>Occurred: June 2023</p>
      <p>Page published: 14 July 2023</p>
      <h2>What happened</h2>
      <p>Paragraph A: the deployed chatbot produced harmful advice to vulnerable users over several weeks before the operator intervened.</p>
      <h2>Why it happened</h2>
      <p>Paragraph B: the training data carried unvetted forum content and the guardrail layer was disabled during an infrastructure migration.</p>
      <a href="https://news.example.com/2023/acme-chatbot">Regulator opens probe into Acme chatbot</a>
      <li>https://journal.example.org/analysis/acme</li>
      <h2>Related</h2>
      <a href="https://www.aiaaic.org/aiaaic-repository/ai-algorithmic-and-automation-incidents/other-bot">Other bot offered dangerous guidance</a>
    </div>
  </body>
</html>
"#;

struct ServerState {
    hits: AtomicUsize,
    rate_limit_first: usize,
    server_error_first: usize,
    always_fail: AtomicBool,
    concurrent: AtomicUsize,
    peak_concurrent: AtomicUsize,
    response_delay: Duration,
}

impl ServerState {
    fn new() -> Self {
        Self {
            hits: AtomicUsize::new(0),
            rate_limit_first: 0,
            server_error_first: 0,
            always_fail: AtomicBool::new(false),
            concurrent: AtomicUsize::new(0),
            peak_concurrent: AtomicUsize::new(0),
            response_delay: Duration::ZERO,
        }
    }
}

async fn page_handler(State(state): State<Arc<ServerState>>) -> (StatusCode, Html<String>) {
    let now = state.concurrent.fetch_add(1, Ordering::AcqRel) + 1;
    state.peak_concurrent.fetch_max(now, Ordering::AcqRel);
    if !state.response_delay.is_zero() {
        tokio::time::sleep(state.response_delay).await;
    }
    let hit = state.hits.fetch_add(1, Ordering::AcqRel);
    state.concurrent.fetch_sub(1, Ordering::AcqRel);

    if state.always_fail.load(Ordering::Acquire) {
        return (StatusCode::INTERNAL_SERVER_ERROR, Html(String::new()));
    }
    if hit < state.rate_limit_first {
        return (StatusCode::TOO_MANY_REQUESTS, Html(String::new()));
    }
    if hit < state.server_error_first {
        return (StatusCode::SERVICE_UNAVAILABLE, Html(String::new()));
    }
    (StatusCode::OK, Html(PAGE_HTML.to_string()))
}

async fn start_server(state: Arc<ServerState>) -> String {
    let app = Router::new()
        .route("/incident/{slug}", get(page_handler))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test server");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("http://{addr}")
}

fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(max_attempts, Duration::from_millis(5), 2)
}

fn controls(dir: &Path, concurrency: usize, retries: u32) -> HarvestControls {
    HarvestControls::new(
        concurrency,
        Duration::from_secs(5),
        Duration::ZERO,
        fast_policy(retries),
        dir.to_path_buf(),
        "unused".to_string(),
        None,
        false,
    )
}

fn scheduler(store: Arc<RecordStore>, controls: HarvestControls) -> AcquisitionScheduler {
    let fetcher =
        FetchExecutor::new(controls.request_timeout(), controls.retry()).expect("build fetcher");
    AcquisitionScheduler::new(store, fetcher, controls)
}

fn roster_item(id: &str, base: &str) -> Incident {
    let mut incident = Incident::from_tabular(
        id.to_string(),
        format!("Headline for {id}"),
        "2023".to_string(),
    );
    incident.detail_page_url = Some(format!("{base}/incident/{}", id.to_lowercase()));
    incident
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn committed_record_carries_multi_section_description_and_references() {
    let dir = tempfile::tempdir().unwrap();
    let base = start_server(Arc::new(ServerState::new())).await;
    let store = Arc::new(RecordStore::open(dir.path()).unwrap());
    let sched = scheduler(Arc::clone(&store), controls(dir.path(), 4, 3));

    let summary = sched
        .run(vec![roster_item("AIAAIC0001", &base)], RunMode::Incremental)
        .await
        .unwrap();
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 0);

    let records = store.load_records().unwrap();
    assert_eq!(records.len(), 1);
    let record = &records[0];

    let description = record.description.as_deref().expect("description extracted");
    let pos_a = description.find("Paragraph A").expect("first section present");
    let pos_b = description.find("Paragraph B").expect("second section present");
    assert!(pos_a < pos_b);

    let urls: Vec<&str> = record.source_links.iter().map(|l| l.url.as_str()).collect();
    assert!(urls.contains(&"https://news.example.com/2023/acme-chatbot"));
    assert!(urls.contains(&"https://journal.example.org/analysis/acme"));

    assert_eq!(record.related_incidents.len(), 1);
    assert_eq!(record.occurred_on_page.as_deref(), Some("June 2023"));
    assert_eq!(record.page_published.as_deref(), Some("14 July 2023"));
    assert!(record.page_scraped);
    assert!(record.is_complete());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rate_limited_fetches_retry_to_success_without_failure_entries() {
    let dir = tempfile::tempdir().unwrap();
    let mut state = ServerState::new();
    state.rate_limit_first = 3;
    let base = start_server(Arc::new(state)).await;
    let store = Arc::new(RecordStore::open(dir.path()).unwrap());
    // Four attempts: three throttled, then success.
    let sched = scheduler(Arc::clone(&store), controls(dir.path(), 2, 4));

    let summary = sched
        .run(vec![roster_item("AIAAIC0002", &base)], RunMode::Incremental)
        .await
        .unwrap();

    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(store.record_count(), 1);
    assert!(store.load_failures().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transient_server_errors_retry_at_the_scheduler_level() {
    let dir = tempfile::tempdir().unwrap();
    let mut state = ServerState::new();
    state.server_error_first = 1;
    let base = start_server(Arc::new(state)).await;
    let store = Arc::new(RecordStore::open(dir.path()).unwrap());
    let sched = scheduler(Arc::clone(&store), controls(dir.path(), 2, 3));

    let summary = sched
        .run(vec![roster_item("AIAAIC0003", &base)], RunMode::Incremental)
        .await
        .unwrap();
    assert_eq!(summary.succeeded, 1);
    assert!(store.load_failures().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrency_never_exceeds_the_configured_limit() {
    let dir = tempfile::tempdir().unwrap();
    let mut state = ServerState::new();
    state.response_delay = Duration::from_millis(40);
    let state = Arc::new(state);
    let base = start_server(Arc::clone(&state)).await;
    let store = Arc::new(RecordStore::open(dir.path()).unwrap());

    let limit = 3;
    let sched = scheduler(Arc::clone(&store), controls(dir.path(), limit, 2));
    let roster: Vec<Incident> = (0..12)
        .map(|i| roster_item(&format!("AIAAIC01{i:02}"), &base))
        .collect();

    let summary = sched.run(roster, RunMode::Incremental).await.unwrap();
    assert_eq!(summary.succeeded, 12);
    assert!(summary.peak_in_flight <= limit);
    assert!(state.peak_concurrent.load(Ordering::Acquire) <= limit);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn incremental_reruns_are_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let base = start_server(Arc::new(ServerState::new())).await;
    let store = Arc::new(RecordStore::open(dir.path()).unwrap());
    let sched = scheduler(Arc::clone(&store), controls(dir.path(), 4, 3));

    let roster = || {
        vec![
            roster_item("AIAAIC0010", &base),
            roster_item("AIAAIC0011", &base),
        ]
    };

    let first = sched.run(roster(), RunMode::Incremental).await.unwrap();
    assert_eq!(first.succeeded, 2);
    let ids_after_first: Vec<String> = {
        let mut ids: Vec<String> = store
            .load_records()
            .unwrap()
            .into_iter()
            .map(|r| r.aiaaic_id)
            .collect();
        ids.sort();
        ids
    };

    let second = sched.run(roster(), RunMode::Incremental).await.unwrap();
    assert_eq!(second.total, 0);
    assert_eq!(second.skipped, 2);

    let mut ids_after_second: Vec<String> = store
        .load_records()
        .unwrap()
        .into_iter()
        .map(|r| r.aiaaic_id)
        .collect();
    ids_after_second.sort();
    assert_eq!(ids_after_first, ids_after_second);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_items_land_in_the_failure_log_and_retry_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let state = Arc::new(ServerState::new());
    state.always_fail.store(true, Ordering::Release);
    let base = start_server(Arc::clone(&state)).await;
    let store = Arc::new(RecordStore::open(dir.path()).unwrap());
    let sched = scheduler(Arc::clone(&store), controls(dir.path(), 2, 2));

    // First run: the remote is broken; the run completes and records the failure.
    let summary = sched
        .run(vec![roster_item("AIAAIC0020", &base)], RunMode::Incremental)
        .await
        .unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.succeeded, 0);
    let failures = store.load_failures().unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].kind, "server_error");

    // Remote recovers; retry-failed supersedes the failure entry.
    state.always_fail.store(false, Ordering::Release);
    let retry = sched
        .run(vec![roster_item("AIAAIC0020", &base)], RunMode::RetryFailed)
        .await
        .unwrap();
    assert_eq!(retry.succeeded, 1);
    assert!(store.load_failures().unwrap().is_empty());
    assert_eq!(store.record_count(), 1);
    assert!(store.is_complete("AIAAIC0020"));
}

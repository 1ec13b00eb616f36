use axum::{
    extract::Query,
    http::StatusCode,
    routing::get,
    Json, Router,
};
use dashboard_sync::{
    AnalyticsClient, ErrorKind, FetchError, FieldValue, Selection,
};
use once_cell::sync::Lazy;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::time::Duration;

/// Fake analytics API on its own runtime thread, shared by every test.
static API: Lazy<String> = Lazy::new(|| {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("build fake api runtime");
        runtime.block_on(async move {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
                .await
                .expect("bind fake api");
            tx.send(listener.local_addr().expect("local addr"))
                .expect("report fake api address");
            axum::serve(listener, router()).await.expect("serve fake api");
        });
    });
    let addr = rx.recv().expect("fake api did not start");
    format!("http://{addr}")
});

fn router() -> Router {
    Router::new()
        .route("/api/websites", get(websites))
        .route("/api/stats", get(stats))
        .route("/api/metadata", get(metadata))
        .route("/api/slow", get(slow))
        .route("/api/broken", get(broken))
}

async fn websites() -> Json<Value> {
    Json(json!([
        { "id": "site-1", "name": "one.example" },
        { "id": "site-2", "name": "two.example" }
    ]))
}

async fn stats(Query(params): Query<HashMap<String, String>>) -> Json<Value> {
    Json(json!({
        "website": params.get("website"),
        "period": params.get("period"),
        "pageviews": 42
    }))
}

async fn metadata(Query(params): Query<HashMap<String, String>>) -> Json<Value> {
    Json(json!({
        "website": params.get("website"),
        "paths": ["/", "/blog"]
    }))
}

async fn slow() -> Json<Value> {
    tokio::time::sleep(Duration::from_secs(5)).await;
    Json(json!({}))
}

async fn broken() -> (StatusCode, &'static str) {
    (StatusCode::INTERNAL_SERVER_ERROR, "boom")
}

fn client(timeout: Duration) -> AnalyticsClient {
    AnalyticsClient::new(&API, timeout).unwrap()
}

#[tokio::test]
async fn client_lists_websites() {
    let websites = client(Duration::from_secs(5)).websites().await.unwrap();
    let ids: Vec<&str> = websites.iter().map(|site| site.id.as_str()).collect();
    assert_eq!(ids, vec!["site-1", "site-2"]);
}

#[tokio::test]
async fn client_sends_selection_as_query_params() {
    let selection = Selection::new()
        .with("website", FieldValue::text("site-2"))
        .with("period", FieldValue::text("today"));

    let body: Value = client(Duration::from_secs(5))
        .query("api/stats", &selection)
        .await
        .unwrap();

    assert_eq!(body["website"], "site-2");
    assert_eq!(body["period"], "today");
    assert_eq!(body["pageviews"], 42);
}

#[tokio::test]
async fn slow_response_is_a_timeout() {
    let err = client(Duration::from_millis(200))
        .query::<Value>("api/slow", &Selection::new())
        .await
        .unwrap_err();
    assert_eq!(err, FetchError::Timeout(Duration::from_millis(200)));
}

#[tokio::test]
async fn server_error_is_a_network_failure() {
    let err = client(Duration::from_secs(5))
        .query::<Value>("api/broken", &Selection::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Network);
    assert!(err.to_string().contains("500"), "{err}");
}

fn run_session(cache_path: &Path, query: &str) -> Value {
    let output = Command::new(env!("CARGO_BIN_EXE_dashboard_sync"))
        .env("DASHBOARD_API_URL", API.as_str())
        .env("DASHBOARD_CACHE_PATH", cache_path)
        .env("DASHBOARD_QUERY", query)
        .env("DASHBOARD_TIMEOUT_MS", "3000")
        .env("RUST_LOG", "warn")
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .output()
        .expect("failed to run dashboard session");
    assert!(output.status.success(), "session exited with {}", output.status);
    serde_json::from_slice(&output.stdout).expect("session report is json")
}

#[test]
fn session_reports_url_selection_and_data() {
    let dir = tempfile::tempdir().unwrap();
    let cache_path = dir.path().join("cache.json");

    let report = run_session(&cache_path, "website=site-2&period=today&utm_source=mail");

    assert_eq!(report["url"], "website=site-2&period=today&utm_source=mail");
    assert_eq!(report["selection"]["website"], "site-2");
    assert_eq!(report["selection"]["period"], "today");
    assert_eq!(report["phase"], "ready");
    assert_eq!(report["stats"]["website"], "site-2");
    assert_eq!(report["stats"]["pageviews"], 42);
    assert_eq!(report["metadata"]["paths"][1], "/blog");
    assert!(report["error"].is_null());

    let cached = std::fs::read_to_string(&cache_path).unwrap();
    assert!(cached.contains("site-2"));
    assert!(cached.contains("storedAtEpochMs"));
}

#[test]
fn second_session_falls_back_to_cached_website() {
    let dir = tempfile::tempdir().unwrap();
    let cache_path = dir.path().join("nested").join("cache.json");

    run_session(&cache_path, "website=site-1");
    let report = run_session(&cache_path, "");

    assert_eq!(report["selection"]["website"], "site-1");
    assert_eq!(report["url"], "website=site-1");
    assert_eq!(report["stats"]["website"], "site-1");
}

#[test]
fn unknown_website_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let report = run_session(&dir.path().join("cache.json"), "website=nope");

    assert_eq!(report["selection"]["website"], "");
    assert!(report["stats"].is_null());
    let error = report["error"].as_str().unwrap();
    assert!(error.contains("nope"), "{error}");
}

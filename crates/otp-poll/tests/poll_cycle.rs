use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use otp_core::{CycleStage, Fingerprint};
use otp_poll::{CycleError, MapConfig, Poller, PollerConfig, PollStatsSnapshot, Scheduler};
use otp_query::Expression;
use otp_storage::{
    DedupStore, FetchError, FsObjectStore, HttpClientConfig, HttpFetcher, MemoryObjectStore,
    ObjectStore, StoreError, StoreOp,
};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const FEED: &str = "/api/1.0/ttpositions.aspx";

async fn serve_json(server: &MockServer, body: serde_json::Value) {
    server.reset().await;
    Mock::given(method("GET"))
        .and(path(FEED))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

fn poller(server: &MockServer, expression: &str, store: Arc<MemoryObjectStore>) -> Poller {
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(2),
        user_agent: Some("otp-test".to_string()),
    })
    .unwrap();
    Poller::from_parts(
        format!("{}{FEED}", server.uri()),
        Expression::compile(expression).unwrap(),
        http,
        DedupStore::new(store),
    )
}

#[tokio::test]
async fn identical_projections_are_written_once_and_changes_are_written_again() {
    let server = MockServer::start().await;
    let store = Arc::new(MemoryObjectStore::new("otp.test.cta-train"));
    let poller = poller(&server, "a", store.clone());

    serve_json(&server, json!({"a": 1, "b": 2})).await;
    let first = poller.poll_once(Utc::now()).await.expect("first cycle");
    let second = poller.poll_once(Utc::now()).await.expect("second cycle");

    assert!(first.written);
    assert!(!second.written);
    assert_eq!(first.key, second.key);
    assert_eq!(first.key, Fingerprint::of_bytes(b"1"));
    assert_eq!(store.get(first.key.as_str()).await.as_deref(), Some(&b"1"[..]));

    serve_json(&server, json!({"a": 3, "b": 2})).await;
    let third = poller.poll_once(Utc::now()).await.expect("third cycle");

    assert!(third.written);
    assert_ne!(third.key, first.key);
    assert_eq!(store.len().await, 2);
    assert_eq!(store.put_calls().await, 2);
    assert_eq!(
        poller.stats(),
        PollStatsSnapshot {
            cycles: 3,
            written: 2,
            skipped: 1,
            failed: 0
        }
    );
}

#[tokio::test]
async fn key_order_in_the_response_does_not_change_the_fingerprint() {
    let server = MockServer::start().await;
    let store = Arc::new(MemoryObjectStore::new("bucket"));
    let poller = poller(&server, "@", store.clone());

    for body in [r#"{"x": 1, "y": {"p": true, "q": null}}"#, r#"{"y": {"q": null, "p": true}, "x": 1}"#] {
        server.reset().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/json"))
            .mount(&server)
            .await;
        poller.poll_once(Utc::now()).await.expect("cycle");
    }

    assert_eq!(store.put_calls().await, 1);
    assert_eq!(poller.stats().skipped, 1);
}

#[tokio::test]
async fn unmatched_expression_persists_a_null_projection() {
    let server = MockServer::start().await;
    let store = Arc::new(MemoryObjectStore::new("bucket"));
    let poller = poller(&server, "route", store.clone());
    serve_json(&server, json!({"other": 1})).await;

    let report = poller.run_cycle(Utc::now()).await.expect("cycle");

    assert!(report.written);
    assert_eq!(report.bytes, 4);
    assert_eq!(store.get(report.key.as_str()).await.as_deref(), Some(&b"null"[..]));
}

#[tokio::test]
async fn malformed_and_empty_bodies_fail_the_cycle_without_writing() {
    let server = MockServer::start().await;
    let store = Arc::new(MemoryObjectStore::new("bucket"));
    let poller = poller(&server, "@", store.clone());

    for body in ["", "<html>maintenance</html>"] {
        server.reset().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let err = poller.poll_once(Utc::now()).await.unwrap_err();
        assert!(matches!(err, CycleError::Fetch(FetchError::Decode { .. })), "{body:?}");
        assert_eq!(err.stage(), CycleStage::Fetching);
        assert!(err.key().is_none());
    }

    assert_eq!(store.put_calls().await, 0);
    assert_eq!(store.exists_calls().await, 0);
    assert_eq!(poller.stats().failed, 2);
}

#[tokio::test]
async fn failed_cycle_does_not_stop_the_scheduler() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(FEED))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"a": 1})))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryObjectStore::new("bucket"));
    let poller = poller(&server, "a", store.clone());
    let stats = poller
        .run_cycles(&Scheduler::new(Duration::from_millis(10)), 3)
        .await;

    assert_eq!(
        stats,
        PollStatsSnapshot {
            cycles: 3,
            written: 1,
            skipped: 1,
            failed: 1
        }
    );
    assert_eq!(store.len().await, 1);
}

#[tokio::test]
async fn write_failure_is_retried_by_a_later_cycle() {
    let server = MockServer::start().await;
    serve_json(&server, json!({"a": [1, 2]})).await;
    let store = Arc::new(MemoryObjectStore::new("bucket"));
    let poller = poller(&server, "a", store.clone());
    store.fail_next_puts(1).await;

    let err = poller.poll_once(Utc::now()).await.unwrap_err();
    assert_eq!(err.stage(), CycleStage::Writing);
    assert_eq!(err.key(), Some(&Fingerprint::of_bytes(b"[1,2]")));
    assert!(matches!(
        err,
        CycleError::Store { op: StoreOp::Put, source: StoreError::Write { .. }, .. }
    ));
    assert!(store.is_empty().await);

    let report = poller.poll_once(Utc::now()).await.expect("retry cycle");
    assert!(report.written);
    assert_eq!(store.len().await, 1);
}

#[tokio::test]
async fn missing_container_is_provisioned_lazily() {
    let server = MockServer::start().await;
    serve_json(&server, json!({"a": 1})).await;
    let store = Arc::new(MemoryObjectStore::without_container("bucket"));
    let poller = poller(&server, "a", store.clone());

    let report = poller.poll_once(Utc::now()).await.expect("cycle");

    assert!(report.written);
    assert_eq!(store.len().await, 1);
}

#[tokio::test]
async fn failed_provisioning_fails_the_cycle_without_writing() {
    let server = MockServer::start().await;
    serve_json(&server, json!({"a": 1})).await;
    let store = Arc::new(MemoryObjectStore::without_container("bucket"));
    store.fail_provisioning().await;
    let poller = poller(&server, "a", store.clone());

    let err = poller.poll_once(Utc::now()).await.unwrap_err();

    assert!(matches!(
        err,
        CycleError::Store { source: StoreError::Provision { .. }, .. }
    ));
    assert_eq!(err.stage(), CycleStage::CheckingExistence);
    assert_eq!(err.key(), Some(&Fingerprint::of_bytes(b"1")));
    assert_eq!(store.put_calls().await, 0);
    assert_eq!(poller.stats().failed, 1);
}

#[tokio::test]
async fn unreadable_existence_check_still_writes() {
    let server = MockServer::start().await;
    serve_json(&server, json!({"a": 1})).await;
    let store = Arc::new(MemoryObjectStore::new("bucket"));
    store.fail_next_exists(1).await;
    let poller = poller(&server, "a", store.clone());

    let report = poller.poll_once(Utc::now()).await.expect("cycle");

    assert!(report.written);
    assert_eq!(store.get(report.key.as_str()).await.as_deref(), Some(&b"1"[..]));
}

#[tokio::test]
async fn filesystem_store_end_to_end() {
    let server = MockServer::start().await;
    serve_json(
        &server,
        json!({"ctatt": {"tmst": "2026-10-19T08:00:00", "route": [{"@name": "red", "train": [{"rn": "801"}]}]}}),
    )
    .await;
    let dir = tempfile::tempdir().expect("tempdir");
    let source = MapConfig::new()
        .with("PROVIDER_API_ROOT", format!("{}{FEED}", server.uri()))
        .with("PROVIDER_JMESPATH_EXPRESSION", "ctatt.route[*].train[].rn")
        .with("PROJECT_NAME", "opentransit-poller")
        .with("STAGE", "test")
        .with("PROVIDER_NAME", "cta-train")
        .with("OBJECT_STORE_ROOT", dir.path().display().to_string());
    let config = PollerConfig::from_source(&source).expect("config");
    let fs_store = FsObjectStore::new(config.object_store_root.clone(), config.container.clone());
    let poller = Poller::new(&config, Arc::new(fs_store.clone())).expect("poller");

    poller.provision().await.expect("provision");
    let report = poller.poll_once(Utc::now()).await.expect("cycle");

    assert_eq!(fs_store.container(), "opentransit-poller.test.cta-train");
    let object = std::fs::read(fs_store.object_path(report.key.as_str()).unwrap()).unwrap();
    assert_eq!(object, br#"["801"]"#.to_vec());
    assert!(fs_store.exists(report.key.as_str()).await.unwrap());

    let again = poller.poll_once(Utc::now()).await.expect("second cycle");
    assert!(!again.written);
}

//! HTTP remote against a mock sync service

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pantry_core::{
    EntityKey, HttpRemote, LocalStore, MutationRecord, NetworkMonitor, Operation, Payload,
    PushOutcome, PushStatus, RemoteApi, RemoteError, SyncConfig, SyncEngine, SyncError,
};
use serde_json::{json, Value};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

fn remote(server: &MockServer) -> HttpRemote {
    HttpRemote::new(server.uri(), Duration::from_secs(5)).unwrap()
}

fn update(id: &str, name: &str) -> MutationRecord {
    let key = EntityKey::recipe(id);
    let payload = Payload::from_json(key.entity_type, json!({ "name": name })).unwrap();
    MutationRecord::new(key, Operation::Update, Some(payload), Utc::now())
}

/// Accept every record in a push body
fn accept_all(request: &Request) -> ResponseTemplate {
    let records: Vec<Value> = serde_json::from_slice(&request.body).unwrap();
    let outcomes: Vec<Value> = records
        .iter()
        .map(|r| json!({ "mutation_id": r["id"], "status": "accepted" }))
        .collect();
    ResponseTemplate::new(200).set_body_json(outcomes)
}

// ── Pull ────────────────────────────────────────────────────────

#[tokio::test]
async fn pull_sends_cursor_and_parses_page() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sync/pull"))
        .and(query_param("since", "c-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "changes": [{
                "id": "r1",
                "payload": { "entity_type": "recipe", "fields": { "name": "Soup" } },
                "modified_at": "2024-05-01T12:00:00Z"
            }],
            "next_cursor": "c-2",
            "has_more": true
        })))
        .expect(1)
        .mount(&server)
        .await;

    let page = remote(&server).pull(Some("c-1")).await.unwrap();

    assert_eq!(page.changes.len(), 1);
    assert_eq!(page.changes[0].key(), EntityKey::recipe("r1"));
    assert_eq!(page.changes[0].payload.name(), Some("Soup"));
    assert!(!page.changes[0].deleted);
    assert_eq!(page.next_cursor.as_deref(), Some("c-2"));
    assert!(page.has_more);
}

#[tokio::test]
async fn first_pull_has_no_cursor() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sync/pull"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "changes": [],
            "next_cursor": null
        })))
        .mount(&server)
        .await;

    let page = remote(&server).pull(None).await.unwrap();
    assert!(page.changes.is_empty());

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].url.query(), None);
}

// ── Push ────────────────────────────────────────────────────────

#[tokio::test]
async fn push_posts_records_and_parses_outcomes() {
    let server = MockServer::start().await;
    let first = update("r1", "One");
    let second = update("r2", "Two");

    Mock::given(method("POST"))
        .and(path("/sync/push"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "mutation_id": first.id, "status": "accepted" },
            { "mutation_id": second.id, "status": "rejected", "reason": "name taken" }
        ])))
        .mount(&server)
        .await;

    let outcomes = remote(&server)
        .push(&[first.clone(), second.clone()])
        .await
        .unwrap();

    assert_eq!(outcomes[0], PushOutcome::accepted(&first.id));
    assert_eq!(outcomes[1].status, PushStatus::Rejected);
    assert_eq!(outcomes[1].reason.as_deref(), Some("name taken"));

    let requests = server.received_requests().await.unwrap();
    let body: Vec<MutationRecord> = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body, vec![first, second]);
}

#[tokio::test]
async fn push_conflict_carries_remote_version() {
    let server = MockServer::start().await;
    let record = update("r1", "Mine");

    Mock::given(method("POST"))
        .and(path("/sync/push"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
            "mutation_id": record.id,
            "status": "conflict",
            "remote_version": {
                "id": "r1",
                "payload": { "entity_type": "recipe", "fields": { "name": "Theirs" } },
                "modified_at": "2024-05-01T12:00:00Z"
            }
        }])))
        .mount(&server)
        .await;

    let outcomes = remote(&server).push(&[record]).await.unwrap();
    assert_eq!(outcomes[0].status, PushStatus::Conflict);
    let theirs = outcomes[0].remote_version.as_ref().unwrap();
    assert_eq!(theirs.payload.name(), Some("Theirs"));
}

// ── Errors ──────────────────────────────────────────────────────

#[tokio::test]
async fn server_errors_are_transient() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sync/pull"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;

    let err = remote(&server).pull(None).await.unwrap_err();
    assert_eq!(
        err,
        RemoteError::Server {
            status: 503,
            body: "maintenance".into()
        }
    );
    assert!(err.is_transient());
}

#[tokio::test]
async fn too_many_requests_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sync/push"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let err = remote(&server).push(&[update("r1", "X")]).await.unwrap_err();
    assert!(matches!(err, RemoteError::Server { status: 429, .. }));
}

#[tokio::test]
async fn client_errors_are_rejections() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sync/push"))
        .respond_with(ResponseTemplate::new(400).set_body_string("malformed"))
        .mount(&server)
        .await;

    let err = remote(&server).push(&[update("r1", "X")]).await.unwrap_err();
    assert!(matches!(err, RemoteError::Rejected { status: 400, .. }));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn request_timeout_status_is_a_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sync/push"))
        .respond_with(ResponseTemplate::new(408).set_body_string("request timeout"))
        .mount(&server)
        .await;

    let err = remote(&server).push(&[update("r1", "X")]).await.unwrap_err();
    assert_eq!(err, RemoteError::Timeout);
    assert!(err.is_transient());
}

#[tokio::test]
async fn malformed_body_is_invalid_response() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sync/pull"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
        .mount(&server)
        .await;

    let err = remote(&server).pull(None).await.unwrap_err();
    assert!(matches!(err, RemoteError::InvalidResponse(_)));
}

#[tokio::test]
async fn slow_response_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sync/pull"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "changes": [] }))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let remote = HttpRemote::new(server.uri(), Duration::from_millis(100)).unwrap();
    assert_eq!(remote.pull(None).await.unwrap_err(), RemoteError::Timeout);
}

// ── Engine over HTTP ────────────────────────────────────────────

#[tokio::test]
async fn engine_syncs_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sync/pull"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "changes": [{
                "id": "c1",
                "payload": { "entity_type": "collection", "fields": { "name": "Weeknight" } },
                "modified_at": "2024-05-01T12:00:00Z"
            }],
            "next_cursor": "c-1"
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/sync/push"))
        .respond_with(accept_all)
        .expect(1)
        .mount(&server)
        .await;

    let mut engine = SyncEngine::new(
        LocalStore::open_in_memory().unwrap(),
        SyncConfig::default(),
        Some(Arc::new(remote(&server)) as Arc<dyn RemoteApi>),
        Arc::new(NetworkMonitor::new(true)),
    )
    .unwrap();
    engine
        .queue_recipe_change("r1", Operation::Create, Some(json!({"name": "Soup"})))
        .unwrap();

    let report = engine.sync().await.unwrap();

    assert_eq!(report.pulled, 1);
    assert_eq!(report.pushed, 1);
    assert!(engine.queue().is_empty());
    assert_eq!(engine.store().cursor().unwrap().as_deref(), Some("c-1"));
    let pulled = engine.store().get(&EntityKey::collection("c1")).unwrap().unwrap();
    assert_eq!(pulled.payload.name(), Some("Weeknight"));
}

#[tokio::test]
async fn engine_keeps_queue_when_pushes_time_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sync/pull"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "changes": [],
            "next_cursor": "c-0"
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/sync/push"))
        .respond_with(ResponseTemplate::new(408).set_body_string("request timeout"))
        .expect(3)
        .mount(&server)
        .await;

    let config = SyncConfig {
        batch_size: 1,
        ..SyncConfig::default()
    };
    let mut engine = SyncEngine::new(
        LocalStore::open_in_memory().unwrap(),
        config,
        Some(Arc::new(remote(&server)) as Arc<dyn RemoteApi>),
        Arc::new(NetworkMonitor::new(true)),
    )
    .unwrap();
    for id in ["r1", "r2", "r3"] {
        engine
            .queue_recipe_change(id, Operation::Create, Some(json!({"name": "Soup"})))
            .unwrap();
    }

    assert!(matches!(engine.sync().await, Err(SyncError::Timeout)));

    assert_eq!(engine.queue().len(), 3);
    assert!(engine.queue().failed().is_empty());
    assert!(engine.queue().records().iter().all(|r| r.attempt_count == 1));
    assert_eq!(engine.last_sync_time(), None);
}

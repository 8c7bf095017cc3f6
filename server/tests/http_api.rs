//! HTTP surface tests. The engine is not started, so requests only touch
//! the store and the queue.

mod common;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use common::{harness, Harness};
use ferry_server::{app, AppState};
use serde_json::{json, Value};
use tower::ServiceExt;

fn router(h: &Harness) -> Router {
    app(AppState {
        engine: h.engine.clone(),
    })
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string())),
        None => request.body(Body::empty()),
    }
    .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

fn referral() -> Value {
    json!({"kind": "referrals", "fields": {"status": "open", "notes": "a", "score": 1}})
}

#[tokio::test]
async fn health_reports_stats() {
    let h = harness();
    let app = router(&h);

    let (status, body) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["sync"]["openChanges"], 0);
}

#[tokio::test]
async fn entity_lifecycle_over_http() {
    let h = harness();
    let app = router(&h);

    let (status, body) = send(&app, "POST", "/entities", Some(referral())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["localId"], 1);
    assert_eq!(body["changeId"], 1);

    let (status, body) = send(&app, "GET", "/entities/1/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "pending_push");
    assert_eq!(body["indicator"], "pending_sync");
    assert_eq!(body["fields"]["notes"], "a");

    let update = json!({"fields": {"status": "closed", "notes": "a", "score": 1}});
    let (status, body) = send(&app, "PUT", "/entities/1", Some(update.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["changeId"], 2);

    let (status, body) = send(&app, "POST", "/entities/1/sync", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["localId"], 1);
    assert_eq!(body["changeId"], 1);
    assert_eq!(body["indicator"], "pending_sync");

    let (status, _) = send(&app, "DELETE", "/entities/1", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = send(&app, "PUT", "/entities/1", Some(update)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("deleted"));
}

#[tokio::test]
async fn sync_request_accepts_an_explicit_priority() {
    let h = harness();
    let app = router(&h);
    send(&app, "POST", "/entities", Some(referral())).await;

    let (status, body) = send(
        &app,
        "POST",
        "/entities/1/sync",
        Some(json!({"priority": "background"})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "pending_push");
}

#[tokio::test]
async fn bad_requests_are_rejected() {
    let h = harness();
    let app = router(&h);

    let (status, body) = send(
        &app,
        "POST",
        "/entities",
        Some(json!({"kind": "profiles", "fields": {}})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "unknown entity kind: profiles");

    let (status, _) = send(&app, "GET", "/entities/99/status", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, "POST", "/entities/99/sync", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, "GET", "/conflicts?status=bogus", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn admin_endpoints() {
    let h = harness();
    let app = router(&h);

    let (status, body) = send(&app, "GET", "/conflicts?status=unresolved", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));

    let (status, body) = send(&app, "GET", "/operations/failed", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));

    let (status, body) = send(&app, "GET", "/diagnostics", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));

    let (status, _) = send(
        &app,
        "POST",
        "/conflicts/7/resolve",
        Some(json!({"decision": "take_local"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, "POST", "/operations/5/retry", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // A pending entry is not a failed one
    send(&app, "POST", "/entities", Some(referral())).await;
    let (status, _) = send(&app, "POST", "/operations/1/retry", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn background_sync_queues_each_kind() {
    let h = harness();
    let app = router(&h);

    let (status, body) = send(&app, "POST", "/sync/background", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["scheduled"], 1);

    // Already queued and no worker is running
    let (_, body) = send(&app, "POST", "/sync/background", None).await;
    assert_eq!(body["scheduled"], 0);
}

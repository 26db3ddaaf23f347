//! HTTP boundary tests against a launched coordinator

mod common;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use common::{launch, wait_for, write_clip, FakeAnalyzer, ScriptedSource};
use mediaflow::server::MediaServer;

async fn send(router: &axum::Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_health_and_readiness() {
    let harness = launch(FakeAnalyzer::speaking(), ScriptedSource::default()).await;
    let router = MediaServer::new(harness.coordinator.clone()).build_router();

    let (status, body) = send(&router, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"OK");

    let (status, _) = send(&router, get("/ready")).await;
    assert_eq!(status, StatusCode::OK);

    harness.coordinator.shutdown();
    let (status, _) = send(&router, get("/ready")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_submit_remote_and_lookup() {
    let harness = launch(FakeAnalyzer::speaking(), ScriptedSource::default()).await;
    let router = MediaServer::new(harness.coordinator.clone()).build_router();

    let (status, body) = send(
        &router,
        post_json(
            "/api/submit/remote",
            json!({"url": "https://www.youtube.com/watch?v=dQw4w9WgXcQ"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let submission: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(submission["created"], true);
    let id = submission["id"].as_str().unwrap().to_string();

    let (status, body) = send(&router, get("/api/exists/dQw4w9WgXcQ")).await;
    assert_eq!(status, StatusCode::OK);
    let exists: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(exists["id"], id.as_str());

    let (status, body) = send(&router, get(&format!("/api/media/{}", id))).await;
    assert_eq!(status, StatusCode::OK);
    let item: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(item["uri"], "dQw4w9WgXcQ");
    assert_eq!(item["source"], "remote");

    let (status, _) = send(&router, get("/api/exists/aaaaaaaaaaa")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_invalid_requests() {
    let harness = launch(FakeAnalyzer::speaking(), ScriptedSource::default()).await;
    let router = MediaServer::new(harness.coordinator.clone()).build_router();

    let (status, body) = send(
        &router,
        post_json("/api/submit/remote", json!({"url": "https://example.com/nothing"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let error: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(error["error"]["type"], "invalid_request");

    let (status, _) = send(
        &router,
        post_json("/api/submit/local", json!({"path": "/definitely/not/here.mp4"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&router, get("/api/media/missing")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &router,
        post_json("/api/retry", json!({"id": "missing", "stages": []})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_local_job_previews_and_delete() {
    let harness = launch(FakeAnalyzer::speaking(), ScriptedSource::default()).await;
    let router = MediaServer::new(harness.coordinator.clone()).build_router();
    let clip = write_clip(harness.dir.path(), "talk.mp4");

    let (status, body) = send(
        &router,
        post_json("/api/submit/local", json!({"path": clip})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let id = serde_json::from_slice::<Value>(&body).unwrap()["id"]
        .as_str()
        .unwrap()
        .to_string();

    wait_for(&harness.coordinator, &id, |i| {
        i.status.is_terminal() && i.frames_available
    })
    .await;

    let (status, body) = send(&router, get("/api/media")).await;
    assert_eq!(status, StatusCode::OK);
    let previews: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(previews["success"][0]["id"], id.as_str());
    assert_eq!(previews["queued"].as_array().unwrap().len(), 0);

    let (status, body) = send(&router, get(&format!("/api/frames/{}", id))).await;
    assert_eq!(status, StatusCode::OK);
    let index: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(index["timestamps"], json!([0, 5]));

    let response = router
        .clone()
        .oneshot(get(&format!("/api/thumbnail/{}?low_res=true", id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "image/jpeg");

    let (status, body) = send(&router, get(&format!("/api/frame/{}/5", id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"frame@5");

    let (status, body) = send(&router, get("/api/status")).await;
    assert_eq!(status, StatusCode::OK);
    let snapshot: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(snapshot["processor_status"], "warmed up");

    let (status, body) = send(
        &router,
        post_json("/api/media/delete", json!({"ids": [id.clone()]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(serde_json::from_slice::<Value>(&body).unwrap()["deleted"], 1);

    let (status, _) = send(&router, get(&format!("/api/frame/{}/5", id))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_settings_round_trip_through_api() {
    let harness = launch(FakeAnalyzer::speaking(), ScriptedSource::default()).await;
    let router = MediaServer::new(harness.coordinator.clone()).build_router();
    let mut events = harness.coordinator.subscribe();

    let (status, body) = send(&router, get("/api/settings")).await;
    assert_eq!(status, StatusCode::OK);
    let current: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(current["identify_speakers"], json!(true));
    assert_eq!(current["cookies_from_browser"], Value::Null);

    let (status, body) = send(
        &router,
        post_json("/api/settings", json!({"cookies_from_browser": "firefox"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let updated: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(updated["cookies_from_browser"], json!("firefox"));
    assert_eq!(updated["identify_speakers"], json!(true));

    // Worker status events may arrive first
    let event = loop {
        let event = events.recv().await.unwrap();
        if event.message_type == "settings_update" {
            break event;
        }
    };
    assert_eq!(event.content["cookies_from_browser"], json!("firefox"));

    let (_, body) = send(&router, get("/api/settings")).await;
    let reread: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(reread, updated);
}

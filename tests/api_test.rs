//! HTTP surface tests, driven through the router without binding a socket

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use chatgate::core::ScriptedEngine;
use chatgate::{Gateway, Settings};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

fn gateway(engine: ScriptedEngine) -> Gateway {
    Gateway::new(Arc::new(engine), Settings::default())
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_health_reports_engine() {
    let gateway = gateway(ScriptedEngine::from_reply("hi"));

    let response = gateway
        .router()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let health: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["engine"], "scripted");
    assert_eq!(health["sessions"], 0);
}

#[tokio::test]
async fn test_generate_stream_emits_tokens_then_done() {
    let gateway = gateway(ScriptedEngine::new(["Hi", " there"]));

    let response = gateway
        .router()
        .oneshot(post_json(
            "/generate-stream",
            json!({ "session_id": "s1", "prompt": "hello" }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let text = body_text(response).await;
    let hi = text.find(r#"data: {"token":"Hi"}"#).unwrap();
    let there = text.find(r#"data: {"token":" there"}"#).unwrap();
    let done = text.find("event: done").unwrap();
    assert!(hi < there && there < done);
    assert!(text.contains(r#""fragments":2"#));
    assert!(!text.contains("event: error"));
}

#[tokio::test]
async fn test_generate_stream_reports_engine_error() {
    let gateway = gateway(ScriptedEngine::new(["Hi"]).fail_after(0, "backend down"));

    let response = gateway
        .router()
        .oneshot(post_json(
            "/generate-stream",
            json!({ "session_id": "s1", "prompt": "hello" }),
        ))
        .await
        .unwrap();

    let text = body_text(response).await;
    assert!(text.contains("event: error"));
    assert!(text.contains("backend down"));
    assert!(!text.contains("event: done"));
}

#[tokio::test]
async fn test_invalid_max_tokens_is_rejected() {
    let gateway = gateway(ScriptedEngine::from_reply("hi"));

    let response = gateway
        .router()
        .oneshot(post_json(
            "/generate-stream",
            json!({ "session_id": "s1", "prompt": "hello", "max_tokens": 0 }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let error: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(error["code"], "INVALID_REQUEST");
    assert!(gateway.store().history("s1").await.is_empty());
}

#[tokio::test]
async fn test_session_history_after_generation() {
    let gateway = gateway(ScriptedEngine::from_reply("Hi there"));
    let router = gateway.router();

    let response = router
        .clone()
        .oneshot(post_json(
            "/generate-stream",
            json!({ "session_id": "s1", "prompt": "hello" }),
        ))
        .await
        .unwrap();
    body_text(response).await;

    let response = router
        .oneshot(Request::builder().uri("/sessions/s1").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let session: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(session["session_id"], "s1");
    assert_eq!(
        session["turns"],
        json!([
            { "role": "user", "content": "hello" },
            { "role": "assistant", "content": "Hi there" },
        ])
    );
}

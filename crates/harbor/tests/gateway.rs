//! HTTP tests for both routers

mod common;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use serde_json::Value;
use tower::ServiceExt;

use common::{archive_bytes, harness, write_archive, write_zip, Harness};
use harbor::gateway::{control_router, data_router, DataPlane, TIMEOUT_HEADER};

const TOKEN: &str = "s3cret";
const BODY_LIMIT: usize = 1024 * 1024;

fn routers(h: &Harness, token: Option<&str>) -> (Router, Router) {
    let control = control_router(h.registry.clone(), BODY_LIMIT);
    let data = data_router(
        DataPlane::new(h.registry.clone())
            .with_auth_token(token.map(str::to_string))
            .with_body_limit(BODY_LIMIT),
    );
    (control, data)
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body.to_vec())
}

async fn send_json(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let (status, body) = send(router, request).await;
    (status, serde_json::from_slice(&body).unwrap())
}

fn post(uri: &str) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn invoke(capability: &str, body: &'static str) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(format!("/invoke/{capability}"))
        .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from(body))
        .unwrap()
}

#[tokio::test]
async fn test_control_then_invoke() {
    let h = harness().await;
    let zip = write_archive(&h.plugins_dir(), "plugin-a", "1.0.0", &["echo"]);
    std::fs::rename(&zip, h.plugins_dir().join("plugin-a.jar")).unwrap();
    let (control, data) = routers(&h, Some(TOKEN));

    let (status, body) = send_json(&control, post("/plugins/rescan")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["added"][0], "plugin-a");

    let (status, body) = send_json(&data, invoke("echo", "hi")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["kind"], "CAPABILITY_NOT_FOUND");

    let (status, body) = send_json(&control, post("/plugins/plugin-a/load")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "LOADING");

    let (status, body) = send_json(&data, invoke("echo", "hi")).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["kind"], "CAPABILITY_INACTIVE");

    let (status, body) = send_json(&control, post("/plugins/plugin-a/activate")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "ACTIVE");

    let mut request = invoke("echo", r#"{"msg":"hi"}"#);
    request.headers_mut().insert(
        header::CONTENT_TYPE,
        "application/json".parse().unwrap(),
    );
    let response = data.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body, serde_json::json!({"msg": "hi"}));

    let (status, body) = send_json(&control, get("/plugins/plugin-a/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["alive"], true);
    assert_eq!(body["counters"]["invocations"], 1);

    let (status, body) = send_json(&control, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["routes"][0]["capability"], "echo");
    assert_eq!(body["live_sandboxes"], 1);

    let (status, body) = send_json(&control, post("/plugins/plugin-a/deactivate")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "UNLOADED");

    let (status, _) = send(&data, invoke("echo", "hi")).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_control_routes_are_not_on_the_data_plane() {
    let h = harness().await;
    write_archive(&h.plugins_dir(), "plugin-a", "1.0.0", &["echo"]);
    h.registry.rescan().await.unwrap();
    let (_, data) = routers(&h, None);

    for uri in [
        "/plugins/plugin-a/load",
        "/plugins/plugin-a/activate",
        "/plugins/plugin-a/deactivate",
        "/plugins/plugin-a/reload",
        "/plugins/rescan",
    ] {
        let (status, _) = send(&data, post(uri)).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
    }
    let (status, _) = send(&data, get("/plugins")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Nothing changed
    assert_eq!(
        h.registry.snapshot("plugin-a").unwrap().state,
        harbor::LifecycleState::Discovered
    );
}

#[tokio::test]
async fn test_bearer_token_is_required() {
    let h = harness().await;
    let (_, data) = routers(&h, Some(TOKEN));

    let (status, body) = send_json(&data, post("/invoke/echo")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["kind"], "UNAUTHORIZED");

    let request = Request::builder()
        .method(Method::POST)
        .uri("/invoke/echo")
        .header(header::AUTHORIZATION, "Bearer nope")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&data, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Liveness stays public
    let (status, _) = send(&data, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_missing_token_rejects_invocations() {
    let h = harness().await;
    write_archive(&h.plugins_dir(), "plugin-a", "1.0.0", &["echo"]);
    h.registry.rescan().await.unwrap();
    h.registry.load("plugin-a", false).await.unwrap();
    h.registry.activate("plugin-a").await.unwrap();
    let (_, data) = routers(&h, None);

    let (status, body) = send_json(&data, invoke("echo", "hi")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["kind"], "UNAUTHORIZED");
    assert_eq!(body["error"]["message"], "AUTH_TOKEN is not configured");

    let (status, _) = send(&data, get("/health")).await;
    assert_eq!(status, StatusCode::OK);

    // Open access is an explicit opt-in
    let open = data_router(
        DataPlane::new(h.registry.clone())
            .with_anonymous_access(true)
            .with_body_limit(BODY_LIMIT),
    );
    let request = Request::builder()
        .method(Method::POST)
        .uri("/invoke/echo")
        .body(Body::from("hi"))
        .unwrap();
    let (status, body) = send(&open, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"hi");

    // A configured token wins over anonymous access
    let guarded = data_router(
        DataPlane::new(h.registry.clone())
            .with_auth_token(Some(TOKEN.to_string()))
            .with_anonymous_access(true),
    );
    let (status, _) = send(&guarded, post("/invoke/echo")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_invocation_failures_map_to_statuses() {
    let h = harness().await;
    write_archive(&h.plugins_dir(), "plugin-a", "1.0.0", &["slow", "boom"]);
    h.registry.rescan().await.unwrap();
    h.registry.load("plugin-a", false).await.unwrap();
    h.registry.activate("plugin-a").await.unwrap();
    let (_, data) = routers(&h, Some(TOKEN));

    let mut request = invoke("slow", "5000");
    request
        .headers_mut()
        .insert(TIMEOUT_HEADER, "50".parse().unwrap());
    let (status, body) = send_json(&data, request).await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body["error"]["kind"], "INVOCATION_TIMEOUT");

    let (status, body) = send_json(&data, invoke("boom", "")).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"]["kind"], "INVOCATION_FAILED");

    let mut request = invoke("slow", "1");
    request
        .headers_mut()
        .insert(TIMEOUT_HEADER, "soon".parse().unwrap());
    let (status, body) = send_json(&data, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "INVALID_REQUEST");

    // A plugin error does not take the plugin down
    assert_eq!(
        h.registry.snapshot("plugin-a").unwrap().state,
        harbor::LifecycleState::Active
    );
}

#[tokio::test]
async fn test_control_errors() {
    let h = harness().await;
    write_archive(&h.plugins_dir(), "plugin-a", "1.0.0", &["echo"]);
    write_zip(
        &h.plugins_dir().join("broken.zip"),
        &[("bin/run", b"#!/bin/sh\n")],
    );
    let (control, _) = routers(&h, None);
    send(&control, post("/plugins/rescan")).await;

    let (status, body) = send_json(&control, post("/plugins/unknown/activate")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["kind"], "NOT_FOUND");

    let (status, body) = send_json(&control, post("/plugins/broken/load")).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["kind"], "MISSING_MANIFEST");

    send(&control, post("/plugins/plugin-a/load")).await;
    send(&control, post("/plugins/plugin-a/activate")).await;

    let (status, body) = send_json(&control, post("/plugins/plugin-a/activate")).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["kind"], "ALREADY_ACTIVE");

    let (status, body) = send_json(&control, post("/plugins/plugin-a/load")).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["kind"], "CAPABILITY_CONFLICT");

    let (status, body) = send_json(&control, post("/plugins/plugin-a/reload")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "ACTIVE");

    let request = Request::builder()
        .method(Method::DELETE)
        .uri("/plugins/plugin-a?purge=true")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&control, request).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(&control, get("/plugins/plugin-a")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_delete_accepts_versioned_reference() {
    let h = harness().await;
    write_archive(&h.plugins_dir(), "plugin-a", "1.0.0", &["echo"]);
    h.registry.rescan().await.unwrap();
    h.registry.load("plugin-a", false).await.unwrap();
    h.registry.activate("plugin-a").await.unwrap();
    let (control, _) = routers(&h, None);

    let request = Request::builder()
        .method(Method::DELETE)
        .uri("/plugins/plugin-a:1.0.0")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send_json(&control, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], "plugin-a");
    assert_eq!(body["state"], "UNLOADED");
    assert_eq!(h.registry.live_sandboxes(), 0);
}

fn multipart(file_name: &str, contents: &[u8]) -> (String, Vec<u8>) {
    let boundary = "harbor-test-boundary";
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\n\
             Content-Type: application/zip\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(contents);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    (format!("multipart/form-data; boundary={boundary}"), body)
}

#[tokio::test]
async fn test_upload_installs_and_activates() {
    let h = harness().await;
    let (control, data) = routers(&h, Some(TOKEN));

    let (content_type, body) = multipart(
        "uploaded.zip",
        &archive_bytes("uploaded", "1.0.0", &["upload-echo"]),
    );
    let request = Request::builder()
        .method(Method::POST)
        .uri("/plugins?activate=true")
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from(body))
        .unwrap();
    let (status, body) = send_json(&control, request).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["id"], "uploaded");
    assert_eq!(body["state"], "ACTIVE");
    assert!(h.plugins_dir().join("uploaded.zip").exists());

    let (status, body) = send(&data, invoke("upload-echo", "ping")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"ping");
}

#[tokio::test]
async fn test_upload_rejects_archives_without_manifest() {
    let h = harness().await;
    let (control, _) = routers(&h, None);

    let dir = tempfile::TempDir::new().unwrap();
    let path = write_zip(&dir.path().join("x.zip"), &[("bin/run", b"#!/bin/sh\n")]);
    let (content_type, body) = multipart("x.zip", &std::fs::read(path).unwrap());
    let request = Request::builder()
        .method(Method::POST)
        .uri("/plugins")
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from(body))
        .unwrap();

    let (status, body) = send_json(&control, request).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["kind"], "MISSING_MANIFEST");
    assert!(!h.plugins_dir().join("x.zip").exists());
    assert!(h.registry.list().is_empty());
}

mod common;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode},
};
use common::{ADMIN, ADMIN_PASSWORD, TestGate};
use serde_json::{Value, json};
use sessiongate::router::{GateState, gate_router};
use tower::ServiceExt;

fn app(gate: &TestGate) -> Router {
    gate_router(GateState::new(gate.gateway.clone()))
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.clone().oneshot(req).await.expect("request failed");
    let status = resp.status();
    let body = to_bytes(resp.into_body(), usize::MAX)
        .await
        .expect("failed to read response body");
    let value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).expect("response body was not json")
    };
    (status, value)
}

fn post_json(uri: &str, bearer: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(token) = bearer {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder
        .body(Body::from(body.to_string()))
        .expect("failed to build request")
}

fn get(uri: &str, bearer: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(token) = bearer {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::empty()).expect("failed to build request")
}

async fn login(app: &Router, username: &str, password: &str) -> (StatusCode, Value) {
    send(
        app,
        post_json(
            "/auth/login",
            None,
            json!({"username": username, "password": password}),
        ),
    )
    .await
}

#[tokio::test]
async fn login_returns_bearer_token() {
    let gate = TestGate::new("http-login").await;
    let app = app(&gate);

    let (status, body) = login(&app, ADMIN, ADMIN_PASSWORD).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["token_type"], "Bearer");
    assert!(body["token"].as_str().is_some_and(|t| t.split('.').count() == 3));
    assert!(body["expires_at"].is_string());

    let (status, body) = login(&app, ADMIN, "wrong-password").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "AUTHENTICATION_FAILED");
}

#[tokio::test]
async fn me_requires_a_valid_bearer() {
    let gate = TestGate::new("http-me").await;
    let app = app(&gate);
    let token = gate.admin_token().await;

    let (status, body) = send(&app, get("/auth/me", Some(&token))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["username"], ADMIN);
    assert_eq!(body["role"], "admin");
    assert!(body.get("password_hash").is_none());

    let (missing_status, missing) = send(&app, get("/auth/me", None)).await;
    let (forged_status, forged) = send(&app, get("/auth/me", Some("a.b.c"))).await;
    assert_eq!(missing_status, StatusCode::UNAUTHORIZED);
    assert_eq!(forged_status, StatusCode::UNAUTHORIZED);
    assert_eq!(missing, forged);
    assert_eq!(missing["error"]["code"], "INVALID_TOKEN");
}

#[tokio::test]
async fn admin_routes_enforce_role() {
    let gate = TestGate::new("http-admin").await;
    let app = app(&gate);
    let admin = gate.admin_token().await;

    let (status, body) = send(
        &app,
        post_json(
            "/admin/users",
            Some(&admin),
            json!({"username": "dave", "password": "dave-password"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["username"], "dave");
    assert_eq!(body["role"], "user");

    let (status, body) = send(
        &app,
        post_json(
            "/admin/users",
            Some(&admin),
            json!({"username": "dave", "password": "dave-password"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "USERNAME_TAKEN");

    let (_, body) = login(&app, "dave", "dave-password").await;
    let dave = body["token"].as_str().unwrap().to_string();

    let (status, _) = send(&app, post_json("/admin/keys/rotate", Some(&dave), json!({}))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) = send(&app, get("/admin/pool", Some(&dave))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = send(&app, get("/admin/pool", Some(&admin))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["capacity"], 4);
}

#[tokio::test]
async fn password_change_over_http() {
    let gate = TestGate::new("http-passwd").await;
    let app = app(&gate);
    let admin = gate.admin_token().await;

    let (status, _) = send(
        &app,
        post_json(
            "/auth/password",
            Some(&admin),
            json!({"current_password": ADMIN_PASSWORD, "new_password": "short"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        &app,
        post_json(
            "/auth/password",
            Some(&admin),
            json!({"current_password": ADMIN_PASSWORD, "new_password": "brand-new-pass"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(body, Value::Null);

    let (status, _) = login(&app, ADMIN, "brand-new-pass").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn key_rotation_keeps_old_tokens_in_grace() {
    let gate = TestGate::new("http-rotate").await;
    let app = app(&gate);
    let admin = gate.admin_token().await;

    let (status, body) = send(&app, post_json("/admin/keys/rotate", Some(&admin), json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["kid"], gate.gateway.tokens().current_kid());

    let (status, _) = send(&app, get("/auth/me", Some(&admin))).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn malformed_json_gets_the_uniform_error_body() {
    let gate = TestGate::new("http-badjson").await;
    let app = app(&gate);

    let req = Request::builder()
        .method("POST")
        .uri("/auth/login")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .expect("failed to build request");
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "INVALID_REQUEST");
    assert!(body["error"]["message"].is_string());

    let admin = gate.admin_token().await;
    let (status, body) = send(
        &app,
        post_json("/admin/users", Some(&admin), json!({"username": "frank"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "INVALID_REQUEST");
}

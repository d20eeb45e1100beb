//! REST API tests against the mock backend.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

use hostfleet_api::config::Config;
use hostfleet_api::http_server::{build_router, AppState};
use hostfleet_api::registry::HostRegistry;
use hostfleet_api::server::initialize_hosts;
use hostfleet_hypervisor::MockConnector;
use hostfleet_pool::{ConnectionPool, PoolConfig};

struct TestApp {
    router: axum::Router,
    state: Arc<AppState>,
    connector: Arc<MockConnector>,
    _dir: TempDir,
}

async fn setup() -> TestApp {
    let dir = TempDir::new().unwrap();
    let connector = Arc::new(MockConnector::new());
    let config = PoolConfig::new(Duration::from_secs(3600), Duration::from_secs(3600));
    let pool = Arc::new(ConnectionPool::new(config, connector.clone()));
    let registry = Arc::new(HostRegistry::open(dir.path().join("servers.json")).await.unwrap());

    let state = Arc::new(AppState::new(pool, registry, connector.clone()));
    TestApp {
        router: build_router(state.clone()),
        state,
        connector,
        _dir: dir,
    }
}

async fn send(app: &TestApp, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap())),
        None => request.body(Body::empty()),
    }
    .unwrap();

    let response = app.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn create(app: &TestApp, name: &str, uri: &str) -> Value {
    let (status, body) = send(app, "POST", "/api/v1/hosts", Some(json!({ "name": name, "uri": uri }))).await;
    assert_eq!(status, StatusCode::CREATED);
    body
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = setup().await;

    let (status, body) = send(&app, "GET", "/api/v1/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["healthy"], true);
    assert_eq!(body["backend"], "mock");
    assert_eq!(body["hostCount"], 0);

    app.state.pool.close_all().await;
}

#[tokio::test]
async fn test_create_host_connects() {
    let app = setup().await;

    let body = create(&app, "kvm-01", "mock://kvm-01").await;
    assert_eq!(body["is_default"], true);
    assert_eq!(body["is_active"], true);
    assert_eq!(body["timeout"], 30);
    assert_eq!(body["status"]["connected"], true);
    assert_eq!(body["status"]["hostname"], "kvm-01");
    assert_eq!(body["status"]["totalVms"], 3);
    assert_eq!(body["status"]["resources"]["cpuCores"], 16);

    let (status, list) = send(&app, "GET", "/api/v1/hosts", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list["total"], 1);

    let (_, pool) = send(&app, "GET", "/api/v1/pool/status", None).await;
    assert_eq!(pool["connected"], 1);
    assert_eq!(pool["connections"][0]["hostId"], body["id"]);

    app.state.pool.close_all().await;
}

#[tokio::test]
async fn test_unreachable_host_is_registered_with_error() {
    let app = setup().await;
    app.connector.set_reachable("mock://dead", false);

    let body = create(&app, "dead", "mock://dead").await;
    assert_eq!(body["is_active"], false);
    assert_eq!(body["status"]["connected"], false);
    assert!(body["status"]["lastError"].as_str().unwrap().contains("unreachable"));

    app.state.pool.close_all().await;
}

#[tokio::test]
async fn test_create_requires_name_and_uri() {
    let app = setup().await;

    let (status, body) = send(&app, "POST", "/api/v1/hosts", Some(json!({ "name": "", "uri": "mock://x" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_request");

    app.state.pool.close_all().await;
}

#[tokio::test]
async fn test_validate_does_not_register() {
    let app = setup().await;

    let (status, body) = send(&app, "POST", "/api/v1/hosts/validate", Some(json!({ "uri": "mock://lab-3" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["isValid"], true);
    assert_eq!(body["hostname"], "lab-3");
    assert_eq!(app.connector.closes_of("mock://lab-3"), 1);

    app.connector.set_reachable("mock://lab-4", false);
    let (_, body) = send(&app, "POST", "/api/v1/hosts/validate", Some(json!({ "uri": "mock://lab-4" }))).await;
    assert_eq!(body["isValid"], false);
    assert!(body["message"].as_str().unwrap().starts_with("Connection failed"));

    let (status, _) = send(&app, "POST", "/api/v1/hosts/validate", Some(json!({ "uri": " " }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert_eq!(app.state.registry.host_count().await, 0);
    assert!(app.state.pool.connection_status().await.is_empty());

    app.state.pool.close_all().await;
}

#[tokio::test]
async fn test_delete_host() {
    let app = setup().await;

    let first = create(&app, "kvm-01", "mock://kvm-01").await;
    let first_id = first["id"].as_str().unwrap();

    let (status, body) = send(&app, "DELETE", &format!("/api/v1/hosts/{}", first_id), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "last_host");
    assert!(app.state.pool.connection_info(first_id).await.is_some());

    let second = create(&app, "kvm-02", "mock://kvm-02").await;
    let second_id = second["id"].as_str().unwrap();

    let (status, _) = send(&app, "DELETE", &format!("/api/v1/hosts/{}", first_id), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(app.state.pool.connection_info(first_id).await.is_none());
    assert_eq!(app.connector.closes_of("mock://kvm-01"), 1);

    let (status, _) = send(&app, "GET", &format!("/api/v1/hosts/{}", first_id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, remaining) = send(&app, "GET", &format!("/api/v1/hosts/{}", second_id), None).await;
    assert_eq!(remaining["is_default"], true);

    app.state.pool.close_all().await;
}

#[tokio::test]
async fn test_refresh_reports_unavailable_host() {
    let app = setup().await;

    let host = create(&app, "kvm-01", "mock://kvm-01").await;
    let path = format!("/api/v1/hosts/{}/refresh", host["id"].as_str().unwrap());

    app.connector.set_reachable("mock://kvm-01", false);
    let (status, body) = send(&app, "POST", &path, None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "connection_failed");

    app.connector.set_reachable("mock://kvm-01", true);
    let (status, body) = send(&app, "POST", &path, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"]["connected"], true);
    assert_eq!(body["is_active"], true);
    assert_eq!(app.connector.connects_to("mock://kvm-01"), 3);

    let (status, _) = send(&app, "POST", "/api/v1/hosts/missing/refresh", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    app.state.pool.close_all().await;
}

#[tokio::test]
async fn test_update_uri_reconnects() {
    let app = setup().await;

    let host = create(&app, "kvm-01", "mock://kvm-01").await;
    let id = host["id"].as_str().unwrap();

    let (status, body) = send(
        &app,
        "PUT",
        &format!("/api/v1/hosts/{}", id),
        Some(json!({ "uri": "mock://kvm-01b", "description": "moved" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["uri"], "mock://kvm-01b");
    assert_eq!(body["description"], "moved");
    assert_eq!(body["status"]["hostname"], "kvm-01b");
    assert_eq!(app.connector.closes_of("mock://kvm-01"), 1);

    // Description-only change keeps the connection
    let (status, _) = send(&app, "PUT", &format!("/api/v1/hosts/{}", id), Some(json!({ "description": "again" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(app.connector.connects_to("mock://kvm-01b"), 1);

    app.state.pool.close_all().await;
}

#[tokio::test]
async fn test_health_check_failure_visible_in_status() {
    let app = setup().await;

    let host = create(&app, "kvm-01", "mock://kvm-01").await;
    let path = format!("/api/v1/hosts/{}", host["id"].as_str().unwrap());

    app.connector.set_healthy("mock://kvm-01", false);
    let summary = app.state.pool.check_health().await;
    assert_eq!(summary.failed, 1);

    let (_, body) = send(&app, "GET", &path, None).await;
    assert_eq!(body["status"]["connected"], false);
    assert!(body["status"]["lastError"].as_str().unwrap().contains("not responding"));
    assert!(body["status"].get("resources").is_none());

    app.state.pool.close_all().await;
}

#[tokio::test]
async fn test_host_without_pool_entry_reports_disconnected() {
    let app = setup().await;

    let host = create(&app, "kvm-01", "mock://kvm-01").await;
    let id = host["id"].as_str().unwrap();
    assert_eq!(host["status"]["connected"], true);

    // Same outcome as an idle eviction: the registry still says active
    app.state.pool.close_connection(id).await.unwrap();
    assert!(app.state.registry.get_host(id).await.unwrap().is_active);

    let (status, body) = send(&app, "GET", &format!("/api/v1/hosts/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"]["connected"], false);
    assert!(body["status"].get("resources").is_none());

    let (_, list) = send(&app, "GET", "/api/v1/hosts", None).await;
    assert_eq!(list["hosts"][0]["status"]["connected"], false);

    app.state.pool.close_all().await;
}

#[tokio::test]
async fn test_set_default() {
    let app = setup().await;

    create(&app, "kvm-01", "mock://kvm-01").await;
    let second = create(&app, "kvm-02", "mock://kvm-02").await;
    assert_eq!(second["is_default"], false);

    let (status, body) = send(&app, "POST", &format!("/api/v1/hosts/{}/default", second["id"].as_str().unwrap()), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["is_default"], true);

    let (_, list) = send(&app, "GET", "/api/v1/hosts", None).await;
    let defaults = list["hosts"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|h| h["is_default"] == true)
        .count();
    assert_eq!(defaults, 1);

    app.state.pool.close_all().await;
}

#[tokio::test]
async fn test_startup_seeds_and_connects_default() {
    let app = setup().await;
    let mut config = Config::default();
    config.hypervisor.default_uri = "mock://local".to_string();

    initialize_hosts(&app.state, &config).await;

    let default = app.state.registry.default_host().await.unwrap();
    assert_eq!(default.name, "Local Server");
    assert!(default.is_active);
    assert!(app.state.pool.connection_info(&default.id).await.unwrap().connected);

    // A second start does not seed again
    initialize_hosts(&app.state, &config).await;
    assert_eq!(app.state.registry.host_count().await, 1);

    app.state.pool.close_all().await;
}

#[tokio::test]
async fn test_unknown_route() {
    let app = setup().await;

    let (status, body) = send(&app, "GET", "/api/v2/nothing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");

    app.state.pool.close_all().await;
}

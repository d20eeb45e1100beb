//! REST API for host management.
//!
//! All routes live under `/api/v1`:
//! - `/hosts` CRUD over the registry, with live connection status
//! - `/hosts/validate` to test a URI without registering it
//! - `/hosts/:id/refresh` to force a reconnect
//! - `/pool/status` for raw pool snapshots
//! - `/health` for liveness probes

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};

use hostfleet_hypervisor::{ConnectOptions, Connector, HostHealthCheck, HostResources};
use hostfleet_pool::{ConnectionPool, ConnectionSnapshot, PoolError};

use crate::registry::{
    CreateHostRequest, HostRecord, HostRegistry, RegistryError, UpdateHostRequest, DEFAULT_TIMEOUT_SECS,
};

/// Shared state for HTTP handlers
pub struct AppState {
    /// Live connections to registered hosts
    pub pool: Arc<ConnectionPool>,
    /// Persistent host list
    pub registry: Arc<HostRegistry>,
    /// Backend used for one-off validation connections
    pub connector: Arc<dyn Connector>,
    /// Process start, for uptime
    pub started_at: Instant,
}

impl AppState {
    pub fn new(pool: Arc<ConnectionPool>, registry: Arc<HostRegistry>, connector: Arc<dyn Connector>) -> Self {
        Self {
            pool,
            registry,
            connector,
            started_at: Instant::now(),
        }
    }
}

// ============================================================================
// API Response Types
// ============================================================================

#[derive(Serialize)]
pub struct ApiError {
    error: String,
    message: String,
}

impl ApiError {
    fn new(error: &str, message: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
        }
    }
}

type ApiFailure = (StatusCode, Json<ApiError>);

impl From<RegistryError> for ApiFailure {
    fn from(e: RegistryError) -> Self {
        let (status, code) = match &e {
            RegistryError::NotFound(_) => (StatusCode::NOT_FOUND, "host_not_found"),
            RegistryError::NoDefault => (StatusCode::NOT_FOUND, "no_default_host"),
            RegistryError::LastHost => (StatusCode::CONFLICT, "last_host"),
            RegistryError::Invalid(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            RegistryError::Io { .. } | RegistryError::Parse(_) => {
                error!(error = %e, "Host registry failure");
                (StatusCode::INTERNAL_SERVER_ERROR, "registry_error")
            }
        };
        (status, Json(ApiError::new(code, &e.to_string())))
    }
}

fn pool_failure(e: PoolError) -> ApiFailure {
    let (status, code) = match &e {
        PoolError::ConnectionNotFound(_) => (StatusCode::NOT_FOUND, "connection_not_found"),
        PoolError::ConnectionFailed { .. } => (StatusCode::SERVICE_UNAVAILABLE, "connection_failed"),
        PoolError::InvalidHost(_) => (StatusCode::BAD_REQUEST, "invalid_host"),
        PoolError::Closed => (StatusCode::SERVICE_UNAVAILABLE, "pool_closed"),
    };
    (status, Json(ApiError::new(code, &e.to_string())))
}

/// Live view of one host, merged from the registry and the pool.
#[derive(Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct HostStatusView {
    host_id: String,
    host_name: String,
    connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_used: Option<DateTime<Utc>>,
    hostname: String,
    hypervisor_version: String,
    total_vms: u32,
    running_vms: u32,
    paused_vms: u32,
    shut_off_vms: u32,
    health_checks: Vec<HostHealthCheck>,
    #[serde(skip_serializing_if = "Option::is_none")]
    resources: Option<HostResources>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_checked: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
pub struct HostWithStatus {
    #[serde(flatten)]
    host: HostRecord,
    status: HostStatusView,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostListResponse {
    hosts: Vec<HostWithStatus>,
    total: usize,
}

#[derive(Deserialize)]
pub struct ValidateHostRequest {
    uri: String,
    #[serde(default)]
    timeout: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateHostResponse {
    is_valid: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hypervisor_version: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatusResponse {
    connections: Vec<ConnectionSnapshot>,
    total: usize,
    connected: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    healthy: bool,
    version: String,
    backend: String,
    uptime_seconds: u64,
    host_count: usize,
    connected_hosts: usize,
}

// ============================================================================
// Server Setup
// ============================================================================

/// Serve the API until `shutdown` resolves.
pub async fn run_http_server(
    addr: SocketAddr,
    state: Arc<AppState>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(address = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;

    info!("HTTP server stopped");
    Ok(())
}

/// Build the application router with all routes
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/health", get(get_health))
        // Hosts
        .route("/hosts", get(list_hosts).post(create_host))
        .route("/hosts/validate", post(validate_host))
        .route("/hosts/:host_id", get(get_host).put(update_host).delete(delete_host))
        .route("/hosts/:host_id/default", post(set_default_host))
        .route("/hosts/:host_id/refresh", post(refresh_host))
        // Pool
        .route("/pool/status", get(get_pool_status))
        .with_state(state);

    Router::new()
        .nest("/api/v1", api_routes)
        .fallback(api_fallback)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

async fn api_fallback() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ApiError::new("not_found", "No such endpoint")),
    )
        .into_response()
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /api/v1/health
async fn get_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let connections = state.pool.connection_status().await;

    Json(HealthResponse {
        healthy: !state.pool.is_closed(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        backend: state.connector.name().to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        host_count: state.registry.host_count().await,
        connected_hosts: connections.values().filter(|c| c.connected).count(),
    })
}

/// GET /api/v1/hosts
async fn list_hosts(State(state): State<Arc<AppState>>) -> Json<HostListResponse> {
    let records = state.registry.list_hosts().await;

    let mut hosts = Vec::with_capacity(records.len());
    for host in records {
        let status = host_status(&state, &host).await;
        hosts.push(HostWithStatus { host, status });
    }

    Json(HostListResponse {
        total: hosts.len(),
        hosts,
    })
}

/// GET /api/v1/hosts/:host_id
async fn get_host(
    State(state): State<Arc<AppState>>,
    Path(host_id): Path<String>,
) -> Result<Json<HostWithStatus>, ApiFailure> {
    let host = state.registry.get_host(&host_id).await?;
    let status = host_status(&state, &host).await;
    Ok(Json(HostWithStatus { host, status }))
}

/// POST /api/v1/hosts - Register a host and try to connect
async fn create_host(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateHostRequest>,
) -> Result<(StatusCode, Json<HostWithStatus>), ApiFailure> {
    let host = state.registry.add_host(req).await?;

    connect_and_record(&state, &host).await;

    // Re-read: the connect attempt updated is_active / last_error
    let host = state.registry.get_host(&host.id).await?;
    let status = host_status(&state, &host).await;

    info!(host_id = %host.id, name = %host.name, "Host added");
    Ok((StatusCode::CREATED, Json(HostWithStatus { host, status })))
}

/// PUT /api/v1/hosts/:host_id
async fn update_host(
    State(state): State<Arc<AppState>>,
    Path(host_id): Path<String>,
    Json(req): Json<UpdateHostRequest>,
) -> Result<Json<HostWithStatus>, ApiFailure> {
    let previous = state.registry.get_host(&host_id).await?;
    let host = state.registry.update_host(&host_id, req).await?;

    if host.to_host_config() != previous.to_host_config() {
        if let Err(e) = state.pool.refresh_connection(&host_id, &host.to_host_config()).await {
            warn!(host_id = %host_id, error = %e, "Failed to refresh connection after update");
            record_status(&state, &host_id, false, Some(e.to_string())).await;
        } else {
            record_status(&state, &host_id, true, None).await;
        }
    }

    let host = state.registry.get_host(&host_id).await?;
    let status = host_status(&state, &host).await;
    Ok(Json(HostWithStatus { host, status }))
}

/// DELETE /api/v1/hosts/:host_id
async fn delete_host(
    State(state): State<Arc<AppState>>,
    Path(host_id): Path<String>,
) -> Result<StatusCode, ApiFailure> {
    // Refuse before touching the connection (only-host rule, unknown id)
    let hosts = state.registry.host_count().await;
    state.registry.get_host(&host_id).await?;
    if hosts == 1 {
        return Err(RegistryError::LastHost.into());
    }

    match state.pool.close_connection(&host_id).await {
        Ok(()) | Err(PoolError::ConnectionNotFound(_)) => {}
        Err(e) => warn!(host_id = %host_id, error = %e, "Failed to close connection for deleted host"),
    }

    state.registry.delete_host(&host_id).await?;

    info!(host_id = %host_id, "Host deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/hosts/:host_id/default
async fn set_default_host(
    State(state): State<Arc<AppState>>,
    Path(host_id): Path<String>,
) -> Result<Json<HostWithStatus>, ApiFailure> {
    state.registry.set_default(&host_id).await?;

    let host = state.registry.get_host(&host_id).await?;
    let status = host_status(&state, &host).await;
    Ok(Json(HostWithStatus { host, status }))
}

/// POST /api/v1/hosts/validate - Test a URI without registering it
async fn validate_host(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ValidateHostRequest>,
) -> Result<Json<ValidateHostResponse>, ApiFailure> {
    if req.uri.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ApiError::new("invalid_request", "uri is required")),
        ));
    }

    let timeout = if req.timeout == 0 { DEFAULT_TIMEOUT_SECS } else { req.timeout };
    let options = ConnectOptions::new(&req.uri).with_timeout(std::time::Duration::from_secs(timeout));

    let client = match state.connector.connect(&options).await {
        Ok(client) => client,
        Err(e) => {
            return Ok(Json(ValidateHostResponse {
                is_valid: false,
                message: format!("Connection failed: {}", e),
                hostname: None,
                hypervisor_version: None,
            }))
        }
    };

    let (hostname, hypervisor_version) = match client.host_status().await {
        Ok(status) => (Some(status.hostname), Some(status.hypervisor_version)),
        Err(e) => {
            warn!(uri = %req.uri, error = %e, "Validation connected but status query failed");
            (None, None)
        }
    };

    if let Err(e) = client.close().await {
        warn!(uri = %req.uri, error = %e, "Failed to close validation connection");
    }

    Ok(Json(ValidateHostResponse {
        is_valid: true,
        message: "Connection successful".to_string(),
        hostname,
        hypervisor_version,
    }))
}

/// POST /api/v1/hosts/:host_id/refresh - Force a reconnect
async fn refresh_host(
    State(state): State<Arc<AppState>>,
    Path(host_id): Path<String>,
) -> Result<Json<HostWithStatus>, ApiFailure> {
    let host = state.registry.get_host(&host_id).await?;

    if let Err(e) = state.pool.refresh_connection(&host_id, &host.to_host_config()).await {
        error!(host_id = %host_id, error = %e, "Failed to refresh connection");
        record_status(&state, &host_id, false, Some(e.to_string())).await;
        return Err(pool_failure(e));
    }
    record_status(&state, &host_id, true, None).await;

    let host = state.registry.get_host(&host_id).await?;
    let status = host_status(&state, &host).await;

    info!(host_id = %host_id, "Host connection refreshed");
    Ok(Json(HostWithStatus { host, status }))
}

/// GET /api/v1/pool/status
async fn get_pool_status(State(state): State<Arc<AppState>>) -> Json<PoolStatusResponse> {
    let mut connections: Vec<ConnectionSnapshot> = state.pool.connection_status().await.into_values().collect();
    connections.sort_by(|a, b| a.host_id.cmp(&b.host_id));

    Json(PoolStatusResponse {
        total: connections.len(),
        connected: connections.iter().filter(|c| c.connected).count(),
        connections,
    })
}

// ============================================================================
// Helpers
// ============================================================================

/// Connect to a registered host through the pool and store the outcome.
pub async fn connect_and_record(state: &AppState, host: &HostRecord) {
    match state.pool.get_connection(&host.to_host_config()).await {
        Ok(_) => record_status(state, &host.id, true, None).await,
        Err(e) => {
            warn!(host_id = %host.id, error = %e, "Failed to connect to host");
            record_status(state, &host.id, false, Some(e.to_string())).await;
        }
    }
}

async fn record_status(state: &AppState, host_id: &str, active: bool, last_error: Option<String>) {
    if let Err(e) = state.registry.update_host_status(host_id, active, last_error).await {
        warn!(host_id = %host_id, error = %e, "Failed to record host status");
    }
}

/// Merge registry state, the pool snapshot and, when connected, live host data.
async fn host_status(state: &AppState, host: &HostRecord) -> HostStatusView {
    let mut view = HostStatusView {
        host_id: host.id.clone(),
        host_name: host.name.clone(),
        last_error: host.last_error.clone(),
        last_checked: host.last_checked,
        ..Default::default()
    };

    // No pool entry (never connected, closed or evicted idle) means no live
    // connection, whatever the registry recorded last.
    let Some(snapshot) = state.pool.connection_info(&host.id).await else {
        return view;
    };

    view.connected = snapshot.connected;
    view.last_error = snapshot.last_error.clone();
    view.last_used = Some(snapshot.last_used);

    if let Some(client) = snapshot.client.filter(|_| snapshot.connected) {
        if let Ok(status) = client.host_status().await {
            view.hostname = status.hostname;
            view.hypervisor_version = status.hypervisor_version;
            view.total_vms = status.total_vms;
            view.running_vms = status.running_vms;
            view.paused_vms = status.paused_vms;
            view.shut_off_vms = status.shut_off_vms;
            view.health_checks = status.health_checks;
            view.last_checked = Some(status.checked_at);
        }
        view.resources = client.host_resources().await.ok();
    }

    view
}

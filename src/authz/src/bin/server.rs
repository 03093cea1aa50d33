//! # Verdict Authorization Server
//!
//! HTTP front end for the Verdict authorization engine. Exposes single and
//! batch decision endpoints plus health and metrics for operations.
//!
//! ## Endpoints
//!
//! - `POST /v1/authorize` - Single authorization decision
//! - `POST /v1/authorize/batch` - Batch decisions (1-100 items)
//! - `GET /health` - Health check
//! - `GET /metrics` - Prometheus metrics (served on the metrics port)
//!
//! ## Configuration
//!
//! Environment variables:
//! - `PORT` - HTTP server port (default: 8080)
//! - `METRICS_PORT` - Metrics server port (default: 9090)
//! - `RUST_LOG` - Log level (default: info)
//! - `CACHE_CAPACITY` - Tier-1 decision cache capacity (default: 10000)
//! - `CACHE_TTL_SECS` - Tier-2 cache TTL in seconds (default: 300)
//! - `BATCH_CONCURRENCY` - Concurrent evaluations per batch (default: 16)
//! - `AUDIT_QUEUE_CAPACITY` - Bounded audit queue length (default: 1024)
//! - `REGO_URL` - Policy engine base URL; adapter disabled when unset

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    serve, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::{DefaultOnResponse, TraceLayer},
};
use tracing::{error, info, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use verdict_authz::audit::{
    spawn_retention_sweep, AuditWriter, InMemoryAuditSink, DEFAULT_RETENTION_DAYS,
};
use verdict_authz::directory::{InMemoryDirectoryStore, Permission, Role, User, UserRole};
use verdict_authz::engine::{AuthzEngine, CacheConfig, EngineConfig};
use verdict_authz::policy::evaluator::{RegoConfig, RegoHttpEvaluator};
use verdict_authz::types::{AuthorizationRequest, BatchDecision, Decision};
use verdict_authz::AuthzError;

const MAX_BATCH_SIZE: usize = 100;

/// Shared application state
#[derive(Clone)]
struct AppState {
    engine: Arc<AuthzEngine>,
    start_time: std::time::Instant,
}

/// Error response body
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

/// Application error type
#[derive(Debug)]
enum AppError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
        };

        let body = Json(ErrorResponse {
            error: error.to_string(),
            message,
        });

        (status, body).into_response()
    }
}

impl From<AuthzError> for AppError {
    fn from(err: AuthzError) -> Self {
        match err {
            AuthzError::InvalidRequest(msg) => AppError::BadRequest(msg),
            AuthzError::NotFound(msg) => AppError::NotFound(msg),
            AuthzError::Conflict(msg) => AppError::Conflict(msg),
            other => {
                if other.is_client_error() {
                    AppError::BadRequest(other.to_string())
                } else {
                    AppError::Internal(other.to_string())
                }
            }
        }
    }
}

/// Batch authorization request body
#[derive(Debug, Deserialize)]
struct BatchRequest {
    requests: Vec<AuthorizationRequest>,
}

/// Health check response
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    uptime_seconds: u64,
    version: String,
}

/// Metrics response (Prometheus format)
struct MetricsResponse {
    metrics: String,
}

impl IntoResponse for MetricsResponse {
    fn into_response(self) -> Response {
        (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            self.metrics,
        )
            .into_response()
    }
}

/// POST /v1/authorize - Single authorization decision
async fn authorize(
    State(state): State<AppState>,
    Json(request): Json<AuthorizationRequest>,
) -> Result<Json<Decision>, AppError> {
    let decision = state.engine.authorize(&request).await?;
    Ok(Json(decision))
}

/// POST /v1/authorize/batch - Batch authorization
async fn authorize_batch(
    State(state): State<AppState>,
    Json(request): Json<BatchRequest>,
) -> Result<Json<BatchDecision>, AppError> {
    let size = request.requests.len();
    if size == 0 || size > MAX_BATCH_SIZE {
        return Err(AppError::BadRequest(format!(
            "batch must contain between 1 and {} requests, got {}",
            MAX_BATCH_SIZE, size
        )));
    }

    let batch = state.engine.authorize_batch(request.requests).await?;
    Ok(Json(batch))
}

/// GET /health - Health check endpoint
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime = state.start_time.elapsed().as_secs();

    Json(HealthResponse {
        status: "healthy".to_string(),
        uptime_seconds: uptime,
        version: verdict_authz::VERSION.to_string(),
    })
}

/// GET /metrics - Prometheus metrics endpoint
async fn metrics(State(state): State<AppState>) -> MetricsResponse {
    let uptime = state.start_time.elapsed().as_secs();

    let mut metrics = state.engine.export_prometheus();
    metrics.push_str(&format!(
        "# HELP authz_uptime_seconds Server uptime in seconds\n\
         # TYPE authz_uptime_seconds gauge\n\
         authz_uptime_seconds {}\n\
         \n\
         # HELP authz_version Server version info\n\
         # TYPE authz_version gauge\n\
         authz_version{{version=\"{}\"}} 1\n",
        uptime,
        verdict_authz::VERSION
    ));

    MetricsResponse { metrics }
}

/// Create the HTTP router with all endpoints
fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let trace = TraceLayer::new_for_http().on_response(DefaultOnResponse::new().level(Level::INFO));

    Router::new()
        .route("/v1/authorize", post(authorize))
        .route("/v1/authorize/batch", post(authorize_batch))
        .route("/health", get(health_check))
        .layer(ServiceBuilder::new().layer(trace).layer(cors))
        .with_state(state)
}

/// Create the metrics router
fn create_metrics_router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Seed the in-memory directory with a demo organization so the server is
/// usable out of the box. Production deployments replace the directory
/// store wholesale.
async fn seed_demo_directory() -> Arc<InMemoryDirectoryStore> {
    let directory = Arc::new(InMemoryDirectoryStore::new());

    let viewer = Role::new("demo", "viewer");
    let editor = Role::child_of(&viewer, "editor");
    let admin = Role::child_of(&editor, "admin");

    let read = Permission::allow("demo", "document.read", "document", "read");
    let write = Permission::allow("demo", "document.write", "document", "write");
    let delete = Permission::allow("demo", "document.delete", "document", "delete");

    let alice = User::new("demo", "alice@demo.local").with_email("alice@demo.local");
    let bob = User::new("demo", "bob@demo.local").with_email("bob@demo.local");

    directory.add_role(viewer.clone()).await;
    directory.add_role(editor.clone()).await;
    directory.add_role(admin.clone()).await;
    directory.add_permission(read.clone()).await;
    directory.add_permission(write.clone()).await;
    directory.add_permission(delete.clone()).await;
    directory.grant_permission(viewer.id, read.id).await;
    directory.grant_permission(editor.id, write.id).await;
    directory.grant_permission(admin.id, delete.id).await;
    directory.add_user(alice.clone()).await;
    directory.add_user(bob.clone()).await;
    directory.assign_role(UserRole::grant(alice.id, admin.id)).await;
    directory.assign_role(UserRole::grant(bob.id, viewer.id)).await;

    info!("Seeded demo organization 'demo' (users: alice@demo.local, bob@demo.local)");

    directory
}

/// Graceful shutdown handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }

    info!("Starting graceful shutdown");
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Main server entrypoint
#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Verdict Authorization Server v{}", verdict_authz::VERSION);

    // Load configuration from environment
    let port: u16 = env_parse("PORT", 8080);
    let metrics_port: u16 = env_parse("METRICS_PORT", 9090);
    let cache_capacity: usize = env_parse("CACHE_CAPACITY", 10_000);
    let cache_ttl_secs: u64 = env_parse("CACHE_TTL_SECS", 300);
    let batch_concurrency: usize = env_parse("BATCH_CONCURRENCY", 16);
    let audit_queue_capacity: usize = env_parse("AUDIT_QUEUE_CAPACITY", 1024);
    let rego_url = std::env::var("REGO_URL").ok();

    info!("Configuration:");
    info!("  Port: {}", port);
    info!("  Metrics Port: {}", metrics_port);
    info!("  Cache Capacity: {}", cache_capacity);
    info!("  Cache TTL: {}s", cache_ttl_secs);
    info!("  Batch Concurrency: {}", batch_concurrency);

    let config = EngineConfig {
        enable_cache: true,
        cache: CacheConfig {
            l1_capacity: cache_capacity,
            l2_ttl: Duration::from_secs(cache_ttl_secs),
            ..CacheConfig::default()
        },
        batch_concurrency,
        audit_queue_capacity,
        ..EngineConfig::default()
    };

    // Audit pipeline: bounded queue into an in-memory sink, swept on a
    // retention schedule
    let sink = Arc::new(InMemoryAuditSink::new());
    let audit = Arc::new(AuditWriter::spawn(sink.clone(), audit_queue_capacity));
    let _retention = spawn_retention_sweep(
        sink.clone(),
        chrono::Duration::days(DEFAULT_RETENTION_DAYS),
        Duration::from_secs(3600),
    );

    let directory = seed_demo_directory().await;
    let mut engine = AuthzEngine::new(config, directory).with_audit(audit);

    if let Some(url) = rego_url {
        info!("Policy adapter enabled: {}", url);
        let rego_config = RegoConfig {
            url,
            enabled: true,
            ..RegoConfig::default()
        };
        let evaluator = match RegoHttpEvaluator::new(rego_config) {
            Ok(e) => e,
            Err(e) => {
                error!("Failed to initialize policy adapter: {}", e);
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("Policy adapter initialization failed: {}", e),
                ));
            }
        };
        engine = engine.with_evaluator(Arc::new(evaluator));
    }

    // Create shared state
    let state = AppState {
        engine: Arc::new(engine),
        start_time: std::time::Instant::now(),
    };

    // Create HTTP router
    let app = create_router(state.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    // Create metrics router
    let metrics_app = create_metrics_router(state.clone());
    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], metrics_port));

    info!("Starting HTTP server on {}", addr);
    info!("Starting metrics server on {}", metrics_addr);

    // Create TCP listeners
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind HTTP server: {}", e);
            return Err(e);
        }
    };

    let metrics_listener = match tokio::net::TcpListener::bind(metrics_addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind metrics server: {}", e);
            return Err(e);
        }
    };

    // Start both servers concurrently
    let server = serve(listener, app.into_make_service()).with_graceful_shutdown(shutdown_signal());

    let metrics_server = serve(metrics_listener, metrics_app.into_make_service())
        .with_graceful_shutdown(shutdown_signal());

    // Run both servers
    let result = tokio::try_join!(
        async {
            server.await.map_err(|e| {
                error!("HTTP server error: {}", e);
                e
            })
        },
        async {
            metrics_server.await.map_err(|e| {
                error!("Metrics server error: {}", e);
                e
            })
        }
    );

    match result {
        Ok(_) => {
            info!("Servers shut down gracefully");
            Ok(())
        }
        Err(e) => {
            error!("Server error: {}", e);
            Err(e)
        }
    }
}

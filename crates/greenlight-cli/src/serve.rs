use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use greenlight::{
    Config, Coordinator, Error as GreenlightError, HitlRequest, McpServer, RequestRegistry,
    RequestStatus, SessionDirectory, StorageBackend, Store, TelegramAdapter, TelegramTransport,
};

// --- Request / Response types ---

#[derive(Deserialize)]
struct RegisterBody {
    #[serde(default)]
    session_id: String,
    #[serde(default)]
    client_id: String,
    #[serde(default)]
    human_address: i64,
}

#[derive(Deserialize)]
struct DeactivateBody {
    #[serde(default)]
    session_id: String,
}

#[derive(Deserialize)]
struct SubmitBody {
    #[serde(default)]
    session_id: String,
    #[serde(default)]
    client_id: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    options: Vec<String>,
    #[serde(default)]
    metadata: std::collections::HashMap<String, serde_json::Value>,
    #[serde(default)]
    timeout_seconds: Option<u64>,
}

#[derive(Serialize)]
struct SubmitResponse {
    request_id: Uuid,
    status: RequestStatus,
    created_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct PollQuery {
    #[serde(default)]
    request_id: Option<String>,
}

#[derive(Serialize)]
struct PollResponse {
    request_id: Uuid,
    status: RequestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    approved: Option<bool>,
    completed: bool,
}

#[derive(Deserialize)]
struct StatusQuery {
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Deserialize)]
struct CancelBody {
    #[serde(default)]
    request_id: String,
}

#[derive(Serialize)]
struct PendingResponse {
    count: usize,
    pending_requests: Vec<HitlRequest>,
}

// --- Axum state ---

#[derive(Clone)]
struct AppState {
    coordinator: Arc<Coordinator>,
    directory: Arc<SessionDirectory>,
    mcp: Arc<McpServer>,
    start_time: Instant,
}

// --- Error mapping ---

fn error_status(err: &GreenlightError) -> StatusCode {
    match err {
        GreenlightError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        GreenlightError::NotFound(_) => StatusCode::NOT_FOUND,
        GreenlightError::SessionInactive(_)
        | GreenlightError::Duplicate(_)
        | GreenlightError::AlreadyTerminal(_) => StatusCode::CONFLICT,
        GreenlightError::Transport(_) => StatusCode::BAD_GATEWAY,
        GreenlightError::Overloaded(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: GreenlightError) -> Response {
    (
        error_status(&err),
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}

// --- Handlers ---

async fn handle_register(
    State(state): State<AppState>,
    Json(body): Json<RegisterBody>,
) -> Response {
    if body.human_address == 0 {
        return error_response(GreenlightError::InvalidArgument(
            "human_address must not be zero".into(),
        ));
    }
    match state
        .directory
        .register(&body.session_id, &body.client_id, body.human_address)
    {
        Ok(session) => Json(serde_json::json!({
            "success": true,
            "session_id": session.session_id,
            "message": "session registered",
        }))
        .into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_deactivate(
    State(state): State<AppState>,
    Json(body): Json<DeactivateBody>,
) -> Response {
    if body.session_id.is_empty() {
        return error_response(GreenlightError::InvalidArgument(
            "session_id must not be empty".into(),
        ));
    }
    match state.directory.deactivate(&body.session_id) {
        Ok(()) => Json(serde_json::json!({
            "success": true,
            "message": "session deactivated",
        }))
        .into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Response {
    let Some(session_id) = query.session_id.filter(|s| !s.is_empty()) else {
        return error_response(GreenlightError::InvalidArgument(
            "missing session_id parameter".into(),
        ));
    };
    match state.directory.lookup(&session_id) {
        Ok(session) => Json(session).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_request(
    State(state): State<AppState>,
    Json(body): Json<SubmitBody>,
) -> Response {
    let params = greenlight::SubmitParams {
        session_id: body.session_id,
        client_id: body.client_id,
        message: body.message,
        options: body.options,
        metadata: body.metadata,
        timeout_seconds: body.timeout_seconds,
    };
    match state.coordinator.submit(params).await {
        Ok(request) => Json(SubmitResponse {
            request_id: request.id,
            status: request.status,
            created_at: request.created_at,
        })
        .into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_poll(State(state): State<AppState>, Query(query): Query<PollQuery>) -> Response {
    let Some(request_id) = query
        .request_id
        .as_deref()
        .and_then(|s| Uuid::parse_str(s).ok())
    else {
        return error_response(GreenlightError::InvalidArgument(
            "missing or invalid request_id parameter".into(),
        ));
    };
    match state.coordinator.poll(request_id) {
        Ok(request) => {
            let completed = request.status.is_terminal();
            Json(PollResponse {
                request_id: request.id,
                status: request.status,
                approved: request.response.as_ref().map(|_| request.approved),
                response: request.response,
                completed,
            })
            .into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn handle_cancel(State(state): State<AppState>, Json(body): Json<CancelBody>) -> Response {
    let Some(request_id) = Uuid::parse_str(&body.request_id).ok() else {
        return error_response(GreenlightError::InvalidArgument(
            "missing or invalid request_id".into(),
        ));
    };
    match state.coordinator.cancel(request_id) {
        Ok(()) => Json(serde_json::json!({
            "success": true,
            "message": "request canceled",
        }))
        .into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_pending(State(state): State<AppState>) -> Response {
    match state.coordinator.list_pending() {
        Ok(pending) => Json(PendingResponse {
            count: pending.len(),
            pending_requests: pending,
        })
        .into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_health(State(state): State<AppState>) -> Response {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "greenlight",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.start_time.elapsed().as_secs(),
    }))
    .into_response()
}

async fn handle_mcp(State(state): State<AppState>, body: String) -> Response {
    match state.mcp.handle_line(&body).await {
        Some(response) => Json(response).into_response(),
        // Notifications have no response body.
        None => Json(serde_json::Value::Null).into_response(),
    }
}

async fn handle_mcp_tools(State(state): State<AppState>) -> Response {
    Json(serde_json::json!({ "tools": state.mcp.tools() })).into_response()
}

async fn handle_mcp_capabilities(State(state): State<AppState>) -> Response {
    Json(serde_json::json!({
        "capabilities": state.mcp.capabilities(),
        "serverInfo": state.mcp.server_info(),
    }))
    .into_response()
}

// --- Middleware ---

/// Permissive CORS for local tooling.
async fn cors_middleware(
    request: axum::http::Request<axum::body::Body>,
    next: Next,
) -> impl IntoResponse {
    if request.method() == axum::http::Method::OPTIONS {
        return axum::http::Response::builder()
            .status(200)
            .header("Access-Control-Allow-Origin", "*")
            .header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
            .header(
                "Access-Control-Allow-Headers",
                "Content-Type, Authorization",
            )
            .body(axum::body::Body::empty())
            .unwrap_or_default()
            .into_response();
    }

    let mut response = next.run(request).await;
    if let Ok(value) = "*".parse() {
        response
            .headers_mut()
            .insert("Access-Control-Allow-Origin", value);
    }
    response
}

/// Request log line per call.
async fn log_middleware(
    request: axum::http::Request<axum::body::Body>,
    next: Next,
) -> impl IntoResponse {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let response = next.run(request).await;
    tracing::info!(%method, path, status = response.status().as_u16(), "http request");
    response
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/hitl/register", post(handle_register))
        .route("/hitl/deactivate", post(handle_deactivate))
        .route("/hitl/status", get(handle_status))
        .route("/hitl/request", post(handle_request))
        .route("/hitl/poll", get(handle_poll))
        .route("/hitl/cancel", post(handle_cancel))
        .route("/hitl/pending", get(handle_pending))
        .route("/health", get(handle_health))
        .route("/mcp", post(handle_mcp))
        .route("/mcp/tools", get(handle_mcp_tools))
        .route("/mcp/capabilities", get(handle_mcp_capabilities))
        .with_state(state)
        .layer(middleware::from_fn(cors_middleware))
        .layer(middleware::from_fn(log_middleware))
}

// --- Bootstrap ---

pub(crate) fn build_store(config: &Config) -> Result<Arc<dyn Store>> {
    match &config.storage {
        StorageBackend::InMemory => {
            tracing::info!("store: in-memory (pending requests lost on restart)");
            Ok(Arc::new(greenlight::InMemoryStore::new()))
        }
        #[cfg(feature = "postgres")]
        StorageBackend::Postgres { dsn } => {
            let store = tokio::task::block_in_place(|| {
                tokio::runtime::Handle::current().block_on(async {
                    let store = greenlight::PostgresStore::connect(dsn).await?;
                    store.run_migration().await?;
                    Ok::<_, GreenlightError>(store)
                })
            })
            .context("failed to initialize PostgreSQL store")?;
            tracing::info!("store: PostgreSQL");
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "postgres"))]
        StorageBackend::Postgres { .. } => {
            anyhow::bail!("built without the 'postgres' feature; STORAGE_ADAPTER=postgres unavailable")
        }
    }
}

pub async fn run(config: Config) -> Result<()> {
    let store = build_store(&config)?;
    let directory = Arc::new(SessionDirectory::new(store.clone()));
    let registry = Arc::new(RequestRegistry::new(store));

    let bot = teloxide::Bot::new(&config.telegram_bot_token);
    let transport = Arc::new(TelegramTransport::new(bot.clone()));

    let coordinator = Arc::new(Coordinator::new(
        directory.clone(),
        registry,
        transport.clone(),
        config.request_timeout_seconds,
        config.max_concurrent_requests,
    ));

    // With a durable store, pending requests submitted before a restart must
    // still expire on their original deadline.
    coordinator
        .restore_pending_timeouts()
        .context("failed to restore pending timeouts")?;

    let cancel = CancellationToken::new();

    // Signal handler drives the graceful shutdown.
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGINT handler");
                return;
            }
        };
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = sigint.recv() => tracing::info!("SIGINT received"),
            _ = sigterm.recv() => tracing::info!("SIGTERM received"),
        }
        signal_cancel.cancel();
    });

    // Timeout scheduler.
    tokio::spawn(coordinator.timeout_scheduler().run(cancel.clone()));

    // Telegram long-poll adapter.
    let adapter = Arc::new(TelegramAdapter::new(
        bot,
        transport,
        coordinator.clone(),
        directory.clone(),
    ));
    tokio::spawn(adapter.run());
    tracing::info!("telegram bot started");

    let mcp = Arc::new(McpServer::new(coordinator.clone()));

    let state = AppState {
        coordinator,
        directory,
        mcp,
        start_time: Instant::now(),
    };
    let app = router(state);

    let bind = format!("0.0.0.0:{}", config.server_port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind to {bind}"))?;
    tracing::info!(bind = %bind, "HTTP server started");

    let http_cancel = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            http_cancel.cancelled().await;
        })
        .await
        .context("HTTP server error")?;

    tracing::info!("server exited");
    Ok(())
}

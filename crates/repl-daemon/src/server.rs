use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use repl_kernel::error::KernelError;
use repl_kernel::protocol::ExecutionRecord;
use repl_kernel::session::InstallResult;
use repl_kernel::{KernelConfig, SandboxManager};
use serde::{Deserialize, Serialize};
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Clone)]
struct AppState {
    manager: Arc<SandboxManager>,
}

/// Builds the kernel, wires the router, and serves it until a shutdown
/// signal (Ctrl+C or SIGTERM) arrives, then stops the periodic sweep before
/// returning.
pub async fn run(listen_addr: SocketAddr) -> anyhow::Result<()> {
    let config = KernelConfig::from_env();
    let manager = Arc::new(SandboxManager::start(config).await);
    let state = AppState {
        manager: manager.clone(),
    };

    let app = build_router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    info!(addr = %listen_addr, "repl-daemon listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    manager.stop_sweeping();
    info!("repl-daemon stopped");
    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sandboxes", get(list_sandboxes).post(create_sandbox))
        .route("/sandboxes/:id", axum::routing::delete(close_sandbox))
        .route("/sandboxes/:id/execute", post(execute))
        .route("/sandboxes/:id/install", post(install))
        .route("/sandboxes/:id/upload", post(upload))
        .route("/sandboxes/:id/files", get(list_files))
        .route("/sandboxes/:id/download", get(download))
        .with_state(state)
}

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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy" })
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn create_sandbox(State(state): State<AppState>) -> Result<Json<CreateResponse>, ApiError> {
    let sandbox_id = state.manager.create().await?;
    Ok(Json(CreateResponse { sandbox_id }))
}

#[derive(Serialize)]
struct CreateResponse {
    sandbox_id: Uuid,
}

async fn list_sandboxes(State(state): State<AppState>) -> Json<BTreeMap<Uuid, SandboxInfo>> {
    let entries = state
        .manager
        .list_sandboxes()
        .into_iter()
        .map(|summary| (summary.id, SandboxInfo { created_at: summary.created_at }))
        .collect();
    Json(entries)
}

#[derive(Serialize)]
struct SandboxInfo {
    created_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct ExecuteBody {
    code: String,
}

async fn execute(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<ExecuteBody>,
) -> Result<Json<ExecutionRecord>, ApiError> {
    let record = state.manager.execute(id, &body.code).await?;
    Ok(Json(record))
}

#[derive(Deserialize)]
struct InstallBody {
    package_name: String,
}

async fn install(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<InstallBody>,
) -> Result<Json<InstallResult>, ApiError> {
    let result = state.manager.install(id, &body.package_name).await?;
    Ok(Json(result))
}

#[derive(Serialize)]
struct UploadResponse {
    file_path: String,
}

async fn upload(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let mut rel_path: Option<String> = None;
    let mut file_bytes: Option<Vec<u8>> = None;
    let mut original_filename: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(e.to_string()))?
    {
        match field.name() {
            Some("file_path") => {
                rel_path = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ApiError::bad_request(e.to_string()))?,
                );
            }
            Some("file") | None => {
                original_filename = field.file_name().map(str::to_string);
                file_bytes = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| ApiError::bad_request(e.to_string()))?
                        .to_vec(),
                );
            }
            _ => {}
        }
    }

    let bytes = file_bytes.ok_or_else(|| ApiError::bad_request("missing file part"))?;
    let path = state
        .manager
        .upload(id, rel_path.as_deref(), original_filename.as_deref(), &bytes)
        .await?;

    Ok(Json(UploadResponse {
        file_path: path.to_string_lossy().into_owned(),
    }))
}

async fn list_files(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<repl_kernel::fs_gateway::FileEntry>>, ApiError> {
    let entries = state.manager.list_files(id).await?;
    Ok(Json(entries))
}

#[derive(Deserialize)]
struct DownloadQuery {
    file_path: String,
}

async fn download(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, ApiError> {
    let resolved = state.manager.resolve_download(id, &query.file_path).await?;
    let bytes = tokio::fs::read(&resolved)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;

    let filename = resolved
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());

    Ok((
        [(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{filename}\""),
        )],
        bytes,
    )
        .into_response())
}

#[derive(Serialize)]
struct CloseResponse {
    status: &'static str,
    message: String,
}

async fn close_sandbox(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<CloseResponse>, ApiError> {
    state.manager.close(id).await?;
    Ok(Json(CloseResponse {
        status: "closed",
        message: format!("sandbox {id} closed"),
    }))
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl From<KernelError> for ApiError {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::Unknown(id) => {
                ApiError::new(StatusCode::NOT_FOUND, format!("sandbox {id} not found"))
            }
            KernelError::Closed(id) => {
                ApiError::new(StatusCode::NOT_FOUND, format!("sandbox {id} is closed"))
            }
            KernelError::AccessDenied(path) => ApiError::new(
                StatusCode::FORBIDDEN,
                format!("path '{}' escapes the sandbox working directory", path.display()),
            ),
            KernelError::NotFound(path) => {
                ApiError::new(StatusCode::NOT_FOUND, format!("path '{}' does not exist", path.display()))
            }
            KernelError::Provisioning(e) => ApiError::internal(e.to_string()),
            KernelError::SessionStart(id, e) => {
                ApiError::internal(format!("sandbox {id} failed to start: {e}"))
            }
            KernelError::ExecuteInternal(id, e) => {
                ApiError::internal(format!("execution pump failed for sandbox {id}: {e}"))
            }
            KernelError::Io(path, e) => ApiError::internal(format!("{}: {e}", path.display())),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!(status = %self.status, message = %self.message, "api error");
        (self.status, Json(ErrorBody { error: self.message })).into_response()
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

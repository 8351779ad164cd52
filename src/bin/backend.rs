#![forbid(unsafe_code)]

//! Axum backend that turns client timelines into published videos.
//!
//! Identity comes from a trusted header set by the gateway in front of this
//! service; requests without it never reach the export pipeline.

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{
        FromRequestParts, OptionalFromRequestParts, Path as AxumPath, State,
        rejection::JsonRejection,
    },
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::Parser;
use cliptube::config::{RuntimeConfig, RuntimeOverrides, StorageBackend, resolve_runtime_config};
use cliptube::error::ExportError;
use cliptube::export::{ExportRequest, ExportService};
use cliptube::metadata::MetadataStore;
use cliptube::publish::{PublishedVideo, Visibility};
use cliptube::security::ensure_not_root;
use cliptube::storage::{LocalStorage, ObjectStorage, S3Storage};
use serde::Serialize;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Prefix for playback URLs when no CDN is configured.
const MEDIA_URL_PREFIX: &str = "/media";

#[derive(Debug, Clone, Parser)]
#[command(name = "backend", about = "Serve the cliptube export API")]
struct BackendArgs {
    /// Directory holding metadata.db (and local storage by default).
    #[arg(long)]
    media_root: Option<PathBuf>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// `local` or `s3`.
    #[arg(long)]
    storage_backend: Option<String>,
    #[arg(long)]
    storage_root: Option<PathBuf>,
    #[arg(long)]
    bucket: Option<String>,
    /// Alternate `.env` file.
    #[arg(long)]
    env_file: Option<PathBuf>,
}

impl BackendArgs {
    fn overrides(&self) -> RuntimeOverrides {
        RuntimeOverrides {
            media_root: self.media_root.clone(),
            host: self.host.clone(),
            port: self.port,
            storage_backend: self.storage_backend.clone(),
            storage_root: self.storage_root.clone(),
            bucket: self.bucket.clone(),
            env_path: self.env_file.clone(),
        }
    }
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/CLIPTUBE_HOST")
}

/// Shared state injected into every handler.
#[derive(Clone)]
struct AppState {
    exports: ExportService,
    store: Arc<MetadataStore>,
    identity_header: Arc<str>,
    cdn_base_url: Option<Arc<str>>,
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

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "authentication required")
    }

    fn internal() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
    }
}

impl From<ExportError> for ApiError {
    /// Client errors keep their message. Infrastructure errors are already
    /// logged by the export service and only reported generically here.
    fn from(err: ExportError) -> Self {
        match err {
            ExportError::Validation(message) => Self::new(StatusCode::BAD_REQUEST, message),
            err @ ExportError::UnknownSource(_) => Self::not_found(err.to_string()),
            err @ ExportError::MissingStorageKey(_) => {
                Self::new(StatusCode::UNPROCESSABLE_ENTITY, err.to_string())
            }
            ExportError::Timeout(_) => Self::new(StatusCode::GATEWAY_TIMEOUT, "export timed out"),
            _ => Self::new(StatusCode::INTERNAL_SERVER_ERROR, "export failed"),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(rejection.status(), rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Caller id attached by the upstream auth gate.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CallerIdentity(String);

impl CallerIdentity {
    fn from_parts(parts: &Parts, state: &AppState) -> Option<Self> {
        parts
            .headers
            .get(&*state.identity_header)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| Self(value.to_string()))
    }
}

impl FromRequestParts<AppState> for CallerIdentity {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        Self::from_parts(parts, state).ok_or_else(ApiError::unauthorized)
    }
}

/// Anonymous readers are allowed where the handler takes `Option<CallerIdentity>`.
impl OptionalFromRequestParts<AppState> for CallerIdentity {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Option<Self>, Self::Rejection> {
        Ok(Self::from_parts(parts, state))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExportResponse {
    id: String,
    timeline_name: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VideoResponse {
    #[serde(flatten)]
    video: PublishedVideo,
    url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    thumbnail_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = BackendArgs::parse();
    let config = resolve_runtime_config(args.overrides())?;
    let host = parse_host_arg(&config.host)?;

    ensure_not_root("backend")?;

    let store = Arc::new(
        MetadataStore::open(&config.metadata_path())
            .await
            .context("initializing metadata store")?,
    );
    let storage = connect_storage(&config).await;
    if config.storage.bucket.is_none() {
        warn!("STORAGE_BUCKET is not set; exports will fail until it is configured");
    }

    let exports = ExportService::new(
        config.export_config(),
        store.clone(),
        storage,
        Arc::new(config.process_runner()),
        store.clone(),
    );
    let state = AppState {
        exports,
        store,
        identity_header: Arc::from(config.identity_header.as_str()),
        cdn_base_url: config.cdn_base_url.as_deref().map(Arc::from),
    };

    let addr = SocketAddr::new(host, config.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!(%addr, "API server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/exports", post(create_export))
        .route("/api/videos/{id}", get(get_video))
        .fallback(|| async { ApiError::not_found("endpoint not found") })
        .with_state(state)
}

async fn connect_storage(config: &RuntimeConfig) -> Arc<dyn ObjectStorage> {
    match config.storage.backend {
        StorageBackend::Local => {
            info!(root = %config.storage.root.display(), "using local object storage");
            Arc::new(LocalStorage::new(config.storage.root.clone()))
        }
        StorageBackend::S3 => {
            info!(
                endpoint = config.storage.endpoint_url.as_deref().unwrap_or("aws"),
                "using S3 object storage"
            );
            Arc::new(
                S3Storage::connect(
                    config.storage.region.clone(),
                    config.storage.endpoint_url.clone(),
                )
                .await,
            )
        }
    }
}

async fn shutdown_signal() {
    // Only affects graceful shutdown; the process still exits on Ctrl+C.
    if let Err(err) = signal::ctrl_c().await {
        error!(error = %err, "failed to install Ctrl+C handler");
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn create_export(
    State(state): State<AppState>,
    CallerIdentity(owner_id): CallerIdentity,
    payload: Result<Json<ExportRequest>, JsonRejection>,
) -> ApiResult<Json<ExportResponse>> {
    let Json(payload) = payload?;
    let outcome = state.exports.export(&owner_id, &payload).await?;
    Ok(Json(ExportResponse {
        id: outcome.video_id,
        timeline_name: outcome.timeline_name,
    }))
}

async fn get_video(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    caller: Option<CallerIdentity>,
) -> ApiResult<Json<VideoResponse>> {
    let video = state
        .store
        .get_video(&id)
        .await
        .map_err(|err| {
            error!(video_id = %id, error = %err, "metadata lookup failed");
            ApiError::internal()
        })?
        .ok_or_else(|| ApiError::not_found("video not found"))?;

    // Private records are indistinguishable from missing ones to anyone but the owner.
    let is_owner = caller.is_some_and(|CallerIdentity(caller_id)| caller_id == video.owner_id);
    if video.visibility == Visibility::Private && !is_owner {
        return Err(ApiError::not_found("video not found"));
    }

    let cdn = state.cdn_base_url.as_deref();
    Ok(Json(VideoResponse {
        url: media_url(cdn, &video.storage_key),
        thumbnail_url: video.thumbnail_key.as_deref().map(|key| media_url(cdn, key)),
        video,
    }))
}

/// Public URL for a stored object.
fn media_url(cdn_base_url: Option<&str>, key: &str) -> String {
    let base = cdn_base_url.unwrap_or(MEDIA_URL_PREFIX);
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        key.trim_start_matches('/')
    )
}

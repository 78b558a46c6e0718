#![forbid(unsafe_code)]

//! Axum gateway in front of the download orchestrator.
//!
//! Requests are validated here and handed to the library; the gateway itself
//! keeps no state beyond what `AppState` points at. Progress reaches browsers
//! over `/ws`, where every connection subscribes to the shared notifier.

use std::{
    fs,
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, anyhow};
use axum::{
    Json, Router,
    body::Body,
    extract::{
        Path as AxumPath, Query, State,
        rejection::JsonRejection,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use futures::{SinkExt, StreamExt};
use mime_guess::MimeGuess;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::{fs::File, signal, sync::mpsc};
use tokio_util::io::ReaderStream;
use tracing_subscriber::EnvFilter;
use tubegrab::config::{RuntimeOverrides, resolve_runtime_settings};
use tubegrab::download::{DownloadOrchestrator, ProgressSink};
use tubegrab::error::{FetchError, FieldViolation, ValidationError};
use tubegrab::metadata::lookup_or_fetch;
use tubegrab::models::{DownloadStatus, DownloadSummary, ProgressEvent, VideoInfo};
use tubegrab::notifier::{Notifier, SUBSCRIBER_BUFFER};
use tubegrab::security::ensure_not_root;
use tubegrab::store::JobStore;
use tubegrab::validators::{is_valid_video_url, validate_download_request};
use tubegrab::ytdlp::YtDlp;

#[derive(Debug, Clone)]
struct BackendArgs {
    download_dir: PathBuf,
    yt_dlp: PathBuf,
    listen_host: IpAddr,
    tubegrab_port: u16,
    history_limit: usize,
}

impl BackendArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(std::env::args().skip(1))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut download_dir_override: Option<PathBuf> = None;
        let mut yt_dlp_override: Option<PathBuf> = None;
        let mut port_override: Option<u16> = None;
        let mut host_override: Option<IpAddr> = None;
        let mut args = iter.into_iter();
        while let Some(arg) = args.next() {
            if let Some(value) = arg.strip_prefix("--download-dir=") {
                download_dir_override = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--yt-dlp=") {
                yt_dlp_override = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--port=") {
                port_override = Some(parse_port_arg(value)?);
                continue;
            }
            if let Some(value) = arg.strip_prefix("--host=") {
                host_override = Some(parse_host_arg(value)?);
                continue;
            }

            match arg.as_str() {
                "--download-dir" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--download-dir requires a value"))?;
                    download_dir_override = Some(PathBuf::from(value));
                }
                "--yt-dlp" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--yt-dlp requires a value"))?;
                    yt_dlp_override = Some(PathBuf::from(value));
                }
                "--port" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--port requires a value"))?;
                    port_override = Some(parse_port_arg(&value)?);
                }
                "--host" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--host requires a value"))?;
                    host_override = Some(parse_host_arg(&value)?);
                }
                _ => return Err(anyhow!("unknown argument: {arg}")),
            }
        }

        let settings = resolve_runtime_settings(RuntimeOverrides {
            download_dir: download_dir_override,
            yt_dlp_path: yt_dlp_override,
            tubegrab_port: port_override,
            ..RuntimeOverrides::default()
        })?;
        let listen_host = match host_override {
            Some(host) => host,
            None => parse_host_arg(&settings.tubegrab_host)?,
        };

        Ok(Self {
            download_dir: settings.download_dir,
            yt_dlp: settings.yt_dlp_path,
            listen_host,
            tubegrab_port: settings.tubegrab_port,
            history_limit: settings.history_limit,
        })
    }
}

fn parse_port_arg(value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .context("expected a numeric port between 0 and 65535")
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .trim()
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/TUBEGRAB_HOST")
}

/// Shared state injected into every handler. The store and metadata fetcher
/// are reached through the orchestrator, which owns them.
#[derive(Clone)]
struct AppState {
    orchestrator: DownloadOrchestrator,
    notifier: Arc<Notifier>,
    history_limit: usize,
}

impl AppState {
    fn progress_sink(&self) -> Arc<dyn ProgressSink> {
        self.notifier.clone()
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
    errors: Vec<FieldViolation>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            errors: Vec::new(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: err.to_string(),
            errors: err.violations,
        }
    }
}

impl From<FetchError> for ApiError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::InvalidUrl => Self::bad_request(err.to_string()),
            other => {
                tracing::warn!("metadata lookup failed: {other}");
                Self::internal(other.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = if self.errors.is_empty() {
            json!({ "message": self.message })
        } else {
            json!({ "message": self.message, "errors": self.errors })
        };
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DownloadAccepted {
    id: u64,
    status: DownloadStatus,
    progress: u8,
}

#[derive(Deserialize)]
struct InfoQuery {
    url: Option<String>,
}

#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let BackendArgs {
        download_dir,
        yt_dlp,
        listen_host,
        tubegrab_port,
        history_limit,
    } = BackendArgs::parse()?;

    ensure_not_root("backend")?;

    fs::create_dir_all(&download_dir)
        .with_context(|| format!("creating download directory {}", download_dir.display()))?;
    let download_dir = fs::canonicalize(&download_dir)
        .with_context(|| format!("resolving download directory {}", download_dir.display()))?;

    let orchestrator = DownloadOrchestrator::new(
        Arc::new(JobStore::new()),
        YtDlp::new(yt_dlp),
        download_dir.clone(),
    );
    let state = AppState {
        orchestrator,
        notifier: Arc::new(Notifier::new()),
        history_limit,
    };

    let addr = SocketAddr::new(listen_host, tubegrab_port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    tracing::info!(%addr, download_dir = %download_dir.display(), "API server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/video/info", get(video_info))
        .route("/api/video/download", post(start_download))
        .route("/api/download/{id}/progress", get(download_progress))
        .route(
            "/api/downloads/history",
            get(download_history).delete(clear_history),
        )
        .route("/api/downloads/{id}", delete(delete_download))
        .route("/api/files/serve/{id}", get(serve_file))
        .route("/ws", get(websocket))
        .fallback(endpoint_not_found)
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        tracing::error!("failed to install Ctrl+C handler: {err}");
    }
    tracing::info!("shutting down");
}

async fn endpoint_not_found() -> ApiError {
    ApiError::not_found("Endpoint not found")
}

async fn video_info(
    State(state): State<AppState>,
    Query(query): Query<InfoQuery>,
) -> ApiResult<Json<VideoInfo>> {
    let url = query
        .url
        .map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty())
        .ok_or_else(|| ApiError::bad_request("URL is required"))?;
    if !is_valid_video_url(&url) {
        return Err(ApiError::bad_request("Invalid YouTube URL"));
    }

    let video = lookup_or_fetch(
        state.orchestrator.store(),
        state.orchestrator.fetcher(),
        &url,
    )
    .await?;
    Ok(Json(video.info()))
}

async fn start_download(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult<Json<DownloadAccepted>> {
    let Json(body) = payload.map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;
    let request = validate_download_request(&body)?;

    let (download, _job) = state
        .orchestrator
        .submit(&request, state.progress_sink())
        .await?;
    Ok(Json(DownloadAccepted {
        id: download.id,
        status: download.status,
        progress: download.progress,
    }))
}

async fn download_progress(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<ProgressEvent>> {
    let id = parse_download_id(&id)?;
    let download = state
        .orchestrator
        .store()
        .get_download(id)
        .ok_or_else(|| ApiError::not_found("Download not found"))?;
    Ok(Json(ProgressEvent::snapshot(&download)))
}

async fn download_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Vec<DownloadSummary>>> {
    let limit = query
        .limit
        .filter(|limit| *limit > 0)
        .unwrap_or(state.history_limit);
    let history = state.orchestrator.store().get_download_history(limit);
    Ok(Json(history.iter().map(DownloadSummary::from).collect()))
}

async fn clear_history(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    state.orchestrator.clear_history();
    Ok(Json(json!({ "message": "Download history cleared" })))
}

async fn delete_download(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<Value>> {
    let id = parse_download_id(&id)?;
    state
        .orchestrator
        .remove_download(id)
        .await
        .ok_or_else(|| ApiError::not_found("Download not found"))?;
    Ok(Json(json!({ "message": "Download deleted successfully" })))
}

async fn serve_file(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Response> {
    let id = parse_download_id(&id)?;
    let download = state
        .orchestrator
        .store()
        .get_download(id)
        .ok_or_else(|| ApiError::not_found("Download not found"))?;
    let recorded = match (&download.status, &download.file_path) {
        (DownloadStatus::Completed, Some(path)) => path,
        _ => return Err(ApiError::not_found("File not available")),
    };
    let path = state
        .orchestrator
        .resolve_file(recorded)
        .ok_or_else(|| ApiError::not_found("File not found"))?;
    stream_attachment(&path).await
}

async fn stream_attachment(path: &Path) -> ApiResult<Response> {
    let file = File::open(path)
        .await
        .map_err(|_| ApiError::not_found("File not found"))?;
    let metadata = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found("File not found"))?;
    if !metadata.is_file() {
        return Err(ApiError::not_found("File not found"));
    }

    let mime = MimeGuess::from_path(path).first_or_octet_stream();
    let disposition = format!("attachment; filename=\"{}\"", attachment_name(path));

    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(metadata.len()));
    if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&disposition)
            .map_err(|_| ApiError::internal("invalid attachment name"))?,
    );
    Ok(response)
}

/// File name safe for a quoted `Content-Disposition` parameter.
fn attachment_name(path: &Path) -> String {
    let name: String = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
        .chars()
        .map(|ch| match ch {
            '"' | '\\' => '_',
            ch if ch.is_ascii_graphic() || ch == ' ' => ch,
            _ => '_',
        })
        .collect();
    if name.trim().is_empty() {
        "download".to_string()
    } else {
        name
    }
}

fn parse_download_id(value: &str) -> ApiResult<u64> {
    value
        .parse::<u64>()
        .map_err(|_| ApiError::not_found("Download not found"))
}

async fn websocket(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| forward_progress(socket, state.notifier))
}

/// Pumps broadcast messages into one socket until either side goes away.
async fn forward_progress(socket: WebSocket, notifier: Arc<Notifier>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Arc<str>>(SUBSCRIBER_BUFFER);
    let subscriber = notifier.subscribe(tx);

    let mut outbound = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sender.send(Message::Text(message.to_string().into())).await.is_err() {
                break;
            }
        }
    });
    // Inbound frames are only drained so close frames and dead peers are noticed.
    let mut inbound = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            if matches!(message, Message::Close(_)) {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut outbound => inbound.abort(),
        _ = &mut inbound => outbound.abort(),
    }
    notifier.unsubscribe(subscriber);
}

#![forbid(unsafe_code)]

//! Axum server that exposes one directory of downloaded media to a browser:
//! a JSON listing, file streaming with range support, multi-file upload and
//! switching the served directory at runtime.

use std::{
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Body,
    extract::{
        DefaultBodyLimit, Multipart, Path as AxumPath, State,
        multipart::{Field, MultipartRejection},
        rejection::JsonRejection,
    },
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::Parser;
use mediadrop_tools::{
    catalog::Catalog,
    config::{RuntimeOverrides, resolve_runtime_settings},
    logging,
    security::{ensure_not_root, safe_relative_path, upload_file_name},
};
use mime_guess::MimeGuess;
use serde::{Deserialize, Serialize};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    signal,
};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

const UPLOAD_FIELD: &str = "files[]";
const PDFJS_SUBDIR: &str = "static/pdfjs";

#[derive(Parser, Debug)]
#[command(version, about = "Serve a media directory over HTTP")]
struct ServerArgs {
    /// Directory served at startup and restored by an empty /setdir
    /// (defaults to DOWNLOAD_FOLDER).
    #[arg(long)]
    dir: Option<PathBuf>,
    /// Where index.html and static/pdfjs live.
    #[arg(long)]
    www_root: Option<PathBuf>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    env_file: Option<PathBuf>,
}

impl ServerArgs {
    fn overrides(&self) -> RuntimeOverrides {
        RuntimeOverrides {
            download_dir: self.dir.clone(),
            www_root: self.www_root.clone(),
            server_port: self.port,
            server_host: self.host.clone(),
            env_path: self.env_file.clone(),
        }
    }
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .trim()
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/MEDIADROP_HOST")
}

#[derive(Clone)]
struct AppState {
    catalog: Arc<Catalog>,
    www_root: Arc<PathBuf>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    /// 400 with the given message.
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    /// 404; also used for names that escape the served directory.
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    /// 500 for I/O and task failures.
    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Serialize)]
struct UploadResponse {
    uploaded: usize,
}

#[derive(Deserialize)]
struct SetDirRequest {
    path: Option<PathBuf>,
}

#[derive(Serialize)]
struct SetDirResponse {
    success: bool,
    path: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = ServerArgs::parse();
    logging::init("info");
    ensure_not_root("file_server")?;

    let settings = resolve_runtime_settings(args.overrides())?;
    let host = parse_host_arg(&settings.server_host)?;

    std::fs::create_dir_all(&settings.download_dir)
        .with_context(|| format!("creating {}", settings.download_dir.display()))?;
    let catalog = Catalog::new(&settings.download_dir)
        .with_context(|| format!("opening {}", settings.download_dir.display()))?;
    info!(dir = %catalog.active_dir().display(), www_root = %settings.www_root.display(), "serving");

    let state = AppState {
        catalog: Arc::new(catalog),
        www_root: Arc::new(settings.www_root),
    };

    let addr = SocketAddr::new(host, settings.server_port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!("file server listening on http://{addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running file server")?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/list", get(list_files))
        .route("/file/{*name}", get(serve_file))
        .route("/upload", post(upload_files))
        .route("/setdir", post(set_directory))
        .route("/static/pdfjs/{*file}", get(serve_pdfjs))
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        warn!(error = %err, "failed to install Ctrl+C handler");
    }
}

async fn index(State(state): State<AppState>) -> ApiResult<Response> {
    stream_file(state.www_root.join("index.html"), None).await
}

/// Runs a catalog call that touches the disk on the blocking pool.
async fn with_catalog<T, F>(state: &AppState, work: F) -> ApiResult<T>
where
    F: FnOnce(&Catalog) -> T + Send + 'static,
    T: Send + 'static,
{
    let catalog = Arc::clone(&state.catalog);
    tokio::task::spawn_blocking(move || work(&catalog))
        .await
        .map_err(|err| ApiError::internal(err.to_string()))
}

async fn list_files(State(state): State<AppState>) -> ApiResult<Response> {
    let entries = with_catalog(&state, |catalog| catalog.list())
        .await?
        .map_err(|err| ApiError::internal(format!("listing failed: {err}")))?;
    let body = serde_json::to_vec(entries.as_slice())
        .map_err(|err| ApiError::internal(format!("encoding listing: {err}")))?;
    Ok((
        [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
        body,
    )
        .into_response())
}

async fn serve_file(
    State(state): State<AppState>,
    AxumPath(name): AxumPath<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let path = with_catalog(&state, move |catalog| catalog.resolve_file(&name))
        .await?
        .ok_or_else(|| ApiError::not_found("file not found"))?;
    stream_file(path, Some(&headers)).await
}

async fn serve_pdfjs(
    State(state): State<AppState>,
    AxumPath(file): AxumPath<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let relative = safe_relative_path(&file).ok_or_else(|| ApiError::not_found("file not found"))?;
    stream_file(state.www_root.join(PDFJS_SUBDIR).join(relative), Some(&headers)).await
}

async fn upload_files(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<Json<UploadResponse>> {
    let mut multipart = multipart.map_err(|err| ApiError::bad_request(err.body_text()))?;
    let dir = state.catalog.active_dir();
    let received = receive_uploads(&dir, &mut multipart).await;
    // Parts written before a failure are on disk too.
    state.catalog.invalidate();

    let (saw_field, uploaded) = received?;
    if !saw_field {
        return Err(ApiError::bad_request("No files[] field"));
    }
    info!(uploaded, dir = %dir.display(), "upload finished");
    Ok(Json(UploadResponse { uploaded }))
}

/// Returns whether any `files[]` part was present and how many were saved.
async fn receive_uploads(dir: &Path, multipart: &mut Multipart) -> ApiResult<(bool, usize)> {
    let mut saw_field = false;
    let mut uploaded = 0;
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::bad_request(format!("multipart read failed: {err}")))?
    {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        saw_field = true;
        let Some(name) = field.file_name().and_then(upload_file_name) else {
            debug!(raw = ?field.file_name(), "skipping upload with unusable name");
            continue;
        };
        let bytes = write_field(&mut field, dir, &name).await?;
        debug!(name = %name, bytes, "stored upload");
        uploaded += 1;
    }
    Ok((saw_field, uploaded))
}

/// Stores one part as `dir/name`. The bytes land in a hidden staging file
/// first and only replace `name` once the part has been read completely, so an
/// aborted upload leaves an existing file untouched and adds nothing new.
async fn write_field(field: &mut Field<'_>, dir: &Path, name: &str) -> ApiResult<u64> {
    let staging = dir.join(staging_name(name));
    let dest = dir.join(name);
    let staged = match stage_field(field, &staging).await {
        Ok(bytes) => tokio::fs::rename(&staging, &dest)
            .await
            .map(|()| bytes)
            .map_err(|err| ApiError::internal(format!("storing {}: {err}", dest.display()))),
        Err(err) => Err(err),
    };
    if staged.is_err()
        && let Err(err) = tokio::fs::remove_file(&staging).await
        && err.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %staging.display(), error = %err, "could not remove staging file");
    }
    staged
}

/// Dot-prefixed so listings skip it; unique per part so concurrent uploads of
/// one name never share a file.
fn staging_name(name: &str) -> String {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    let seq = NEXT.fetch_add(1, Ordering::Relaxed);
    format!(".{name}.{}-{seq}.part", std::process::id())
}

async fn stage_field(field: &mut Field<'_>, dest: &Path) -> ApiResult<u64> {
    let mut out = File::create(dest)
        .await
        .map_err(|err| ApiError::internal(format!("creating {}: {err}", dest.display())))?;
    let mut bytes: u64 = 0;
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|err| ApiError::bad_request(format!("multipart chunk read failed: {err}")))?
    {
        out.write_all(&chunk)
            .await
            .map_err(|err| ApiError::internal(format!("writing {}: {err}", dest.display())))?;
        bytes = bytes.saturating_add(chunk.len() as u64);
    }
    out.flush()
        .await
        .map_err(|err| ApiError::internal(format!("writing {}: {err}", dest.display())))?;
    Ok(bytes)
}

async fn set_directory(
    State(state): State<AppState>,
    payload: Result<Json<SetDirRequest>, JsonRejection>,
) -> ApiResult<Json<SetDirResponse>> {
    let Json(request) = payload.map_err(|err| ApiError::bad_request(err.body_text()))?;
    let target = request
        .path
        .unwrap_or_else(|| state.catalog.default_dir().to_path_buf());
    let dir = with_catalog(&state, move |catalog| catalog.set_dir(&target))
        .await?
        .map_err(|err| {
            debug!(error = %err, "rejected directory switch");
            ApiError::bad_request("invalid path")
        })?;
    Ok(Json(SetDirResponse {
        success: true,
        path: dir.display().to_string(),
    }))
}

fn header_value(value: String) -> ApiResult<HeaderValue> {
    HeaderValue::try_from(value).map_err(|err| ApiError::internal(err.to_string()))
}

/// Streams a regular file, honouring a single `Range` request when `headers`
/// carries one.
async fn stream_file(path: PathBuf, headers: Option<&HeaderMap>) -> ApiResult<Response> {
    let mut file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let metadata = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    if !metadata.is_file() {
        return Err(ApiError::not_found("file not found"));
    }
    let size = metadata.len();

    let range = headers
        .and_then(|headers| headers.get(header::RANGE))
        .and_then(|value| parse_range(value, size));

    let mut response = match range {
        Some((start, _)) if start >= size => {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
            response
                .headers_mut()
                .insert(header::CONTENT_RANGE, header_value(format!("bytes */{size}"))?);
            return Ok(response);
        }
        Some((start, end)) => {
            let end = end.min(size - 1);
            let length = end - start + 1;
            file.seek(std::io::SeekFrom::Start(start))
                .await
                .map_err(|err| ApiError::internal(err.to_string()))?;
            let mut response = Body::from_stream(ReaderStream::new(file.take(length))).into_response();
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
            let headers = response.headers_mut();
            headers.insert(
                header::CONTENT_RANGE,
                header_value(format!("bytes {start}-{end}/{size}"))?,
            );
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
            response
        }
        None => {
            let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, HeaderValue::from(size));
            response
        }
    };

    let headers = response.headers_mut();
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Some(mime) = MimeGuess::from_path(&path).first()
        && let Ok(value) = HeaderValue::from_str(mime.as_ref())
    {
        headers.insert(header::CONTENT_TYPE, value);
    }
    Ok(response)
}

/// Inclusive byte bounds of a single `bytes=` range. Anything else (other
/// units, multiple ranges, garbage) means the whole file is sent.
fn parse_range(value: &HeaderValue, size: u64) -> Option<(u64, u64)> {
    let spec = value.to_str().ok()?.trim().strip_prefix("bytes=")?.trim();
    if spec.contains(',') {
        return None;
    }
    let (first, last) = spec.split_once('-')?;
    let (first, last) = (first.trim(), last.trim());

    if first.is_empty() {
        // "-N": the final N bytes.
        let suffix: u64 = last.parse().ok()?;
        if suffix == 0 {
            return None;
        }
        return Some((size.saturating_sub(suffix), size.saturating_sub(1)));
    }

    let start: u64 = first.parse().ok()?;
    let end = if last.is_empty() {
        size.saturating_sub(1)
    } else {
        last.parse().ok()?
    };
    (end >= start).then_some((start, end))
}

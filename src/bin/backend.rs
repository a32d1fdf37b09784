#![forbid(unsafe_code)]

//! Axum backend for Tubely.
//!
//! Owners upload a thumbnail for one of their videos; the image is written to
//! the assets directory under a random name and the video's `thumbnail_url`
//! is pointed at it. Stored assets and video metadata are served back from the
//! same process.

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Body,
    extract::{
        DefaultBodyLimit, Multipart, Path as AxumPath, State,
        multipart::{Field, MultipartRejection},
    },
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::Parser;
use mime_guess::MimeGuess;
use tokio::{fs::File, io::AsyncWriteExt, signal};
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use tubely::{
    assets::{AssetStore, extension_for, generate_filename, is_allowed_thumbnail, parse_media_type},
    config::{RuntimeOverrides, resolve_runtime_config},
    metadata::{Video, VideoStore},
    security::{bearer_token, ensure_not_root, validate_jwt},
};
use uuid::Uuid;

/// Upper bound for a thumbnail upload request body (10 MiB).
const MAX_UPLOAD_BYTES: usize = 10 << 20;

/// Multipart field the UI uses for the image.
const THUMBNAIL_FIELD: &str = "thumbnail";

#[derive(Debug, Clone, Parser)]
#[command(name = "backend", about = "Tubely thumbnail and metadata API")]
struct BackendArgs {
    /// Directory uploaded assets are written to (ASSETS_ROOT).
    #[arg(long)]
    assets_root: Option<PathBuf>,

    /// SQLite database holding video metadata (DB_PATH).
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Port to listen on; also used in generated asset URLs (PORT).
    #[arg(long)]
    port: Option<u16>,

    /// Address to bind (TUBELY_HOST).
    #[arg(long)]
    host: Option<String>,

    /// Dotenv file consulted after the process environment.
    #[arg(long)]
    env_file: Option<PathBuf>,
}

impl BackendArgs {
    fn into_overrides(self) -> RuntimeOverrides {
        RuntimeOverrides {
            assets_root: self.assets_root,
            db_path: self.db_path,
            jwt_secret: None,
            port: self.port,
            host: self.host,
            env_path: self.env_file,
        }
    }
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/TUBELY_HOST")
}

/// Shared state injected into every handler.
#[derive(Clone)]
struct AppState {
    store: VideoStore,
    assets: Arc<AssetStore>,
    jwt_secret: Arc<str>,
    port: u16,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
    source: Option<String>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            source: None,
        }
    }

    /// Malformed id, form, missing part or rejected media type.
    fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    /// No usable credential was presented.
    fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    /// Authenticated, but not allowed to touch this record.
    fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    /// Records the underlying cause for the log. Never sent to the client.
    fn with_source(mut self, source: impl std::fmt::Display) -> Self {
        self.source = Some(format!("{source:#}"));
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let source = self.source.as_deref().unwrap_or("-");
        if self.status.is_server_error() {
            error!(status = %self.status, %source, "{}", self.message);
        } else {
            debug!(status = %self.status, %source, "{}", self.message);
        }
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = BackendArgs::parse();

    ensure_not_root("backend")?;

    let config = resolve_runtime_config(args.into_overrides())?;
    let host = parse_host_arg(&config.host)?;

    let assets = AssetStore::new(&config.assets_root);
    assets
        .ensure_root()
        .await
        .with_context(|| format!("creating assets directory {}", config.assets_root.display()))?;
    let store = VideoStore::open(&config.db_path)
        .await
        .context("initializing video store")?;

    let state = AppState {
        store,
        assets: Arc::new(assets),
        jwt_secret: Arc::from(config.jwt_secret),
        port: config.port,
    };

    let addr = SocketAddr::new(host, config.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!(%addr, assets_root = %config.assets_root.display(), "API server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    // Only graceful shutdown depends on this; Ctrl+C still terminates the
    // process when the handler cannot be installed.
    if let Err(err) = signal::ctrl_c().await {
        warn!(error = %err, "failed to install Ctrl+C handler");
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/thumbnail/{videoID}",
            post(upload_thumbnail).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/api/videos", get(list_videos))
        .route("/api/videos/{videoID}", get(get_video))
        .route("/assets/{file}", get(serve_asset))
        .fallback(|| async { ApiError::not_found("endpoint not found") })
        .with_state(state)
}

fn parse_video_id(raw: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(raw).map_err(|err| ApiError::invalid_input("Invalid ID").with_source(err))
}

/// Resolves the caller from the bearer token.
fn authenticate(state: &AppState, headers: &HeaderMap) -> ApiResult<Uuid> {
    let token = bearer_token(headers)
        .map_err(|err| ApiError::unauthenticated("Couldn't find JWT").with_source(err))?;
    validate_jwt(token, &state.jwt_secret)
        .map_err(|err| ApiError::unauthenticated("Couldn't validate JWT").with_source(err))
}

/// `POST /api/thumbnail/{videoID}`
///
/// Credentials, the record and ownership are all checked before the body is
/// read, so rejected callers never cause a write. The multipart extractor is
/// taken as a `Result` for the same reason: a bad body must not win over a
/// missing token.
async fn upload_thumbnail(
    State(state): State<AppState>,
    AxumPath(video_id): AxumPath<String>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<Json<Video>> {
    let video_id = parse_video_id(&video_id)?;

    let user_id = authenticate(&state, &headers)?;

    info!(%video_id, %user_id, "uploading thumbnail");

    let video = state
        .store
        .get_video(video_id)
        .await
        .map_err(|err| ApiError::internal("Couldn't find video").with_source(err))?
        .ok_or_else(|| ApiError::not_found("Couldn't find video"))?;

    if video.user_id != user_id {
        return Err(ApiError::unauthorized("Not authorized")
            .with_source(format!("{user_id} does not own {video_id}")));
    }

    let mut multipart =
        multipart.map_err(|err| ApiError::invalid_input("Couldn't parse form").with_source(err))?;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::invalid_input("Couldn't parse form").with_source(err))?
    {
        if field.name() != Some(THUMBNAIL_FIELD) {
            continue;
        }
        return store_thumbnail(&state, video, field).await.map(Json);
    }

    Err(ApiError::invalid_input("Couldn't find thumbnail"))
}

/// Validates the part's declared media type, writes it under a fresh random
/// name and points the record at the new file.
///
/// The file is not removed when the record update fails; it stays on disk
/// without any reference.
async fn store_thumbnail(
    state: &AppState,
    mut video: Video,
    mut field: Field<'_>,
) -> ApiResult<Video> {
    let declared = field.content_type().unwrap_or_default();
    let media_type = parse_media_type(declared).map_err(|err| {
        ApiError::invalid_input("Couldn't parse media type")
            .with_source(format!("{declared:?}: {err}"))
    })?;
    if !is_allowed_thumbnail(&media_type) {
        return Err(ApiError::invalid_input("Invalid media type").with_source(media_type));
    }

    let extension = extension_for(&media_type).ok_or_else(|| {
        ApiError::invalid_input("Couldn't determine file extension").with_source(&media_type)
    })?;
    let filename = generate_filename(extension);

    let written = write_upload(&state.assets, &filename, &mut field).await?;

    let url = state.assets.public_url(state.port, &filename);
    video.thumbnail_url = Some(url);
    state
        .store
        .update_video(&mut video)
        .await
        .map_err(|err| ApiError::internal("Couldn't update video").with_source(err))?;

    info!(video_id = %video.id, %filename, bytes = written, "thumbnail stored");
    Ok(video)
}

/// Streams the field into a newly created file. A file left half-written by a
/// failed copy is deleted again.
async fn write_upload(assets: &AssetStore, filename: &str, field: &mut Field<'_>) -> ApiResult<u64> {
    let mut file = assets
        .create_exclusive(filename)
        .await
        .map_err(|err| ApiError::internal("Couldn't create file").with_source(err))?;

    match copy_field(&mut file, field).await {
        Ok(written) => Ok(written),
        Err(err) => {
            drop(file);
            if let Err(remove_err) = assets.remove(filename).await {
                warn!(%filename, error = %remove_err, "failed to remove partial upload");
            }
            Err(err)
        }
    }
}

async fn copy_field(file: &mut File, field: &mut Field<'_>) -> ApiResult<u64> {
    let mut written = 0u64;
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|err| ApiError::invalid_input("Couldn't parse form").with_source(err))?
    {
        file.write_all(&chunk)
            .await
            .map_err(|err| ApiError::internal("Couldn't write file").with_source(err))?;
        written += chunk.len() as u64;
    }
    file.flush()
        .await
        .map_err(|err| ApiError::internal("Couldn't write file").with_source(err))?;
    Ok(written)
}

/// `GET /api/videos`: the caller's own videos, newest first.
async fn list_videos(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<Video>>> {
    let user_id = authenticate(&state, &headers)?;
    let videos = state
        .store
        .list_videos_for_user(user_id)
        .await
        .map_err(|err| ApiError::internal("Couldn't retrieve videos").with_source(err))?;
    Ok(Json(videos))
}

/// `GET /api/videos/{videoID}`
async fn get_video(
    State(state): State<AppState>,
    AxumPath(video_id): AxumPath<String>,
) -> ApiResult<Json<Video>> {
    let video_id = parse_video_id(&video_id)?;
    let video = state
        .store
        .get_video(video_id)
        .await
        .map_err(|err| ApiError::internal("Couldn't get video").with_source(err))?
        .ok_or_else(|| ApiError::not_found("Couldn't find video"))?;
    Ok(Json(video))
}

/// `GET /assets/{file}`: streams a stored upload. Knowing the random name is
/// the only requirement.
async fn serve_asset(
    State(state): State<AppState>,
    AxumPath(file): AxumPath<String>,
) -> ApiResult<Response> {
    let path = state
        .assets
        .resolve(&file)
        .ok_or_else(|| ApiError::not_found("file not found"))?;
    let handle = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;

    let mut response = Body::from_stream(ReaderStream::new(handle)).into_response();
    if let Some(mime) = MimeGuess::from_path(&path).first()
        && let Ok(value) = HeaderValue::from_str(mime.as_ref())
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    Ok(response)
}

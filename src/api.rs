#![forbid(unsafe_code)]

//! Axum router for the three public endpoints.
//!
//! Engine calls block, so every handler hops onto the blocking pool before
//! touching the orchestrator.

use std::{
    collections::HashMap,
    pin::Pin,
    task::{Context, Poll},
};

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures_util::Stream;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

use crate::download::{DownloadRequest, MediaInfo, Orchestrator, PreparedDownload, is_truthy};
use crate::error::FetchError;

/// Shared state injected into every handler.
#[derive(Clone)]
pub struct AppState {
    orchestrator: Orchestrator,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self { orchestrator }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/fetch_info", post(fetch_info))
        .route("/download", get(download))
        .fallback(not_found)
        .method_not_allowed_fallback(method_not_allowed)
        .with_state(state)
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn method_not_allowed(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::METHOD_NOT_ALLOWED,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<FetchError> for ApiError {
    fn from(err: FetchError) -> Self {
        let status = if err.is_client_error() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

async fn not_found() -> ApiError {
    ApiError::not_found("endpoint not found")
}

async fn method_not_allowed() -> ApiError {
    ApiError::method_not_allowed("method not allowed")
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let ffmpeg = state.orchestrator.ffmpeg_path();
    Json(json!({
        "status": "ok",
        "ffmpeg": ffmpeg,
        "transcoderPath": ffmpeg,
    }))
}

#[derive(Debug, Default, Deserialize)]
struct UrlPayload {
    url: Option<String>,
}

/// Accepts `{"url": ...}` as JSON, falling back to `?url=`. A body that is
/// not valid JSON, or not sent as JSON, counts as empty.
async fn fetch_info(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<MediaInfo>> {
    let payload = if is_json_content(&headers) {
        serde_json::from_slice::<UrlPayload>(&body).unwrap_or_default()
    } else {
        UrlPayload::default()
    };
    let url = payload
        .url
        .filter(|url| !url.is_empty())
        .or_else(|| query.get("url").cloned());

    info!(url = url.as_deref().unwrap_or_default(), "fetch_info");
    let orchestrator = state.orchestrator.clone();
    let info = tokio::task::spawn_blocking(move || orchestrator.resolve_info(url.as_deref()))
        .await
        .map_err(|err| ApiError::internal(format!("info worker failed: {err}")))??;
    Ok(Json(info))
}

/// `application/json` or any `application/*+json`, parameters ignored.
fn is_json_content(headers: &HeaderMap) -> bool {
    let Some(value) = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
    else {
        return false;
    };
    let mime = value
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    mime == "application/json" || (mime.starts_with("application/") && mime.ends_with("+json"))
}

async fn download(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Response> {
    let request = DownloadRequest {
        url: params.get("url").cloned(),
        selector: params.get("format_id").cloned(),
        filename: params.get("filename").cloned(),
        audio_only: params
            .get("audio_only")
            .is_some_and(|value| is_truthy(value)),
    };

    info!(
        url = request.url.as_deref().unwrap_or_default(),
        format_id = request.selector.as_deref().unwrap_or_default(),
        audio_only = request.audio_only,
        "download"
    );
    let orchestrator = state.orchestrator.clone();
    let prepared = tokio::task::spawn_blocking(move || orchestrator.prepare_download(request))
        .await
        .map_err(|err| ApiError::internal(format!("download worker failed: {err}")))??;
    attachment_response(prepared).await
}

/// Streams the prepared file. The stream owns the download, so the scratch
/// directory goes away once the body is finished or the client disconnects.
async fn attachment_response(prepared: PreparedDownload) -> ApiResult<Response> {
    let file = File::open(&prepared.path).await.map_err(FetchError::Read)?;
    let size = file.metadata().await.map_err(FetchError::Read)?.len();

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    let disposition = content_disposition(&prepared.filename);
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&disposition).map_err(|err| {
            warn!(%disposition, error = %err, "invalid content disposition");
            ApiError::internal("could not build attachment header")
        })?,
    );

    let body = Body::from_stream(ScratchBoundStream {
        inner: ReaderStream::new(file),
        _download: prepared,
    });
    Ok((headers, body).into_response())
}

struct ScratchBoundStream<S> {
    inner: S,
    _download: PreparedDownload,
}

impl<S> Stream for ScratchBoundStream<S>
where
    S: Stream + Unpin,
{
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// ASCII `filename` for old clients plus an RFC 5987 `filename*`.
fn content_disposition(filename: &str) -> String {
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        ascii_filename(filename),
        urlencoding::encode(filename)
    )
}

fn ascii_filename(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c == ' ' || (c.is_ascii_graphic() && c != '"' && c != '\\') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

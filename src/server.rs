//! HTTP upload server.
//!
//! Accepts mail containers as a multipart upload, runs the batch and streams
//! back the resulting PDF (one container) or zip archive (several).
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/` | Upload form |
//! | `POST` | `/`, `/convert` | Multipart upload → PDF or zip download |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "no_valid_input", "message": "..." } }
//! ```
//!
//! Error codes: `bad_request` (400), `payload_too_large` (413),
//! `no_valid_input` (422), `conversion_failed` (422), `internal` (500).
//!
//! # Workspace lifetime
//!
//! Every request gets its own [`Workspace`]. On error it is released before
//! the error response is returned. On success the handle moves into a guard
//! owned by the response body stream. The transport drops the body once
//! `Content-Length` bytes are out, or when the client goes away, and the
//! guard releases the workspace on that drop.

use axum::{
    body::{Body, Bytes},
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use quick_xml::escape::escape;

use crate::batch::{BatchOrchestrator, BatchReport, BatchState, Upload};
use crate::config::{has_extension, Config};
use crate::error::{BatchError, InputError};
use crate::workspace::Workspace;

/// Read size for streamed downloads.
const DOWNLOAD_CHUNK: usize = 64 * 1024;

#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    batch: Arc<BatchOrchestrator>,
}

/// Builds the application router.
pub fn router(config: Arc<Config>) -> anyhow::Result<Router> {
    let batch = Arc::new(BatchOrchestrator::from_config(&config)?);
    let limit = config.server.max_upload_bytes;

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(Any);

    Ok(Router::new()
        .route("/", get(handle_form).post(handle_convert))
        .route("/convert", post(handle_convert))
        .route("/health", get(handle_health))
        .layer(DefaultBodyLimit::max(limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(AppState { config, batch }))
}

/// Starts the upload server on `[server].bind` and runs until the process
/// is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let app = router(Arc::new(config.clone()))?;

    println!("mailbind listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: message.into(),
    }
}

impl From<BatchError> for AppError {
    fn from(err: BatchError) -> Self {
        let message = err.to_string();
        match err {
            BatchError::Input(InputError::TooLarge { .. }) => AppError {
                status: StatusCode::PAYLOAD_TOO_LARGE,
                code: "payload_too_large",
                message,
            },
            BatchError::Input(_) => bad_request(message),
            BatchError::NoValidInput { .. } => AppError {
                status: StatusCode::UNPROCESSABLE_ENTITY,
                code: "no_valid_input",
                message,
            },
            BatchError::Aborted { .. } => AppError {
                status: StatusCode::UNPROCESSABLE_ENTITY,
                code: "conversion_failed",
                message,
            },
            BatchError::Archive(_) | BatchError::Io(_) => internal(message),
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET / ============

async fn handle_form(State(state): State<AppState>) -> Html<String> {
    let field = escape(&state.config.server.upload_field);
    let ext = escape(&state.config.input.extension);
    Html(format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>mailbind</title></head>
<body>
<h1>Convert mail threads</h1>
<form method="post" action="/convert" enctype="multipart/form-data">
<input type="file" name="{field}" accept=".{ext}" multiple>
<button type="submit">Convert</button>
</form>
</body>
</html>
"#
    ))
}

// ============ POST / and /convert ============

async fn handle_convert(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Result<Multipart, axum::extract::multipart::MultipartRejection>,
) -> Result<Response, AppError> {
    let limit = state.config.server.max_upload_bytes;
    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if declared.is_some_and(|len| len > limit) {
        return Err(BatchError::from(InputError::TooLarge { limit }).into());
    }
    let mut multipart = multipart.map_err(|e| bad_request(e.body_text()))?;

    let workspace = Workspace::acquire(&state.config.workspace.root).map_err(|e| {
        tracing::error!(error = %e, "could not create workspace");
        internal(format!("could not create workspace: {}", e.kind()))
    })?;
    BatchState::Receiving.enter(&workspace);

    let result = match receive_uploads(&mut multipart, &state.config, &workspace).await {
        Ok(uploads) => state.batch.run(uploads, &workspace).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(report) => download(report, workspace).await,
        Err(err) => {
            tracing::warn!(workspace = %workspace.id(), error = %err, "request failed");
            BatchState::CleanedUp.enter(&workspace);
            workspace.release();
            Err(err.into())
        }
    }
}

/// Streams every file in the upload field into the workspace.
async fn receive_uploads(
    multipart: &mut Multipart,
    config: &Config,
    workspace: &Workspace,
) -> Result<Vec<Upload>, BatchError> {
    let limit = config.server.max_upload_bytes;
    let ext = config.input.extension.trim_start_matches('.');
    let mut uploads = Vec::new();

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(e, limit))?
    {
        if field.name() != Some(config.server.upload_field.as_str()) {
            continue;
        }
        let Some(name) = field.file_name().map(client_file_name) else {
            continue;
        };
        // Browsers send an empty part when no file was picked.
        if name.is_empty() {
            continue;
        }

        let stored_ext = if has_extension(&name, ext) { ext } else { "bin" };
        let path = workspace.temp_path("upload", stored_ext);
        let mut file = tokio::fs::File::create(&path).await?;
        while let Some(chunk) = field.chunk().await.map_err(|e| multipart_error(e, limit))? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        tracing::debug!(workspace = %workspace.id(), upload = %name, "upload received");
        uploads.push(Upload { name, path });
    }

    Ok(uploads)
}

fn multipart_error(err: MultipartError, limit: usize) -> BatchError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        InputError::TooLarge { limit }.into()
    } else {
        InputError::Malformed(err.body_text()).into()
    }
}

/// Base name of a client-supplied file name, whichever separator it uses.
fn client_file_name(raw: &str) -> String {
    raw.rsplit(['/', '\\']).next().unwrap_or(raw).trim().to_string()
}

async fn download(report: BatchReport, workspace: Workspace) -> Result<Response, AppError> {
    BatchState::Responding.enter(&workspace);
    let output = &report.output;

    let opened = async {
        let file = tokio::fs::File::open(output.path()).await?;
        let len = file.metadata().await?.len();
        Ok::<_, std::io::Error>((file, len))
    }
    .await;
    let (file, len) = match opened {
        Ok(v) => v,
        Err(e) => {
            workspace.release();
            return Err(internal(format!("could not read output: {}", e.kind())));
        }
    };

    let disposition = format!(
        "attachment; filename=\"{}\"",
        output.file_name().replace(['"', '\\'], "_")
    );
    let disposition = HeaderValue::from_str(&disposition)
        .map_err(|_| internal("output file name is not a valid header value"))?;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, output.content_type())
        .header(header::CONTENT_DISPOSITION, disposition)
        .header(header::CONTENT_LENGTH, len)
        .header("x-mailbind-documents", output.documents().len())
        .header("x-mailbind-skipped", report.skipped.len())
        .body(stream_file(file, workspace))
        .map_err(|e| internal(e.to_string()))
}

/// Releases the request workspace when the response body is dropped.
struct ReleaseOnDrop(Workspace);

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        BatchState::CleanedUp.enter(&self.0);
        self.0.release();
    }
}

/// Body streaming `file` that holds `workspace` until the body is dropped.
fn stream_file(file: tokio::fs::File, workspace: Workspace) -> Body {
    let stream = futures::stream::try_unfold(
        (file, ReleaseOnDrop(workspace)),
        |(mut file, guard)| async move {
            let mut buf = vec![0u8; DOWNLOAD_CHUNK];
            let n = file.read(&mut buf).await?;
            if n == 0 {
                return Ok::<_, std::io::Error>(None);
            }
            buf.truncate(n);
            Ok(Some((Bytes::from(buf), (file, guard))))
        },
    );
    Body::from_stream(stream)
}

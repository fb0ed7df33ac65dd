//! HTTP service surface.
//!
//! `POST /process` takes a multipart upload (video plus optional style
//! reference and scalar options), runs the grading pipeline, and
//! returns a URL under the statically-served outputs directory.
//! Inference is serialized through a one-permit semaphore; concurrent
//! requests queue rather than contend for accelerator memory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::multipart::Field;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{error, info};
use uuid::Uuid;

use crate::device::DevicePolicy;
use crate::error::{classify, GradeError};
use crate::model::ModelPair;
use crate::pipeline::{process_video, ProcessRequest, ScratchDir};
use crate::types::{OutputResolution, QualityMode};

/// Upload cap. Clips beyond this are rejected by the extractor layer.
const MAX_UPLOAD_BYTES: usize = 2 * 1024 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    models: ModelPair,
    policy: DevicePolicy,
    gpu_semaphore: Semaphore,
    upload_dir: PathBuf,
    output_dir: PathBuf,
    default_quality: QualityMode,
}

impl AppState {
    pub fn new(
        models: ModelPair,
        policy: DevicePolicy,
        upload_dir: PathBuf,
        output_dir: PathBuf,
        default_quality: QualityMode,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                models,
                policy,
                gpu_semaphore: Semaphore::new(1),
                upload_dir,
                output_dir,
                default_quality,
            }),
        }
    }

    pub fn output_dir(&self) -> PathBuf {
        self.inner.output_dir.clone()
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    accelerator: String,
}

#[derive(Serialize)]
struct ProcessResponse {
    processed_video_url: String,
    processing_time: f64,
    compute_target: String,
    quality_mode_used: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Maps a pipeline failure to an HTTP status: caller faults are 400,
/// everything else 500.
fn error_status(err: &anyhow::Error) -> StatusCode {
    match classify(err) {
        Some(e) if e.is_caller_fault() => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &anyhow::Error) -> Response {
    let status = error_status(err);
    let message = match classify(err) {
        Some(classified) => classified.to_string(),
        None => format!("{err:#}"),
    };
    (status, Json(ErrorResponse { error: message })).into_response()
}

fn parse_stabilization(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "" | "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(GradeError::Input(format!("invalid stabilization value {other:?}")).into()),
    }
}

/// File extension for a stored upload, from the client-supplied name.
fn upload_extension(file_name: Option<&str>, fallback: &str) -> String {
    file_name
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .filter(|ext| ext.chars().all(|c| c.is_ascii_alphanumeric()) && ext.len() <= 5)
        .unwrap_or(fallback)
        .to_ascii_lowercase()
}

/// Streams one multipart field to disk chunk by chunk, so memory use
/// stays O(chunk) regardless of upload size. Returns the byte count.
async fn store_field(field: &mut Field<'_>, path: &Path) -> Result<u64> {
    let mut file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("failed to store upload: {}", path.display()))?;

    let mut written = 0u64;
    while let Some(chunk) = field
        .chunk()
        .await
        .context(GradeError::Input("failed to read upload body".to_string()))?
    {
        file.write_all(&chunk)
            .await
            .with_context(|| format!("failed to store upload: {}", path.display()))?;
        written += chunk.len() as u64;
    }
    file.flush()
        .await
        .with_context(|| format!("failed to store upload: {}", path.display()))?;

    Ok(written)
}

struct UploadedRequest {
    video_path: PathBuf,
    reference_path: Option<PathBuf>,
    quality: QualityMode,
    stabilization: bool,
    output_resolution: OutputResolution,
}

async fn collect_multipart(
    multipart: &mut Multipart,
    scratch: &ScratchDir,
    default_quality: QualityMode,
) -> Result<UploadedRequest> {
    let mut video_path = None;
    let mut reference_path = None;
    let mut quality = default_quality;
    let mut stabilization = true;
    let mut output_resolution = OutputResolution::Auto;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .context(GradeError::Input("malformed multipart body".to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "video_file" => {
                let ext = upload_extension(field.file_name(), "mp4");
                let path = scratch.file(&format!("input.{ext}"));
                store_field(&mut field, &path).await?;
                video_path = Some(path);
            }
            "reference_image" => {
                let ext = upload_extension(field.file_name(), "png");
                let path = scratch.file(&format!("reference.{ext}"));
                let written = store_field(&mut field, &path).await?;
                // An empty optional file input is treated as absent.
                if written == 0 {
                    let _ = tokio::fs::remove_file(&path).await;
                } else {
                    reference_path = Some(path);
                }
            }
            "quality_mode" => {
                let raw = field.text().await.unwrap_or_default();
                quality = raw
                    .parse()
                    .map_err(|e| GradeError::Input(format!("{e}")))?;
            }
            "stabilization" => {
                let raw = field.text().await.unwrap_or_default();
                stabilization = parse_stabilization(&raw)?;
            }
            "output_resolution" => {
                let raw = field.text().await.unwrap_or_default();
                output_resolution = raw
                    .parse()
                    .map_err(|e| GradeError::Input(format!("{e}")))?;
            }
            other => {
                info!(field = other, "ignoring unknown multipart field");
            }
        }
    }

    let video_path = video_path
        .ok_or_else(|| GradeError::Input("missing required field video_file".to_string()))?;

    Ok(UploadedRequest {
        video_path,
        reference_path,
        quality,
        stabilization,
        output_resolution,
    })
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        accelerator: state.inner.policy.describe(),
    })
}

async fn process(State(state): State<AppState>, mut multipart: Multipart) -> Response {
    match run_process(state, &mut multipart).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => {
            error!(error = %format!("{err:#}"), "process request failed");
            error_response(&err)
        }
    }
}

async fn run_process(state: AppState, multipart: &mut Multipart) -> Result<ProcessResponse> {
    // Scratch guard owns the uploads; dropped on every exit path.
    let scratch = ScratchDir::create(&state.inner.upload_dir)?;
    let uploaded = collect_multipart(multipart, &scratch, state.inner.default_quality).await?;

    let output_name = format!("graded_{}.mp4", Uuid::new_v4());
    let request = ProcessRequest {
        video_path: uploaded.video_path,
        reference_image: uploaded.reference_path,
        quality: uploaded.quality,
        stabilization: uploaded.stabilization,
        output_resolution: uploaded.output_resolution,
        output_path: state.inner.output_dir.join(&output_name),
    };

    let _permit = state
        .inner
        .gpu_semaphore
        .acquire()
        .await
        .context("inference semaphore closed")?;

    let inner = state.inner.clone();
    let blocking_request = request.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        process_video(&inner.models, &inner.policy, &blocking_request)
    })
    .await
    .context("pipeline task panicked")?;

    drop(scratch);

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(err) => {
            // No partial outputs.
            let _ = std::fs::remove_file(&request.output_path);
            return Err(err);
        }
    };

    Ok(ProcessResponse {
        processed_video_url: format!("/outputs/{output_name}"),
        processing_time: outcome.duration.as_secs_f64(),
        compute_target: outcome.compute_target,
        quality_mode_used: outcome.quality.to_string(),
    })
}

pub fn app_router(state: AppState) -> Router {
    let output_dir = state.output_dir();
    Router::new()
        .route("/health", get(health))
        .route("/process", post(process))
        .nest_service("/outputs", ServeDir::new(output_dir))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Binds and serves until the process is terminated.
pub async fn serve(state: AppState, host: &str, port: u16) -> Result<()> {
    let app = app_router(state);
    let addr = format!("{host}:{port}");
    info!("listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app).await?;
    Ok(())
}

//! Queue-driven job surface.
//!
//! Alternative entry point to the HTTP server: a JSON payload names the
//! inputs by URL, the worker downloads them into a job-scoped scratch
//! directory, runs the same pipeline, and reports a JSON result. The
//! scratch directory is removed whatever the outcome.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use url::Url;

use crate::device::DevicePolicy;
use crate::error::{classify, GradeError};
use crate::model::ModelPair;
use crate::pipeline::{process_video, ProcessRequest, ScratchDir};
use crate::types::{OutputResolution, QualityMode};

#[derive(Debug, Clone, Deserialize)]
pub struct JobPayload {
    pub video_url: String,
    #[serde(default)]
    pub reference_image_url: Option<String>,
    #[serde(default)]
    pub quality_mode: Option<String>,
    #[serde(default = "default_stabilization")]
    pub stabilization: bool,
    #[serde(default)]
    pub output_resolution: Option<String>,
}

fn default_stabilization() -> bool {
    true
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum JobResult {
    Completed {
        output_path: PathBuf,
        processing_time: f64,
        frames: usize,
        compute_target: String,
    },
    Failed {
        error: String,
        caller_fault: bool,
    },
}

/// File name for a downloaded input, taken from the last URL path
/// segment when it looks like a plain file name.
fn download_name(url: &Url, fallback: &str) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| {
            !name.is_empty()
                && name.len() <= 128
                && name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
                && name.chars().any(|c| c.is_ascii_alphanumeric())
        })
        .unwrap_or(fallback)
        .to_string()
}

/// Streams one remote input into the scratch directory.
fn fetch_input(raw_url: &str, scratch: &ScratchDir, fallback: &str) -> Result<PathBuf> {
    let url = Url::parse(raw_url)
        .map_err(|e| GradeError::Input(format!("invalid input URL {raw_url:?}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        bail!(GradeError::Input(format!(
            "unsupported URL scheme {:?} in {raw_url:?}",
            url.scheme()
        )));
    }

    let path = scratch.file(&download_name(&url, fallback));
    info!(url = raw_url, dest = %path.display(), "downloading input");

    let mut response = reqwest::blocking::get(url)
        .with_context(|| format!("failed to fetch {raw_url}"))?;
    if !response.status().is_success() {
        bail!(GradeError::Input(format!(
            "fetching {raw_url} returned HTTP {}",
            response.status()
        )));
    }

    let mut file = File::create(&path)
        .with_context(|| format!("failed to create download file: {}", path.display()))?;
    io::copy(&mut response, &mut file)
        .with_context(|| format!("failed while streaming {raw_url}"))?;

    Ok(path)
}

fn build_request(
    payload: &JobPayload,
    scratch: &ScratchDir,
    output_dir: &Path,
    default_quality: QualityMode,
) -> Result<ProcessRequest> {
    let video_path = fetch_input(&payload.video_url, scratch, "input.mp4")?;
    let reference_image = payload
        .reference_image_url
        .as_deref()
        .map(|url| fetch_input(url, scratch, "reference.png"))
        .transpose()?;

    let quality = match payload.quality_mode.as_deref() {
        Some(raw) => raw
            .parse()
            .map_err(|e| GradeError::Input(format!("{e}")))?,
        None => default_quality,
    };
    let output_resolution = match payload.output_resolution.as_deref() {
        Some(raw) => raw
            .parse::<OutputResolution>()
            .map_err(|e| GradeError::Input(format!("{e}")))?,
        None => OutputResolution::Auto,
    };

    Ok(ProcessRequest {
        video_path,
        reference_image,
        quality,
        stabilization: payload.stabilization,
        output_resolution,
        output_path: output_dir.join(format!("graded_{}.mp4", uuid::Uuid::new_v4())),
    })
}

/// Runs one job end to end. Never returns `Err`: every failure is folded
/// into a `JobResult::Failed` so the caller always has a reportable
/// outcome.
pub fn run_job(
    models: &ModelPair,
    policy: &DevicePolicy,
    payload: &JobPayload,
    scratch_base: &Path,
    output_dir: &Path,
    default_quality: QualityMode,
) -> JobResult {
    match run_job_inner(models, policy, payload, scratch_base, output_dir, default_quality) {
        Ok(result) => result,
        Err(err) => {
            error!(error = %format!("{err:#}"), "job failed");
            let caller_fault = classify(&err).is_some_and(GradeError::is_caller_fault);
            JobResult::Failed {
                error: match classify(&err) {
                    Some(classified) => classified.to_string(),
                    None => format!("{err:#}"),
                },
                caller_fault,
            }
        }
    }
}

fn run_job_inner(
    models: &ModelPair,
    policy: &DevicePolicy,
    payload: &JobPayload,
    scratch_base: &Path,
    output_dir: &Path,
    default_quality: QualityMode,
) -> Result<JobResult> {
    let scratch = ScratchDir::create(scratch_base)?;
    let request = build_request(payload, &scratch, output_dir, default_quality)?;

    let outcome = match process_video(models, policy, &request) {
        Ok(outcome) => outcome,
        Err(err) => {
            let _ = std::fs::remove_file(&request.output_path);
            return Err(err);
        }
    };

    Ok(JobResult::Completed {
        output_path: outcome.output_path,
        processing_time: outcome.duration.as_secs_f64(),
        frames: outcome.frames,
        compute_target: outcome.compute_target,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_defaults_apply() {
        let payload: JobPayload =
            serde_json::from_str(r#"{"video_url": "https://cdn.example/clip.mp4"}"#).unwrap();
        assert_eq!(payload.video_url, "https://cdn.example/clip.mp4");
        assert!(payload.reference_image_url.is_none());
        assert!(payload.quality_mode.is_none());
        assert!(payload.stabilization);
        assert!(payload.output_resolution.is_none());
    }

    #[test]
    fn payload_full_form_deserializes() {
        let payload: JobPayload = serde_json::from_str(
            r#"{
                "video_url": "https://cdn.example/clip.mp4",
                "reference_image_url": "https://cdn.example/look.png",
                "quality_mode": "high",
                "stabilization": false,
                "output_resolution": "1280x720"
            }"#,
        )
        .unwrap();
        assert_eq!(
            payload.reference_image_url.as_deref(),
            Some("https://cdn.example/look.png")
        );
        assert_eq!(payload.quality_mode.as_deref(), Some("high"));
        assert!(!payload.stabilization);
        assert_eq!(payload.output_resolution.as_deref(), Some("1280x720"));
    }

    #[test]
    fn payload_missing_video_url_rejected() {
        assert!(serde_json::from_str::<JobPayload>(r#"{"quality_mode": "fast"}"#).is_err());
    }

    #[test]
    fn download_name_sanitizes() {
        let url = Url::parse("https://cdn.example/media/clip-01.mp4").unwrap();
        assert_eq!(download_name(&url, "input.mp4"), "clip-01.mp4");

        let url = Url::parse("https://cdn.example/").unwrap();
        assert_eq!(download_name(&url, "input.mp4"), "input.mp4");

        let url = Url::parse("https://cdn.example/a%2Fb/..").unwrap();
        assert_eq!(download_name(&url, "input.mp4"), "input.mp4");
    }

    #[test]
    fn fetch_rejects_non_http_schemes() {
        let base = tempfile::tempdir().unwrap();
        let scratch = ScratchDir::create(base.path()).unwrap();

        let err = fetch_input("file:///etc/passwd", &scratch, "input.mp4").unwrap_err();
        assert!(matches!(classify(&err), Some(GradeError::Input(_))));

        let err = fetch_input("not a url", &scratch, "input.mp4").unwrap_err();
        assert!(matches!(classify(&err), Some(GradeError::Input(_))));
    }

    #[test]
    fn failed_job_cleans_scratch() {
        use crate::device::{ComputeTarget, DevicePolicy, InferenceBackend};
        use crate::model::{FeatureExtractor, Features, LutGenerator, ModelPair};
        use crate::types::RgbFrame;

        struct StubExtractor;
        impl FeatureExtractor for StubExtractor {
            fn extract_features(&self, _image: &RgbFrame) -> Result<Features> {
                Ok(Features(ndarray::arr1(&[0.0f32]).into_dyn()))
            }
        }
        struct StubGenerator;
        impl LutGenerator for StubGenerator {
            fn generate_lut(&self, _content: &RgbFrame, _features: &Features) -> Result<Vec<f32>> {
                Ok(vec![0.0; 3 * 5 * 5 * 5])
            }
        }

        let tmp = tempfile::tempdir().unwrap();
        let scratch_base = tmp.path().join("jobs");
        let output_dir = tmp.path().join("outputs");
        std::fs::create_dir_all(&scratch_base).unwrap();
        std::fs::create_dir_all(&output_dir).unwrap();

        let models = ModelPair::from_parts(Box::new(StubExtractor), Box::new(StubGenerator), 0);
        let policy = DevicePolicy::with_target(ComputeTarget::Cpu, InferenceBackend::Cuda, None);
        let payload: JobPayload =
            serde_json::from_str(r#"{"video_url": "file:///etc/passwd"}"#).unwrap();

        let result = run_job(
            &models,
            &policy,
            &payload,
            &scratch_base,
            &output_dir,
            crate::types::QualityMode::Balanced,
        );

        let JobResult::Failed { caller_fault, .. } = result else {
            panic!("expected a failed job");
        };
        assert!(caller_fault);

        // The job's scratch directory and any partial output are gone.
        assert_eq!(std::fs::read_dir(&scratch_base).unwrap().count(), 0);
        assert_eq!(std::fs::read_dir(&output_dir).unwrap().count(), 0);
    }

    #[test]
    fn job_result_serializes_with_status_tag() {
        let completed = JobResult::Completed {
            output_path: PathBuf::from("/out/graded.mp4"),
            processing_time: 1.5,
            frames: 90,
            compute_target: "cuda".into(),
        };
        let json = serde_json::to_value(&completed).unwrap();
        assert_eq!(json["status"], "completed");
        assert_eq!(json["frames"], 90);

        let failed = JobResult::Failed {
            error: "input error: bad clip".into(),
            caller_fault: true,
        };
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["caller_fault"], true);
    }
}

//! Device and precision policy.
//!
//! Constructed once at startup and passed by reference to everything
//! that touches the models; requests never mutate it. Accelerated
//! targets run the models at the narrowest precision the hardware
//! supports (fp16); CPU runs fp32. TensorRT engine compilation is the
//! ahead-of-time step: it is attempted when requested and degrades to
//! the plain CUDA EP (and ultimately CPU) on failure instead of
//! aborting.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
};
use tracing::{debug, info, warn};

/// Where numeric work executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeTarget {
    Accelerator,
    Cpu,
}

impl fmt::Display for ComputeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComputeTarget::Accelerator => write!(f, "cuda"),
            ComputeTarget::Cpu => write!(f, "cpu"),
        }
    }
}

/// Numeric precision tier for model inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    Fp32,
    Fp16,
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Precision::Fp32 => write!(f, "fp32"),
            Precision::Fp16 => write!(f, "fp16"),
        }
    }
}

/// Execution-provider preference for accelerated sessions.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum InferenceBackend {
    #[default]
    Cuda,
    Tensorrt,
}

impl InferenceBackend {
    /// Parse from string (case-insensitive). Returns `Cuda` for unknown values.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "tensorrt" | "trt" => Self::Tensorrt,
            _ => Self::Cuda,
        }
    }
}

impl fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
        }
    }
}

/// Process-wide compute policy. Immutable after construction; shared
/// read-only across requests.
#[derive(Debug, Clone)]
pub struct DevicePolicy {
    pub target: ComputeTarget,
    pub precision: Precision,
    pub backend: InferenceBackend,
    pub trt_cache_dir: Option<PathBuf>,
}

impl DevicePolicy {
    /// Probes for an accelerator and derives the precision tier.
    pub fn detect(backend: InferenceBackend, trt_cache_dir: Option<PathBuf>) -> Self {
        let cuda = CUDAExecutionProvider::default();
        let accelerated = cuda.is_available().unwrap_or(false);

        let target = if accelerated {
            info!("CUDA execution provider available");
            ComputeTarget::Accelerator
        } else {
            warn!("no accelerator found, falling back to CPU. Performance will be slow");
            ComputeTarget::Cpu
        };

        Self::with_target(target, backend, trt_cache_dir)
    }

    /// Builds a policy for a known target. Used by `detect` and by tests.
    pub fn with_target(
        target: ComputeTarget,
        backend: InferenceBackend,
        trt_cache_dir: Option<PathBuf>,
    ) -> Self {
        let precision = match target {
            ComputeTarget::Accelerator => Precision::Fp16,
            ComputeTarget::Cpu => Precision::Fp32,
        };
        Self {
            target,
            precision,
            backend,
            trt_cache_dir,
        }
    }

    pub fn is_accelerated(&self) -> bool {
        self.target == ComputeTarget::Accelerator
    }

    /// Short label for responses and logs ("cuda" / "cpu").
    pub fn describe(&self) -> String {
        self.target.to_string()
    }

    /// Builds an `ort::Session` for a model under this policy.
    ///
    /// Tensorrt backend: registers the TRT EP with engine caching and the
    /// CUDA EP as fallback; when TRT engine compilation fails, logs and
    /// retries with CUDA only. CPU target skips EP registration entirely.
    /// Session build failures for a present model file are hard errors.
    pub fn build_session(&self, model_path: &Path) -> Result<Session> {
        let builder =
            Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;

        if !self.is_accelerated() {
            debug!(model = %model_path.display(), "building CPU session");
            return builder.commit_from_file(model_path).with_context(|| {
                format!("failed to load ONNX model: {}", model_path.display())
            });
        }

        if self.backend == InferenceBackend::Tensorrt {
            let cache_dir = self
                .trt_cache_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from("trt_cache"));
            if let Err(e) = std::fs::create_dir_all(&cache_dir) {
                warn!(
                    dir = %cache_dir.display(),
                    error = %e,
                    "failed to create TRT cache directory"
                );
            }
            let cache_path = cache_dir.to_string_lossy().to_string();

            info!(
                model = %model_path.display(),
                cache_dir = %cache_dir.display(),
                "compiling TensorRT engine (first run may take several minutes)"
            );

            let trt_result = Session::builder()?
                .with_optimization_level(GraphOptimizationLevel::Level3)?
                .with_execution_providers([
                    TensorRTExecutionProvider::default()
                        .with_engine_cache(true)
                        .with_engine_cache_path(&cache_path)
                        .with_fp16(true)
                        .with_device_id(0)
                        .build(),
                    CUDAExecutionProvider::default().build(),
                ])?
                .commit_from_file(model_path);

            match trt_result {
                Ok(session) => return Ok(session),
                Err(e) => {
                    warn!(
                        model = %model_path.display(),
                        error = %e,
                        "TensorRT engine compilation failed, falling back to CUDA EP"
                    );
                }
            }
        }

        debug!(model = %model_path.display(), "building session with CUDA EP");
        builder
            .with_execution_providers([CUDAExecutionProvider::default().build()])?
            .commit_from_file(model_path)
            .with_context(|| format!("failed to load ONNX model: {}", model_path.display()))
    }
}

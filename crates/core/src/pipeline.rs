//! End-to-end grading pipeline: probe, synthesize one LUT, stream
//! batches through the sampler into the encoder.
//!
//! Batches are processed strictly in clip order and dropped as soon as
//! their frames are handed to the encoder, so peak memory stays at
//! O(batch_size) frames. A request either produces a complete output
//! file or fails; there is no partial-output state.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use ndarray::Array4;
use tracing::{debug, info};

use crate::batch::{processing_dims, ranges_for, resize_batch};
use crate::device::DevicePolicy;
use crate::model::ModelPair;
use crate::sampler::{apply_lut, LutVolume};
use crate::types::{
    batch_to_frames, frames_to_batch, OutputResolution, QualityMode, RgbFrame,
};
use crate::video::{read_image, EncoderConfig, VideoEncoder, VideoReader};

#[derive(Debug, Clone)]
pub struct ProcessRequest {
    pub video_path: PathBuf,
    pub reference_image: Option<PathBuf>,
    pub quality: QualityMode,
    /// Accepted for API compatibility; the single-LUT-per-clip design is
    /// already temporally stable, so this is currently a no-op.
    pub stabilization: bool,
    pub output_resolution: OutputResolution,
    pub output_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub output_path: PathBuf,
    pub frames: usize,
    pub duration: Duration,
    pub compute_target: String,
    pub quality: QualityMode,
}

/// Grades one batch: in fast mode the LUT is sampled at reduced
/// resolution and the result upscaled back to the batch's own size.
fn grade_batch(batch: &Array4<f32>, lut: &LutVolume, quality: QualityMode) -> Array4<f32> {
    let (_, h, w, _) = batch.dim();
    if quality.downscales() {
        let (pw, ph) = processing_dims(quality, w as u32, h as u32);
        let down = resize_batch(batch, ph as usize, pw as usize);
        let graded = apply_lut(&down, lut);
        resize_batch(&graded, h, w)
    } else {
        apply_lut(batch, lut)
    }
}

/// Runs the full pipeline for one request.
pub fn process_video(
    models: &ModelPair,
    policy: &DevicePolicy,
    request: &ProcessRequest,
) -> Result<ProcessOutcome> {
    let start = Instant::now();

    let reader = VideoReader::open(&request.video_path)?;
    let clip = reader.info().clone();

    info!(
        input = %request.video_path.display(),
        width = clip.width,
        height = clip.height,
        fps = clip.fps,
        frames = clip.frame_count,
        quality = %request.quality,
        "starting grade"
    );
    if !request.stabilization {
        debug!("stabilization disabled by request (no effect in single-LUT mode)");
    }

    let analysis_frame = reader
        .read_frame(clip.midpoint_frame())
        .context("failed to decode analysis frame")?;
    let reference = request
        .reference_image
        .as_deref()
        .map(read_image)
        .transpose()?;

    let lut = models.synthesize_lut(&analysis_frame, reference.as_ref())?;
    debug!(lut_size = lut.size(), "LUT synthesized");

    let (out_w, out_h) = request.output_resolution.resolve(clip.width, clip.height);
    let mut encoder = VideoEncoder::new(&EncoderConfig {
        output_path: request.output_path.clone(),
        width: out_w,
        height: out_h,
        fps: clip.fps_rational(),
    })?;

    let mut stream = reader.stream()?;
    let mut written = 0usize;

    for range in ranges_for(clip.frame_count, request.quality) {
        let frames: Vec<RgbFrame> = stream
            .by_ref()
            .take(range.len())
            .collect::<Result<_>>()
            .with_context(|| format!("decode failed in frames {}..{}", range.start, range.end))?;
        if frames.len() != range.len() {
            bail!(
                "decoder ended early: expected frames {}..{}, got {}",
                range.start,
                range.end,
                frames.len()
            );
        }

        let batch = frames_to_batch(&frames)?;
        drop(frames);

        let mut graded = grade_batch(&batch, &lut, request.quality);
        drop(batch);

        if (out_w, out_h) != (clip.width, clip.height) {
            graded = resize_batch(&graded, out_h as usize, out_w as usize);
        }

        for frame in batch_to_frames(&graded) {
            encoder.write_frame(&frame)?;
            written += 1;
        }

        debug!(
            done = range.end,
            total = clip.frame_count,
            "batch encoded"
        );
    }

    encoder.finish()?;

    if written != clip.frame_count {
        bail!(
            "frame count mismatch: decoded {written}, expected {}",
            clip.frame_count
        );
    }

    let duration = start.elapsed();
    info!(
        output = %request.output_path.display(),
        frames = written,
        elapsed_ms = duration.as_millis() as u64,
        "grade complete"
    );

    Ok(ProcessOutcome {
        output_path: request.output_path.clone(),
        frames: written,
        duration,
        compute_target: policy.describe(),
        quality: request.quality,
    })
}

/// Request-scoped scratch directory, removed on drop whatever the
/// request outcome.
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    /// Creates `<base>/<uuid>` for one request's temp files.
    pub fn create(base: &Path) -> Result<Self> {
        let path = base.join(uuid::Uuid::new_v4().to_string());
        std::fs::create_dir_all(&path)
            .with_context(|| format!("failed to create scratch directory: {}", path.display()))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    dir = %self.path.display(),
                    error = %e,
                    "failed to remove scratch directory"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::DEFAULT_LUT_SIZE;

    #[test]
    fn scratch_dir_removed_on_drop() {
        let base = tempfile::tempdir().unwrap();
        let path;
        {
            let scratch = ScratchDir::create(base.path()).unwrap();
            path = scratch.path().to_path_buf();
            assert!(path.is_dir());
            std::fs::write(scratch.file("upload.mp4"), b"data").unwrap();
        }
        assert!(!path.exists());
    }

    #[test]
    fn scratch_dirs_are_unique() {
        let base = tempfile::tempdir().unwrap();
        let a = ScratchDir::create(base.path()).unwrap();
        let b = ScratchDir::create(base.path()).unwrap();
        assert_ne!(a.path(), b.path());
    }

    #[test]
    fn grade_batch_identity_is_noop_in_full_resolution_modes() {
        let lut = LutVolume::identity(DEFAULT_LUT_SIZE);
        let batch = Array4::from_shape_fn((2, 8, 8, 3), |(b, y, x, c)| {
            ((b + y + x + c) % 11) as f32 / 10.0
        });

        for quality in [QualityMode::Balanced, QualityMode::High] {
            let graded = grade_batch(&batch, &lut, quality);
            for (a, g) in batch.iter().zip(graded.iter()) {
                assert!((a - g).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn grade_batch_fast_mode_preserves_dimensions() {
        let lut = LutVolume::identity(5);
        let batch = Array4::from_elem((3, 32, 32, 3), 0.5f32);
        let graded = grade_batch(&batch, &lut, QualityMode::Fast);
        assert_eq!(graded.dim(), (3, 32, 32, 3));
        // Solid color survives the downscale/upscale round trip.
        for v in graded.iter() {
            assert!((v - 0.5).abs() < 1e-4);
        }
    }
}

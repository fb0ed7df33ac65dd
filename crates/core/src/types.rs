//! Shared frame and request types.
//!
//! Value-range conventions at the pipeline boundaries:
//! - the codec boundary (FFmpeg decode/encode) speaks packed 8-bit RGB24;
//! - everything between decode and encode works on normalized f32 batches
//!   of shape `(B, H, W, 3)` with values in `[0, 1]`.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};
use ndarray::Array4;
use serde::{Deserialize, Serialize};

/// A single decoded frame: packed RGB24, 8 bits per channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl RgbFrame {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected = width as usize * height as usize * 3;
        if data.len() != expected {
            bail!(
                "frame data length mismatch: expected {} ({}x{}x3), got {}",
                expected,
                width,
                height,
                data.len()
            );
        }
        Ok(Self {
            data,
            width,
            height,
        })
    }

    pub fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

/// Quality/VRAM tradeoff profile. Controls batch size and, for `Fast`,
/// a reduced processing resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityMode {
    Fast,
    #[default]
    Balanced,
    High,
}

impl QualityMode {
    /// Frames per GPU batch. Peak pipeline memory is O(batch_size) frames.
    pub fn batch_size(&self) -> usize {
        match self {
            QualityMode::Fast => 16,
            QualityMode::Balanced => 8,
            QualityMode::High => 4,
        }
    }

    /// Fast mode trades spatial fidelity for throughput by sampling at
    /// half resolution.
    pub fn downscales(&self) -> bool {
        matches!(self, QualityMode::Fast)
    }
}

impl fmt::Display for QualityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QualityMode::Fast => write!(f, "fast"),
            QualityMode::Balanced => write!(f, "balanced"),
            QualityMode::High => write!(f, "high"),
        }
    }
}

impl FromStr for QualityMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fast" => Ok(QualityMode::Fast),
            "balanced" => Ok(QualityMode::Balanced),
            "high" => Ok(QualityMode::High),
            other => bail!("unknown quality mode {other:?} (expected fast|balanced|high)"),
        }
    }
}

/// Requested output resolution: keep the source size or scale to an
/// explicit `WxH`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputResolution {
    #[default]
    Auto,
    Explicit {
        width: u32,
        height: u32,
    },
}

impl OutputResolution {
    pub fn resolve(&self, source_width: u32, source_height: u32) -> (u32, u32) {
        match self {
            OutputResolution::Auto => (source_width, source_height),
            OutputResolution::Explicit { width, height } => (*width, *height),
        }
    }
}

impl fmt::Display for OutputResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputResolution::Auto => write!(f, "auto"),
            OutputResolution::Explicit { width, height } => write!(f, "{width}x{height}"),
        }
    }
}

impl FromStr for OutputResolution {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("auto") {
            return Ok(OutputResolution::Auto);
        }
        let Some((w, h)) = trimmed.split_once(['x', 'X']) else {
            bail!("invalid output resolution {trimmed:?} (expected auto or WxH)");
        };
        let width: u32 = w.trim().parse()?;
        let height: u32 = h.trim().parse()?;
        if width == 0 || height == 0 {
            bail!("output resolution dimensions must be positive, got {width}x{height}");
        }
        Ok(OutputResolution::Explicit { width, height })
    }
}

/// Packs decoded 8-bit frames into a normalized `(B, H, W, 3)` batch.
/// All frames must share the dimensions of the first.
pub fn frames_to_batch(frames: &[RgbFrame]) -> Result<Array4<f32>> {
    let Some(first) = frames.first() else {
        bail!("cannot build a batch from zero frames");
    };
    let (w, h) = (first.width as usize, first.height as usize);

    let mut data = Vec::with_capacity(frames.len() * h * w * 3);
    for frame in frames {
        if frame.width != first.width || frame.height != first.height {
            bail!(
                "mixed frame dimensions in batch: {}x{} vs {}x{}",
                frame.width,
                frame.height,
                first.width,
                first.height
            );
        }
        data.extend(frame.data.iter().map(|&v| v as f32 / 255.0));
    }

    Ok(Array4::from_shape_vec((frames.len(), h, w, 3), data)?)
}

/// Converts a normalized batch back to packed 8-bit frames, clamping to
/// `[0, 1]` before quantization.
pub fn batch_to_frames(batch: &Array4<f32>) -> Vec<RgbFrame> {
    let (count, h, w, _) = batch.dim();
    let standard;
    let flat = match batch.as_slice() {
        Some(slice) => slice,
        None => {
            standard = batch.as_standard_layout().into_owned();
            standard.as_slice().expect("standard layout is contiguous")
        }
    };

    let frame_len = h * w * 3;
    (0..count)
        .map(|i| {
            let data = flat[i * frame_len..(i + 1) * frame_len]
                .iter()
                .map(|&v| (v.clamp(0.0, 1.0) * 255.0).round() as u8)
                .collect();
            RgbFrame {
                data,
                width: w as u32,
                height: h as u32,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_frame(w: u32, h: u32, rgb: [u8; 3]) -> RgbFrame {
        let mut data = vec![0u8; w as usize * h as usize * 3];
        for pixel in data.chunks_exact_mut(3) {
            pixel.copy_from_slice(&rgb);
        }
        RgbFrame::new(data, w, h).unwrap()
    }

    #[test]
    fn quality_mode_batch_sizes() {
        assert_eq!(QualityMode::Fast.batch_size(), 16);
        assert_eq!(QualityMode::Balanced.batch_size(), 8);
        assert_eq!(QualityMode::High.batch_size(), 4);
        assert!(QualityMode::Fast.downscales());
        assert!(!QualityMode::Balanced.downscales());
    }

    #[test]
    fn quality_mode_parses_case_insensitively() {
        assert_eq!("FAST".parse::<QualityMode>().unwrap(), QualityMode::Fast);
        assert_eq!(
            "balanced".parse::<QualityMode>().unwrap(),
            QualityMode::Balanced
        );
        assert!("ultra".parse::<QualityMode>().is_err());
    }

    #[test]
    fn output_resolution_parses_auto_and_explicit() {
        assert_eq!(
            "auto".parse::<OutputResolution>().unwrap(),
            OutputResolution::Auto
        );
        assert_eq!(
            "".parse::<OutputResolution>().unwrap(),
            OutputResolution::Auto
        );
        assert_eq!(
            "1280x720".parse::<OutputResolution>().unwrap(),
            OutputResolution::Explicit {
                width: 1280,
                height: 720
            }
        );
        assert!("1280".parse::<OutputResolution>().is_err());
        assert!("0x720".parse::<OutputResolution>().is_err());
    }

    #[test]
    fn output_resolution_resolves_against_source() {
        assert_eq!(OutputResolution::Auto.resolve(1920, 1080), (1920, 1080));
        assert_eq!(
            OutputResolution::Explicit {
                width: 640,
                height: 360
            }
            .resolve(1920, 1080),
            (640, 360)
        );
    }

    #[test]
    fn frame_new_rejects_wrong_length() {
        assert!(RgbFrame::new(vec![0u8; 5], 2, 2).is_err());
        assert!(RgbFrame::new(vec![0u8; 12], 2, 2).is_ok());
    }

    #[test]
    fn batch_roundtrip_preserves_pixels() {
        let frames = vec![
            solid_frame(4, 2, [255, 0, 128]),
            solid_frame(4, 2, [0, 255, 64]),
        ];
        let batch = frames_to_batch(&frames).unwrap();
        assert_eq!(batch.dim(), (2, 2, 4, 3));
        assert!((batch[(0, 0, 0, 0)] - 1.0).abs() < 1e-6);
        assert!(batch[(1, 0, 0, 0)].abs() < 1e-6);

        let back = batch_to_frames(&batch);
        assert_eq!(back, frames);
    }

    #[test]
    fn batch_to_frames_clamps_out_of_range() {
        let batch = Array4::from_elem((1, 1, 2, 3), 1.5f32);
        let frames = batch_to_frames(&batch);
        assert!(frames[0].data.iter().all(|&v| v == 255));

        let batch = Array4::from_elem((1, 1, 2, 3), -0.25f32);
        let frames = batch_to_frames(&batch);
        assert!(frames[0].data.iter().all(|&v| v == 0));
    }

    #[test]
    fn frames_to_batch_rejects_mixed_dimensions() {
        let frames = vec![solid_frame(4, 2, [0, 0, 0]), solid_frame(2, 2, [0, 0, 0])];
        assert!(frames_to_batch(&frames).is_err());
    }

    #[test]
    fn frames_to_batch_rejects_empty() {
        assert!(frames_to_batch(&[]).is_err());
    }
}

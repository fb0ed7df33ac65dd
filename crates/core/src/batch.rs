//! Batch scheduling and resolution transforms.
//!
//! A clip is processed as a sequence of contiguous frame-index ranges
//! sized by the quality mode. Fast mode additionally samples at half
//! resolution: each batch is downscaled before LUT application and
//! upscaled back afterwards, bilinear both ways, with fixed factors so
//! runs are reproducible.

use std::ops::Range;

use ndarray::Array4;

use crate::types::QualityMode;

/// Fast-mode processing-resolution factor.
pub const FAST_MODE_SCALE: f32 = 0.5;

/// Splits `[0, total)` into contiguous ranges of `batch_size`, the last
/// truncated to fit. The iterator is lazy and can be restarted by
/// calling again.
pub fn batch_ranges(total: usize, batch_size: usize) -> impl Iterator<Item = Range<usize>> {
    assert!(batch_size > 0, "batch size must be positive");
    (0..total)
        .step_by(batch_size)
        .map(move |start| start..(start + batch_size).min(total))
}

/// Ranges for a clip of `total` frames under the given quality mode.
pub fn ranges_for(total: usize, quality: QualityMode) -> impl Iterator<Item = Range<usize>> {
    batch_ranges(total, quality.batch_size())
}

/// Processing dimensions for a batch: halved (rounded down, floor 1) in
/// fast mode, unchanged otherwise.
pub fn processing_dims(quality: QualityMode, width: u32, height: u32) -> (u32, u32) {
    if quality.downscales() {
        (
            ((width as f32 * FAST_MODE_SCALE) as u32).max(1),
            ((height as f32 * FAST_MODE_SCALE) as u32).max(1),
        )
    } else {
        (width, height)
    }
}

/// Bilinear resize of every frame in a `(B, H, W, 3)` batch to
/// `out_h x out_w`. Pixel centers are aligned the same way in both
/// directions, so downscale-then-upscale is stable for flat regions.
pub fn resize_batch(batch: &Array4<f32>, out_h: usize, out_w: usize) -> Array4<f32> {
    let (count, in_h, in_w, _) = batch.dim();
    if in_h == out_h && in_w == out_w {
        return batch.clone();
    }

    let standard;
    let src = match batch.as_slice() {
        Some(slice) => slice,
        None => {
            standard = batch.as_standard_layout().into_owned();
            standard.as_slice().expect("standard layout is contiguous")
        }
    };

    let in_frame = in_h * in_w * 3;
    let out_frame = out_h * out_w * 3;
    let mut dst = vec![0.0f32; count * out_frame];

    for b in 0..count {
        let src_frame = &src[b * in_frame..(b + 1) * in_frame];
        let dst_frame = &mut dst[b * out_frame..(b + 1) * out_frame];
        resize_frame_bilinear(src_frame, in_w, in_h, dst_frame, out_w, out_h);
    }

    Array4::from_shape_vec((count, out_h, out_w, 3), dst)
        .expect("resize output matches computed shape")
}

/// Bilinear interpolation over one HWC f32 frame, destination pixel
/// centers mapped back into source space.
fn resize_frame_bilinear(
    src: &[f32],
    src_w: usize,
    src_h: usize,
    dst: &mut [f32],
    dst_w: usize,
    dst_h: usize,
) {
    for dst_y in 0..dst_h {
        let src_yf = (dst_y as f32 + 0.5) * src_h as f32 / dst_h as f32 - 0.5;
        let src_y0 = src_yf.floor().max(0.0) as usize;
        let src_y1 = (src_y0 + 1).min(src_h - 1);
        let fy = (src_yf - src_y0 as f32).clamp(0.0, 1.0);

        for dst_x in 0..dst_w {
            let src_xf = (dst_x as f32 + 0.5) * src_w as f32 / dst_w as f32 - 0.5;
            let src_x0 = src_xf.floor().max(0.0) as usize;
            let src_x1 = (src_x0 + 1).min(src_w - 1);
            let fx = (src_xf - src_x0 as f32).clamp(0.0, 1.0);

            let di = (dst_y * dst_w + dst_x) * 3;

            for c in 0..3 {
                let p00 = src[(src_y0 * src_w + src_x0) * 3 + c];
                let p10 = src[(src_y0 * src_w + src_x1) * 3 + c];
                let p01 = src[(src_y1 * src_w + src_x0) * 3 + c];
                let p11 = src[(src_y1 * src_w + src_x1) * 3 + c];

                let top = p00 * (1.0 - fx) + p10 * fx;
                let bot = p01 * (1.0 - fx) + p11 * fx;
                dst[di + c] = top * (1.0 - fy) + bot * fy;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_partition_exactly() {
        for (total, size) in [(90usize, 8usize), (16, 16), (17, 16), (100, 4), (1, 8)] {
            let ranges: Vec<_> = batch_ranges(total, size).collect();

            // Contiguous, non-overlapping, covering [0, total).
            assert_eq!(ranges.first().map(|r| r.start), Some(0));
            for pair in ranges.windows(2) {
                assert_eq!(pair[0].end, pair[1].start);
            }
            assert_eq!(ranges.last().map(|r| r.end), Some(total));

            let covered: usize = ranges.iter().map(|r| r.len()).sum();
            assert_eq!(covered, total);

            // All full size except possibly the last.
            for r in &ranges[..ranges.len() - 1] {
                assert_eq!(r.len(), size);
            }
            let tail = total % size;
            let expected_tail = if tail == 0 { size } else { tail };
            assert_eq!(ranges.last().map(|r| r.len()), Some(expected_tail));
        }
    }

    #[test]
    fn ranges_empty_for_zero_frames() {
        assert_eq!(batch_ranges(0, 8).count(), 0);
    }

    #[test]
    fn ranges_are_restartable() {
        let first: Vec<_> = ranges_for(90, QualityMode::Balanced).collect();
        let second: Vec<_> = ranges_for(90, QualityMode::Balanced).collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 12);
        assert_eq!(first.last().map(|r| r.len()), Some(2));
    }

    #[test]
    fn quality_modes_use_expected_batch_sizes() {
        assert_eq!(ranges_for(32, QualityMode::Fast).count(), 2);
        assert_eq!(ranges_for(32, QualityMode::Balanced).count(), 4);
        assert_eq!(ranges_for(32, QualityMode::High).count(), 8);
    }

    #[test]
    fn processing_dims_halved_only_in_fast_mode() {
        assert_eq!(processing_dims(QualityMode::Fast, 1920, 1080), (960, 540));
        assert_eq!(
            processing_dims(QualityMode::Balanced, 1920, 1080),
            (1920, 1080)
        );
        assert_eq!(processing_dims(QualityMode::High, 64, 64), (64, 64));
        // Never collapses to zero.
        assert_eq!(processing_dims(QualityMode::Fast, 1, 1), (1, 1));
    }

    #[test]
    fn resize_identity_is_noop() {
        let batch = Array4::from_shape_fn((2, 4, 4, 3), |(b, y, x, c)| {
            (b + y * 2 + x * 3 + c) as f32 / 10.0
        });
        let out = resize_batch(&batch, 4, 4);
        assert_eq!(out, batch);
    }

    #[test]
    fn resize_preserves_solid_color() {
        let batch = Array4::from_elem((1, 8, 8, 3), 0.6f32);
        let down = resize_batch(&batch, 4, 4);
        assert_eq!(down.dim(), (1, 4, 4, 3));
        for v in down.iter() {
            assert!((v - 0.6).abs() < 1e-6);
        }

        let up = resize_batch(&down, 8, 8);
        assert_eq!(up.dim(), (1, 8, 8, 3));
        for v in up.iter() {
            assert!((v - 0.6).abs() < 1e-6);
        }
    }

    #[test]
    fn resize_stays_within_input_range() {
        let batch = Array4::from_shape_fn((1, 6, 6, 3), |(_, y, x, _)| {
            if (y + x) % 2 == 0 {
                0.0
            } else {
                1.0
            }
        });
        let out = resize_batch(&batch, 3, 9);
        for v in out.iter() {
            assert!((0.0..=1.0).contains(v));
        }
    }

    #[test]
    fn fast_mode_roundtrip_dimensions() {
        let batch = Array4::from_elem((3, 64, 64, 3), 0.25f32);
        let (pw, ph) = processing_dims(QualityMode::Fast, 64, 64);
        let down = resize_batch(&batch, ph as usize, pw as usize);
        assert_eq!(down.dim(), (3, 32, 32, 3));
        let up = resize_batch(&down, 64, 64);
        assert_eq!(up.dim(), (3, 64, 64, 3));
    }
}

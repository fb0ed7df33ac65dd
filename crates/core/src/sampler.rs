//! Trilinear 3-D LUT application.
//!
//! A [`LutVolume`] is a `D x D x D` cube of output RGB triples indexed by
//! input RGB. Each pixel of a frame batch is treated as a coordinate into
//! the cube and replaced by the trilinear blend of the 8 surrounding
//! lattice cells. Coordinates outside `[0, 1]` are clamped before lookup
//! (border policy), so HDR-ish inputs never sample undefined cells.

use anyhow::Result;
use ndarray::Array4;

use crate::error::GradeError;

/// Standard cube edge length for generated LUTs.
pub const DEFAULT_LUT_SIZE: usize = 33;

/// One 3-D lookup volume, shape `(D, D, D, 3)` with values in `[0, 1]`.
///
/// Storage is R-major: the innermost cube axis is red, so axes are
/// `[b_index][g_index][r_index][channel]`, matching the `.cube` file
/// convention. One volume is synthesized per clip and applied to every
/// frame, which keeps the transform temporally stable.
#[derive(Debug, Clone)]
pub struct LutVolume {
    data: Array4<f32>,
    size: usize,
}

impl LutVolume {
    /// Identity (pass-through) volume: output color equals lattice
    /// coordinate at every cell.
    pub fn identity(size: usize) -> Self {
        assert!(size >= 2, "LUT size must be at least 2");
        let n = (size - 1) as f32;
        let data = Array4::from_shape_fn((size, size, size, 3), |(b, g, r, c)| match c {
            0 => r as f32 / n,
            1 => g as f32 / n,
            _ => b as f32 / n,
        });
        Self { data, size }
    }

    /// Builds a volume from a flattened generator output of length
    /// `3 * D^3`. `D` is inferred as the cube root of `len / 3`; a length
    /// whose rounded root does not cube back exactly is a contract
    /// violation and fails with [`GradeError::Shape`].
    pub fn from_flat(flat: Vec<f32>) -> Result<Self> {
        if flat.len() % 3 != 0 {
            return Err(GradeError::Shape(format!(
                "flat LUT length {} is not divisible by 3",
                flat.len()
            ))
            .into());
        }
        let cells = flat.len() / 3;
        let size = (cells as f64).cbrt().round() as usize;
        if size < 2 || size * size * size != cells {
            return Err(GradeError::Shape(format!(
                "flat LUT length {} does not describe a cube: {} cells has no integral cube root",
                flat.len(),
                cells
            ))
            .into());
        }

        let data = Array4::from_shape_vec((size, size, size, 3), flat)
            .map_err(|e| GradeError::Shape(format!("LUT reshape failed: {e}")))?;
        Ok(Self { data, size })
    }

    /// Cube edge length `D`.
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    fn cell(&self, r: usize, g: usize, b: usize) -> [f32; 3] {
        [
            self.data[(b, g, r, 0)],
            self.data[(b, g, r, 1)],
            self.data[(b, g, r, 2)],
        ]
    }

    /// Looks up one RGB triple with clamping and trilinear interpolation.
    /// The result is a convex combination of 8 lattice cells.
    pub fn sample(&self, rgb: [f32; 3]) -> [f32; 3] {
        let n = (self.size - 1) as f32;

        let r = rgb[0].clamp(0.0, 1.0) * n;
        let g = rgb[1].clamp(0.0, 1.0) * n;
        let b = rgb[2].clamp(0.0, 1.0) * n;

        let ri = (r.floor() as usize).min(self.size - 2);
        let gi = (g.floor() as usize).min(self.size - 2);
        let bi = (b.floor() as usize).min(self.size - 2);

        let rf = r - ri as f32;
        let gf = g - gi as f32;
        let bf = b - bi as f32;

        let c000 = self.cell(ri, gi, bi);
        let c100 = self.cell(ri + 1, gi, bi);
        let c010 = self.cell(ri, gi + 1, bi);
        let c110 = self.cell(ri + 1, gi + 1, bi);
        let c001 = self.cell(ri, gi, bi + 1);
        let c101 = self.cell(ri + 1, gi, bi + 1);
        let c011 = self.cell(ri, gi + 1, bi + 1);
        let c111 = self.cell(ri + 1, gi + 1, bi + 1);

        let mut out = [0.0f32; 3];
        for i in 0..3 {
            let c00 = c000[i] * (1.0 - rf) + c100[i] * rf;
            let c01 = c001[i] * (1.0 - rf) + c101[i] * rf;
            let c10 = c010[i] * (1.0 - rf) + c110[i] * rf;
            let c11 = c011[i] * (1.0 - rf) + c111[i] * rf;

            let c0 = c00 * (1.0 - gf) + c10 * gf;
            let c1 = c01 * (1.0 - gf) + c11 * gf;

            out[i] = c0 * (1.0 - bf) + c1 * bf;
        }
        out
    }
}

/// Applies one LUT to a `(B, H, W, 3)` batch, returning a batch of the
/// same shape. The volume is shared across the batch, never copied per
/// frame, and the input is not modified.
pub fn apply_lut(frames: &Array4<f32>, lut: &LutVolume) -> Array4<f32> {
    let dim = frames.dim();
    let standard;
    let flat = match frames.as_slice() {
        Some(slice) => slice,
        None => {
            standard = frames.as_standard_layout().into_owned();
            standard.as_slice().expect("standard layout is contiguous")
        }
    };

    let mut out = Vec::with_capacity(flat.len());
    for px in flat.chunks_exact(3) {
        let graded = lut.sample([px[0], px[1], px[2]]);
        out.extend_from_slice(&graded);
    }

    Array4::from_shape_vec(dim, out).expect("output preserves input shape")
}

//! Deterministic bilinear resampling of `f32` planes.
//!
//! Shared by the preprocessor (image → model resolution) and the explainer
//! (feature-map resolution → image resolution). Uses half-pixel centres with
//! edge clamping, the same sampling grid as OpenCV `INTER_LINEAR`. Bilinear
//! weights are convex, so non-negative inputs stay non-negative.

use ndarray::{Array2, ArrayView2};

/// Source index pair and blend factor for one output coordinate.
#[derive(Debug, Clone, Copy)]
struct Tap {
    lo: usize,
    hi: usize,
    frac: f32,
}

fn taps(src_len: usize, dst_len: usize) -> Vec<Tap> {
    let scale = src_len as f32 / dst_len as f32;
    (0..dst_len)
        .map(|i| {
            let pos = ((i as f32 + 0.5) * scale - 0.5).max(0.0);
            let lo = (pos.floor() as usize).min(src_len - 1);
            let hi = (lo + 1).min(src_len - 1);
            let frac = if hi == lo { 0.0 } else { (pos - lo as f32).clamp(0.0, 1.0) };
            Tap { lo, hi, frac }
        })
        .collect()
}

/// Resize a `(rows, cols)` plane to `(out_rows, out_cols)`.
///
/// An empty source or empty target yields a zero-filled plane of the target
/// size; identical sizes return an exact copy.
pub fn resize_bilinear(plane: ArrayView2<'_, f32>, out_rows: usize, out_cols: usize) -> Array2<f32> {
    let (rows, cols) = plane.dim();
    if rows == 0 || cols == 0 || out_rows == 0 || out_cols == 0 {
        return Array2::zeros((out_rows, out_cols));
    }
    if rows == out_rows && cols == out_cols {
        return plane.to_owned();
    }

    let row_taps = taps(rows, out_rows);
    let col_taps = taps(cols, out_cols);

    let mut out = Array2::zeros((out_rows, out_cols));
    for (y, ry) in row_taps.iter().enumerate() {
        for (x, cx) in col_taps.iter().enumerate() {
            let top = plane[[ry.lo, cx.lo]] * (1.0 - cx.frac) + plane[[ry.lo, cx.hi]] * cx.frac;
            let bottom = plane[[ry.hi, cx.lo]] * (1.0 - cx.frac) + plane[[ry.hi, cx.hi]] * cx.frac;
            out[[y, x]] = top * (1.0 - ry.frac) + bottom * ry.frac;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn identity_size_is_exact_copy() {
        let plane = array![[0.1f32, 0.2], [0.3, 0.4]];
        assert_eq!(resize_bilinear(plane.view(), 2, 2), plane);
    }

    #[test]
    fn constant_plane_stays_constant() {
        let plane = Array2::from_elem((5, 7), 0.25f32);
        let out = resize_bilinear(plane.view(), 13, 3);
        assert_eq!(out.dim(), (13, 3));
        assert!(out.iter().all(|&v| (v - 0.25).abs() < 1e-6));
    }

    #[test]
    fn upsample_interpolates_between_samples() {
        let plane = array![[0.0f32, 1.0]];
        let out = resize_bilinear(plane.view(), 1, 4);
        // Half-pixel grid: positions -0.25, 0.25, 0.75, 1.25 → clamped edges.
        let expected = [0.0, 0.25, 0.75, 1.0];
        for (v, e) in out.iter().zip(expected.iter()) {
            assert!((v - e).abs() < 1e-6, "got {v}, expected {e}");
        }
    }

    #[test]
    fn downsample_averages_pairs() {
        let plane = array![[0.0f32, 1.0, 2.0, 3.0]];
        let out = resize_bilinear(plane.view(), 1, 2);
        assert!((out[[0, 0]] - 0.5).abs() < 1e-6);
        assert!((out[[0, 1]] - 2.5).abs() < 1e-6);
    }

    #[test]
    fn non_negative_input_stays_non_negative() {
        let plane = array![[0.0f32, 0.0, 5.0], [0.0, 1.0, 0.0]];
        let out = resize_bilinear(plane.view(), 17, 23);
        assert!(out.iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn empty_source_yields_zero_plane() {
        let plane = Array2::<f32>::zeros((0, 4));
        let out = resize_bilinear(plane.view(), 3, 3);
        assert_eq!(out, Array2::<f32>::zeros((3, 3)));
    }

    #[test]
    fn resampling_is_deterministic() {
        let plane = Array2::from_shape_fn((9, 11), |(y, x)| ((y * 31 + x * 17) % 13) as f32 / 13.0);
        let a = resize_bilinear(plane.view(), 64, 48);
        let b = resize_bilinear(plane.view(), 64, 48);
        assert!(a.iter().zip(b.iter()).all(|(x, y)| x.to_bits() == y.to_bits()));
    }
}

//! Spatial resampling for CHW frame tensors.
//!
//! The perturbation engine downsamples frames to the classifier's 224×224
//! input with bicubic interpolation and upsamples the averaged gradient back
//! to frame resolution with bilinear interpolation. Both use half-pixel
//! center alignment, matching the convention of the interpolation the
//! surrogate model was calibrated against (`align_corners=false`).

use ndarray::Array3;

/// Bicubic resample of a `(C, H, W)` tensor to `(C, out_h, out_w)`.
pub fn resize_bicubic(src: &Array3<f32>, out_h: usize, out_w: usize) -> Array3<f32> {
    resample(src, out_h, out_w, 2, cubic_weight)
}

/// Bilinear resample of a `(C, H, W)` tensor to `(C, out_h, out_w)`.
pub fn resize_bilinear(src: &Array3<f32>, out_h: usize, out_w: usize) -> Array3<f32> {
    resample(src, out_h, out_w, 1, linear_weight)
}

/// Cubic convolution kernel with a = -0.75.
fn cubic_weight(x: f32) -> f32 {
    const A: f32 = -0.75;
    let x = x.abs();
    if x <= 1.0 {
        ((A + 2.0) * x - (A + 3.0)) * x * x + 1.0
    } else if x < 2.0 {
        ((A * x - 5.0 * A) * x + 8.0 * A) * x - 4.0 * A
    } else {
        0.0
    }
}

fn linear_weight(x: f32) -> f32 {
    (1.0 - x.abs()).max(0.0)
}

/// Generic separable-kernel resampler.
///
/// `taps` is the filter radius in source pixels (1 for linear, 2 for cubic);
/// source indices are clamped at the borders so every output pixel has full
/// kernel support.
fn resample(
    src: &Array3<f32>,
    out_h: usize,
    out_w: usize,
    taps: isize,
    weight: fn(f32) -> f32,
) -> Array3<f32> {
    let (channels, in_h, in_w) = src.dim();
    let mut out = Array3::<f32>::zeros((channels, out_h, out_w));

    let scale_y = in_h as f32 / out_h as f32;
    let scale_x = in_w as f32 / out_w as f32;

    // Precompute per-axis tap indices and normalized weights once; the same
    // row/column geometry applies to every channel.
    let ys = axis_taps(out_h, in_h, scale_y, taps, weight);
    let xs = axis_taps(out_w, in_w, scale_x, taps, weight);

    for c in 0..channels {
        for (oy, (y_idx, y_w)) in ys.iter().enumerate() {
            for (ox, (x_idx, x_w)) in xs.iter().enumerate() {
                let mut acc = 0.0;
                for (iy, wy) in y_idx.iter().zip(y_w) {
                    for (ix, wx) in x_idx.iter().zip(x_w) {
                        acc += src[(c, *iy, *ix)] * wy * wx;
                    }
                }
                out[(c, oy, ox)] = acc;
            }
        }
    }
    out
}

type Taps = (Vec<usize>, Vec<f32>);

fn axis_taps(out_len: usize, in_len: usize, scale: f32, taps: isize, weight: fn(f32) -> f32) -> Vec<Taps> {
    (0..out_len)
        .map(|o| {
            // Half-pixel center mapping.
            let center = (o as f32 + 0.5) * scale - 0.5;
            let base = center.floor() as isize;

            let mut idx = Vec::with_capacity((2 * taps) as usize);
            let mut w = Vec::with_capacity((2 * taps) as usize);
            for t in (1 - taps)..=taps {
                let i = base + t;
                idx.push(i.clamp(0, in_len as isize - 1) as usize);
                w.push(weight(center - i as f32));
            }
            // Normalize so border clamping never changes overall gain.
            let sum: f32 = w.iter().sum();
            if sum != 0.0 {
                for v in &mut w {
                    *v /= sum;
                }
            }
            (idx, w)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn constant_frame(value: f32, h: usize, w: usize) -> Array3<f32> {
        Array3::from_elem((3, h, w), value)
    }

    #[test]
    fn constant_input_stays_constant() {
        let resizers: [fn(&Array3<f32>, usize, usize) -> Array3<f32>; 2] =
            [resize_bicubic, resize_bilinear];
        for resize in resizers {
            let out = resize(&constant_frame(0.37, 48, 64), 224, 224);
            assert_eq!(out.dim(), (3, 224, 224));
            for v in out.iter() {
                assert!((v - 0.37).abs() < 1e-5, "gain drifted: {v}");
            }
        }
    }

    #[test]
    fn identity_size_is_near_lossless() {
        let mut src = Array3::<f32>::zeros((1, 8, 8));
        for y in 0..8 {
            for x in 0..8 {
                src[(0, y, x)] = (y * 8 + x) as f32 / 64.0;
            }
        }
        let out = resize_bilinear(&src, 8, 8);
        for (a, b) in src.iter().zip(out.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn bilinear_interpolates_between_neighbors() {
        // Two columns, black then white; the upsampled middle must land
        // strictly between them.
        let mut src = Array3::<f32>::zeros((1, 1, 2));
        src[(0, 0, 1)] = 1.0;
        let out = resize_bilinear(&src, 1, 4);
        assert!(out[(0, 0, 0)] < out[(0, 0, 1)]);
        assert!(out[(0, 0, 1)] < out[(0, 0, 2)]);
        assert!(out[(0, 0, 2)] < out[(0, 0, 3)]);
    }

    #[test]
    fn cubic_weight_has_unit_peak_and_compact_support() {
        assert!((cubic_weight(0.0) - 1.0).abs() < 1e-6);
        assert_eq!(cubic_weight(2.0), 0.0);
        assert_eq!(cubic_weight(3.0), 0.0);
        assert!((cubic_weight(1.0)).abs() < 1e-6);
    }
}

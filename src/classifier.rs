//! Fixed surrogate image classifier.
//!
//! The perturbation engine needs a frozen model whose forward and backward
//! passes yield stable input gradients; it never needs training, checkpoints
//! or real-world accuracy. This is a small convolutional network with
//! deterministically seeded weights and an analytic input-gradient pass:
//!
//! conv 3→8 (3×3, stride 2) → ReLU → avgpool 2×2 →
//! conv 8→16 (3×3, stride 2) → ReLU → global avgpool → linear 16→64 logits
//!
//! The contract with the engine is the 224×224 normalized input and a
//! gradient of the (argmax-label) cross-entropy, scaled by [`LOSS_SCALE`],
//! with respect to that input.

use ndarray::{Array1, Array2, Array3, Array4};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Side length of the classifier input.
pub const INPUT_SIZE: usize = 224;

/// Per-channel normalization mean.
pub const NORM_MEAN: [f32; 3] = [0.485, 0.456, 0.406];

/// Per-channel normalization std.
pub const NORM_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Cross-entropy multiplier applied before the backward pass.
pub const LOSS_SCALE: f32 = 3.0;

const CLASSES: usize = 64;
const WEIGHT_SEED: u64 = 0x6d69_7261_6765;

/// Gradient result of one forward+backward pass.
pub struct InputGradient {
    /// Argmax label the loss was computed against.
    pub label: usize,
    /// Scaled cross-entropy at that label.
    pub loss: f32,
    /// d(loss)/d(input), same `(3, 224, 224)` shape as the input.
    pub grad: Array3<f32>,
}

pub struct Classifier {
    conv1: Conv,
    conv2: Conv,
    fc_w: Array2<f32>,
    fc_b: Array1<f32>,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Classifier {
    /// Build the network with its fixed weights. Every instance is identical,
    /// so the model can be constructed once and shared read-only across
    /// workers.
    pub fn new() -> Self {
        let mut rng = SmallRng::seed_from_u64(WEIGHT_SEED);
        let conv1 = Conv::seeded(&mut rng, 8, 3, 3, 2, 1);
        let conv2 = Conv::seeded(&mut rng, 16, 8, 3, 2, 1);

        let fan_in = 16.0_f32;
        let scale = (2.0 / fan_in).sqrt();
        let fc_w = Array2::from_shape_fn((CLASSES, 16), |_| normal(&mut rng) * scale);
        let fc_b = Array1::zeros(CLASSES);

        Self {
            conv1,
            conv2,
            fc_w,
            fc_b,
        }
    }

    /// Forward + backward: cross-entropy on the argmax label, scaled by
    /// [`LOSS_SCALE`], differentiated with respect to the `(3, 224, 224)`
    /// normalized input.
    pub fn input_gradient(&self, x: &Array3<f32>) -> InputGradient {
        debug_assert_eq!(x.dim(), (3, INPUT_SIZE, INPUT_SIZE));

        // Forward, caching pre-activation maps for the ReLU masks.
        let a1 = self.conv1.forward(x); // (8, 112, 112)
        let r1 = relu(&a1);
        let p1 = avgpool2(&r1); // (8, 56, 56)
        let a2 = self.conv2.forward(&p1); // (16, 28, 28)
        let r2 = relu(&a2);
        let feats = global_avgpool(&r2); // (16,)
        let logits = self.fc_w.dot(&feats) + &self.fc_b;

        let label = argmax(&logits);
        let probs = softmax(&logits);
        let loss = -probs[label].max(f32::MIN_POSITIVE).ln() * LOSS_SCALE;

        // Backward.
        let mut dlogits = probs;
        dlogits[label] -= 1.0;
        dlogits *= LOSS_SCALE;

        let dfeats = self.fc_w.t().dot(&dlogits);
        let (_, h2, w2) = r2.dim();
        let mut dr2 = Array3::zeros(r2.dim());
        let inv_area = 1.0 / (h2 * w2) as f32;
        for c in 0..dr2.dim().0 {
            let g = dfeats[c] * inv_area;
            dr2.index_axis_mut(ndarray::Axis(0), c).fill(g);
        }
        let da2 = relu_backward(&a2, &dr2);
        let dp1 = self.conv2.input_gradient(&da2, p1.dim());
        let dr1 = avgpool2_backward(&dp1, r1.dim());
        let da1 = relu_backward(&a1, &dr1);
        let grad = self.conv1.input_gradient(&da1, x.dim());

        InputGradient { label, loss, grad }
    }

    /// Scaled cross-entropy at a fixed label; used by the finite-difference
    /// gradient check, where the argmax must not flip between probes.
    #[cfg(test)]
    fn loss_for_label(&self, x: &Array3<f32>, label: usize) -> f32 {
        let r1 = relu(&self.conv1.forward(x));
        let p1 = avgpool2(&r1);
        let r2 = relu(&self.conv2.forward(&p1));
        let feats = global_avgpool(&r2);
        let logits = self.fc_w.dot(&feats) + &self.fc_b;
        let probs = softmax(&logits);
        -probs[label].max(f32::MIN_POSITIVE).ln() * LOSS_SCALE
    }
}

/// 2-D convolution with square kernels and zero padding.
struct Conv {
    /// `(out_channels, in_channels, k, k)`
    w: Array4<f32>,
    b: Array1<f32>,
    stride: usize,
    pad: usize,
}

impl Conv {
    fn seeded(
        rng: &mut SmallRng,
        out_ch: usize,
        in_ch: usize,
        k: usize,
        stride: usize,
        pad: usize,
    ) -> Self {
        let fan_in = (in_ch * k * k) as f32;
        let scale = (2.0 / fan_in).sqrt();
        Self {
            w: Array4::from_shape_fn((out_ch, in_ch, k, k), |_| normal(rng) * scale),
            b: Array1::zeros(out_ch),
            stride,
            pad,
        }
    }

    fn out_len(&self, in_len: usize) -> usize {
        (in_len + 2 * self.pad - self.w.dim().2) / self.stride + 1
    }

    fn forward(&self, x: &Array3<f32>) -> Array3<f32> {
        let (out_ch, in_ch, k, _) = self.w.dim();
        let (_, in_h, in_w) = x.dim();
        let (out_h, out_w) = (self.out_len(in_h), self.out_len(in_w));
        let mut out = Array3::zeros((out_ch, out_h, out_w));

        for oc in 0..out_ch {
            for oy in 0..out_h {
                for ox in 0..out_w {
                    let mut acc = self.b[oc];
                    for ic in 0..in_ch {
                        for ky in 0..k {
                            let iy = (oy * self.stride + ky) as isize - self.pad as isize;
                            if iy < 0 || iy >= in_h as isize {
                                continue;
                            }
                            for kx in 0..k {
                                let ix = (ox * self.stride + kx) as isize - self.pad as isize;
                                if ix < 0 || ix >= in_w as isize {
                                    continue;
                                }
                                acc += self.w[(oc, ic, ky, kx)] * x[(ic, iy as usize, ix as usize)];
                            }
                        }
                    }
                    out[(oc, oy, ox)] = acc;
                }
            }
        }
        out
    }

    /// Scatter `dout` back through the convolution to the input shape.
    fn input_gradient(
        &self,
        dout: &Array3<f32>,
        in_dim: (usize, usize, usize),
    ) -> Array3<f32> {
        let (out_ch, in_ch, k, _) = self.w.dim();
        let (_, in_h, in_w) = in_dim;
        let (_, out_h, out_w) = dout.dim();
        let mut dx = Array3::zeros(in_dim);

        for oc in 0..out_ch {
            for oy in 0..out_h {
                for ox in 0..out_w {
                    let g = dout[(oc, oy, ox)];
                    if g == 0.0 {
                        continue;
                    }
                    for ic in 0..in_ch {
                        for ky in 0..k {
                            let iy = (oy * self.stride + ky) as isize - self.pad as isize;
                            if iy < 0 || iy >= in_h as isize {
                                continue;
                            }
                            for kx in 0..k {
                                let ix = (ox * self.stride + kx) as isize - self.pad as isize;
                                if ix < 0 || ix >= in_w as isize {
                                    continue;
                                }
                                dx[(ic, iy as usize, ix as usize)] +=
                                    self.w[(oc, ic, ky, kx)] * g;
                            }
                        }
                    }
                }
            }
        }
        dx
    }
}

fn normal(rng: &mut SmallRng) -> f32 {
    // Box-free: sum of uniforms is close enough to Gaussian for a fixed
    // random feature extractor (Irwin-Hall with n=12, variance 1).
    (0..12).map(|_| rng.r#gen::<f32>()).sum::<f32>() - 6.0
}

fn relu(x: &Array3<f32>) -> Array3<f32> {
    x.mapv(|v| v.max(0.0))
}

fn relu_backward(pre: &Array3<f32>, dout: &Array3<f32>) -> Array3<f32> {
    let mut dx = dout.clone();
    dx.zip_mut_with(pre, |d, &a| {
        if a <= 0.0 {
            *d = 0.0;
        }
    });
    dx
}

fn avgpool2(x: &Array3<f32>) -> Array3<f32> {
    let (c, h, w) = x.dim();
    let (oh, ow) = (h / 2, w / 2);
    let mut out = Array3::zeros((c, oh, ow));
    for ch in 0..c {
        for y in 0..oh {
            for xo in 0..ow {
                out[(ch, y, xo)] = (x[(ch, 2 * y, 2 * xo)]
                    + x[(ch, 2 * y, 2 * xo + 1)]
                    + x[(ch, 2 * y + 1, 2 * xo)]
                    + x[(ch, 2 * y + 1, 2 * xo + 1)])
                    * 0.25;
            }
        }
    }
    out
}

fn avgpool2_backward(dout: &Array3<f32>, in_dim: (usize, usize, usize)) -> Array3<f32> {
    let (c, oh, ow) = dout.dim();
    let mut dx = Array3::zeros(in_dim);
    for ch in 0..c {
        for y in 0..oh {
            for xo in 0..ow {
                let g = dout[(ch, y, xo)] * 0.25;
                dx[(ch, 2 * y, 2 * xo)] = g;
                dx[(ch, 2 * y, 2 * xo + 1)] = g;
                dx[(ch, 2 * y + 1, 2 * xo)] = g;
                dx[(ch, 2 * y + 1, 2 * xo + 1)] = g;
            }
        }
    }
    dx
}

fn global_avgpool(x: &Array3<f32>) -> Array1<f32> {
    let (c, h, w) = x.dim();
    let inv = 1.0 / (h * w) as f32;
    Array1::from_iter(
        (0..c).map(|ch| x.index_axis(ndarray::Axis(0), ch).sum() * inv),
    )
}

fn argmax(v: &Array1<f32>) -> usize {
    let mut best = 0;
    for i in 1..v.len() {
        if v[i] > v[best] {
            best = i;
        }
    }
    best
}

fn softmax(v: &Array1<f32>) -> Array1<f32> {
    let max = v.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let exp = v.mapv(|x| (x - max).exp());
    let sum = exp.sum();
    exp / sum
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_input() -> Array3<f32> {
        // A smooth, non-constant image in normalized space.
        Array3::from_shape_fn((3, INPUT_SIZE, INPUT_SIZE), |(c, y, x)| {
            ((x as f32 * 0.07).sin() + (y as f32 * 0.05).cos()) * 0.5 + c as f32 * 0.1
        })
    }

    #[test]
    fn weights_are_deterministic_across_instances() {
        let a = Classifier::new();
        let b = Classifier::new();
        let x = test_input();
        let ga = a.input_gradient(&x);
        let gb = b.input_gradient(&x);
        assert_eq!(ga.label, gb.label);
        assert_eq!(ga.grad, gb.grad);
    }

    #[test]
    fn gradient_is_finite_and_nonzero_for_a_textured_input() {
        let model = Classifier::new();
        let x = test_input();
        let res = model.input_gradient(&x);

        assert!(res.label < CLASSES);
        assert!(res.loss.is_finite() && res.loss >= 0.0);
        assert!(res.grad.iter().all(|v| v.is_finite()));
        let l1: f32 = res.grad.iter().map(|v| v.abs()).sum();
        assert!(l1 > 0.0, "gradient collapsed to zero");
    }

    #[test]
    fn analytic_gradient_matches_finite_differences() {
        let model = Classifier::new();
        let x = test_input();
        let res = model.input_gradient(&x);

        let h = 1e-2_f32;
        // Probe a few scattered coordinates against central differences.
        for &(c, y, xx) in &[(0usize, 10usize, 10usize), (1, 100, 57), (2, 200, 190)] {
            let mut xp = x.clone();
            xp[(c, y, xx)] += h;
            let mut xm = x.clone();
            xm[(c, y, xx)] -= h;
            let numeric =
                (model.loss_for_label(&xp, res.label) - model.loss_for_label(&xm, res.label))
                    / (2.0 * h);
            let analytic = res.grad[(c, y, xx)];
            assert!(
                (numeric - analytic).abs() <= 1e-2 + 0.2 * analytic.abs().max(numeric.abs()),
                "grad mismatch at ({c},{y},{xx}): numeric {numeric} vs analytic {analytic}"
            );
        }
    }

    #[test]
    fn softmax_sums_to_one() {
        let v = Array1::from_vec(vec![1.0, 2.0, 3.0, -5.0]);
        let p = softmax(&v);
        assert!((p.sum() - 1.0).abs() < 1e-6);
        assert_eq!(argmax(&v), 2);
    }
}

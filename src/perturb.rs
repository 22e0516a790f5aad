//! Adversarial frame perturbation.
//!
//! For each selected frame the engine computes a bounded, imperceptible
//! additive perturbation that maximally increases the surrogate classifier's
//! cross-entropy on its own predicted label:
//!
//! 1. bicubic-downsample the frame to 224×224 and normalize;
//! 2. run K expectation-over-transformation iterations, each drawing cheap
//!    random augmentations and accumulating the input gradient;
//! 3. bilinear-upsample the averaged gradient back to frame resolution;
//! 4. take one sign-of-gradient step of magnitude ε·strength in normalized
//!    space, denormalize and clip to [0, 1].
//!
//! Averaging over random augmentations keeps the perturbation effective after
//! downstream re-encodes; the sign step bounds the per-channel L∞ distance by
//! ε·strength in normalized space.

use image::RgbImage;
use ndarray::Array3;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::classifier::{Classifier, INPUT_SIZE, NORM_MEAN, NORM_STD};
use crate::resize::{resize_bicubic, resize_bilinear};

/// EOT iterations per frame.
pub const NUM_EOT: usize = 4;

const NOISE_SIGMA: f32 = 0.008;
const JITTER_SPAN: f32 = 0.08;

pub struct PerturbationEngine {
    classifier: Classifier,
    num_eot: usize,
}

impl Default for PerturbationEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PerturbationEngine {
    pub fn new() -> Self {
        Self {
            classifier: Classifier::new(),
            num_eot: NUM_EOT,
        }
    }

    /// Perturb an RGB frame. `epsilon · strength` bounds the normalized-space
    /// L∞ step. Returns a frame of identical dimensions.
    pub fn perturb_image(
        &self,
        frame: &RgbImage,
        epsilon: f32,
        strength: f32,
        rng: &mut impl Rng,
    ) -> RgbImage {
        let tensor = image_to_tensor(frame);
        let out = self.perturb_tensor(&tensor, epsilon * strength, rng);
        tensor_to_image(&out)
    }

    /// Core contract on a `(3, H, W)` tensor with values in [0, 1].
    ///
    /// Frames whose shorter side is below 2 px are returned unchanged, as is
    /// any frame whose accumulated gradient is exactly zero (degenerate).
    pub fn perturb_tensor(
        &self,
        frame: &Array3<f32>,
        budget: f32,
        rng: &mut impl Rng,
    ) -> Array3<f32> {
        let (_, h, w) = frame.dim();
        if h.min(w) < 2 {
            return frame.clone();
        }

        let small = resize_bicubic(frame, INPUT_SIZE, INPUT_SIZE);
        let small_norm = normalize(&small);

        let mut total_grad = Array3::<f32>::zeros(small_norm.dim());
        for _ in 0..self.num_eot {
            let augmented = random_distortion(&small_norm, rng);
            let res = self.classifier.input_gradient(&augmented);
            total_grad += &res.grad;
        }

        if total_grad.iter().all(|&g| g == 0.0) {
            return frame.clone();
        }

        let avg_grad = total_grad / self.num_eot as f32;
        let grad_full = resize_bilinear(&avg_grad, h, w);

        let mut perturbed = normalize(frame);
        perturbed.zip_mut_with(&grad_full, |p, &g| {
            *p += budget * sign(g);
        });
        denormalize_clipped(&perturbed)
    }
}

/// Three-valued sign: zero gradient contributes no step (unlike `signum`,
/// which maps 0.0 to 1.0).
fn sign(g: f32) -> f32 {
    if g > 0.0 {
        1.0
    } else if g < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// Cheap augmentations drawn independently per EOT iteration:
/// Gaussian noise with p = 0.5, brightness/contrast jitter with p = 0.4.
fn random_distortion(tensor: &Array3<f32>, rng: &mut impl Rng) -> Array3<f32> {
    let mut t = tensor.clone();

    if rng.gen_bool(0.5) {
        t.mapv_inplace(|v| {
            let z: f32 = rng.sample(StandardNormal);
            v + z * NOISE_SIGMA
        });
    }

    if rng.gen_bool(0.4) {
        let brightness = 1.0 + JITTER_SPAN * (rng.r#gen::<f32>() - 0.5) * 2.0;
        t *= brightness;

        let contrast = 1.0 + JITTER_SPAN * (rng.r#gen::<f32>() - 0.5) * 2.0;
        let mean = t.mean().unwrap_or(0.0);
        t.mapv_inplace(|v| mean + (v - mean) * contrast);
    }

    t
}

fn normalize(frame: &Array3<f32>) -> Array3<f32> {
    let mut out = frame.clone();
    for c in 0..3 {
        out.index_axis_mut(ndarray::Axis(0), c)
            .mapv_inplace(|v| (v - NORM_MEAN[c]) / NORM_STD[c]);
    }
    out
}

fn denormalize_clipped(frame: &Array3<f32>) -> Array3<f32> {
    let mut out = frame.clone();
    for c in 0..3 {
        out.index_axis_mut(ndarray::Axis(0), c)
            .mapv_inplace(|v| (v * NORM_STD[c] + NORM_MEAN[c]).clamp(0.0, 1.0));
    }
    out
}

fn image_to_tensor(img: &RgbImage) -> Array3<f32> {
    let (w, h) = img.dimensions();
    Array3::from_shape_fn((3, h as usize, w as usize), |(c, y, x)| {
        img.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
    })
}

fn tensor_to_image(tensor: &Array3<f32>) -> RgbImage {
    let (_, h, w) = tensor.dim();
    RgbImage::from_fn(w as u32, h as u32, |x, y| {
        let px = |c: usize| {
            (tensor[(c, y as usize, x as usize)] * 255.0)
                .round()
                .clamp(0.0, 255.0) as u8
        };
        image::Rgb([px(0), px(1), px(2)])
    })
}

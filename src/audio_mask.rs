//! Psychoacoustically shaped audio masking.
//!
//! Adds an additive disturbance to a 16 kHz mono track: Gaussian noise at a
//! level-dependent sigma plus a fixed 17 kHz carrier, both scaled by the
//! signal's own short-time RMS envelope. Envelope shaping keeps the injection
//! below the instantaneous auditory threshold while the carrier targets ASR
//! front-ends.

use std::path::Path;

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use ndarray::Array1;
use rand::Rng;
use rand_distr::StandardNormal;
use tracing::info;

use crate::error::{Error, Result};
use crate::task::AudioLevel;

/// The pipeline always extracts audio at this rate.
pub const SAMPLE_RATE: u32 = 16_000;

const CARRIER_HZ: f32 = 17_000.0;
const CARRIER_AMPLITUDE: f32 = 0.0028;
const RMS_FRAME: usize = 2048;
const RMS_HOP: usize = 512;
const ENVELOPE_FLOOR: f32 = 0.04;
const ENVELOPE_EXPONENT: f32 = 1.5;
const CLIP: f32 = 0.999;

/// Mask a PCM-16 WAV file in place of a copy: read `input`, write the masked
/// track to `output` with the same sample rate and duration.
pub fn mask_wav(
    input: &Path,
    output: &Path,
    level: AudioLevel,
    rng: &mut impl Rng,
) -> Result<()> {
    let Some(sigma) = level.sigma() else {
        return Err(Error::Internal("mask_wav called with audio_level none".into()));
    };

    let (samples, spec) = read_mono_wav(input)?;
    let masked = mask_samples(&samples, sigma, spec.sample_rate, rng);
    write_mono_wav(output, &masked, spec.sample_rate)?;
    info!(level = ?level, output = %output.display(), "audio masking applied");
    Ok(())
}

/// Core masking transform on raw samples in [-1, 1].
pub fn mask_samples(
    samples: &[f32],
    sigma: f32,
    sample_rate: u32,
    rng: &mut impl Rng,
) -> Vec<f32> {
    let envelope = rms_envelope(samples);

    samples
        .iter()
        .enumerate()
        .map(|(i, &y)| {
            let t = i as f32 / sample_rate as f32;
            let carrier = CARRIER_AMPLITUDE * (2.0 * std::f32::consts::PI * CARRIER_HZ * t).sin();
            let z: f32 = rng.sample(StandardNormal);
            let injected = (z * sigma + carrier) * envelope[i];
            (y + injected).clamp(-CLIP, CLIP)
        })
        .collect()
}

/// Per-sample envelope: frame-level RMS, linearly interpolated to signal
/// length, peak-normalized, floored at [`ENVELOPE_FLOOR`] and raised to
/// [`ENVELOPE_EXPONENT`].
fn rms_envelope(samples: &[f32]) -> Array1<f32> {
    let len = samples.len();
    let n_frames = len.div_ceil(RMS_HOP).max(1);

    let mut rms = Vec::with_capacity(n_frames);
    for f in 0..n_frames {
        let start = f * RMS_HOP;
        let end = (start + RMS_FRAME).min(len);
        let frame = &samples[start..end];
        let energy: f32 = frame.iter().map(|v| v * v).sum();
        rms.push((energy / frame.len().max(1) as f32).sqrt());
    }

    let peak = rms.iter().cloned().fold(0.0_f32, f32::max);

    let mut env = Array1::zeros(len);
    for (i, slot) in env.iter_mut().enumerate() {
        // Map sample position onto the frame axis and interpolate.
        let pos = if len > 1 {
            i as f32 * (n_frames - 1) as f32 / (len - 1) as f32
        } else {
            0.0
        };
        let lo = pos.floor() as usize;
        let hi = (lo + 1).min(n_frames - 1);
        let frac = pos - lo as f32;
        let value = rms[lo] * (1.0 - frac) + rms[hi] * frac;

        *slot = (value / (peak + 1e-8))
            .clamp(ENVELOPE_FLOOR, 1.0)
            .powf(ENVELOPE_EXPONENT);
    }
    env
}

/// Read a mono 16 kHz PCM-16 WAV into [-1, 1] floats.
fn read_mono_wav(path: &Path) -> Result<(Vec<f32>, WavSpec)> {
    let mut reader = WavReader::open(path)
        .map_err(|err| Error::AudioIo(format!("failed to open {}: {err}", path.display())))?;

    let spec = reader.spec();
    if spec.channels != 1 {
        return Err(Error::AudioIo(format!(
            "expected mono WAV, got {} channels",
            spec.channels
        )));
    }
    if spec.sample_rate != SAMPLE_RATE {
        return Err(Error::AudioIo(format!(
            "expected {SAMPLE_RATE} Hz, got {}",
            spec.sample_rate
        )));
    }

    let mut samples = Vec::new();
    for s in reader.samples::<i16>() {
        let v = s.map_err(|err| Error::AudioIo(err.to_string()))? as f32 / i16::MAX as f32;
        samples.push(v);
    }

    if samples.is_empty() {
        return Err(Error::AudioEmpty);
    }
    Ok((samples, spec))
}

fn write_mono_wav(path: &Path, samples: &[f32], sample_rate: u32) -> Result<()> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path, spec)
        .map_err(|err| Error::AudioIo(format!("failed to create {}: {err}", path.display())))?;
    for &v in samples {
        let q = (v * i16::MAX as f32).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        writer
            .write_sample(q)
            .map_err(|err| Error::AudioIo(err.to_string()))?;
    }
    writer
        .finalize()
        .map_err(|err| Error::AudioIo(err.to_string()))?;
    Ok(())
}

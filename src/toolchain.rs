//! Media toolchain adapter.
//!
//! Frame decoding, audio resampling and muxing are delegated to an external
//! ffmpeg/ffprobe pair. The adapter is a capability trait with one production
//! implementor that shells out, so the pipeline can be exercised in tests by a
//! recorder that captures exact argument lists without launching processes.
//!
//! Errors: a non-zero exit is surfaced as a generic toolchain failure carrying
//! a stderr excerpt. The adapter never interprets stderr to classify errors.

use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Geometry and timing of a video file, as reported by the probe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoInfo {
    pub fps: f64,
    pub total_frames: u64,
    pub width: u32,
    pub height: u32,
    /// Container duration in seconds.
    pub duration: f64,
}

impl VideoInfo {
    /// Width and height rounded down to even values (codec requirement).
    pub fn even_dimensions(&self) -> (u32, u32) {
        (self.width - self.width % 2, self.height - self.height % 2)
    }
}

/// Available encoder, strongest first: HEVC hardware, H.264 hardware, CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoder {
    HevcNvenc,
    H264Nvenc,
    Cpu,
}

impl Encoder {
    pub fn codec_name(self) -> &'static str {
        match self {
            Self::HevcNvenc => "hevc_nvenc",
            Self::H264Nvenc => "h264_nvenc",
            Self::Cpu => "libx264",
        }
    }

    pub fn is_hardware(self) -> bool {
        !matches!(self, Self::Cpu)
    }
}

/// CRF for a recompression, from the target/original size ratio.
///
/// Gentler targets keep more quality; aggressive ones trade it for size.
pub fn crf_for_ratio(size_ratio: f64) -> u32 {
    if size_ratio >= 0.8 {
        18
    } else if size_ratio >= 0.6 {
        20
    } else if size_ratio >= 0.4 {
        23
    } else {
        26
    }
}

/// The external media toolchain as a capability interface.
pub trait MediaToolchain: Send + Sync {
    /// Confirm the toolchain binary is present and runnable.
    fn verify(&self) -> Result<()>;

    /// Read fps, frame count and geometry from a video file.
    fn probe(&self, input: &Path) -> Result<VideoInfo>;

    /// Pick the strongest available encoder.
    fn probe_encoders(&self) -> Encoder;

    /// Dump every frame as `frame_%06d.png` (numbered from 1) into `dir`,
    /// scaled to the given even geometry.
    fn extract_frames(&self, input: &Path, dir: &Path, width: u32, height: u32) -> Result<()>;

    /// Extract the audio track as 16 kHz mono PCM-16, metadata stripped.
    fn extract_audio(&self, input: &Path, out_wav: &Path) -> Result<()>;

    /// Assemble `frame_%06d.png` files and an audio track into the output.
    fn mux(
        &self,
        frames_pattern: &Path,
        audio: &Path,
        fps: f64,
        output: &Path,
        encoder: Encoder,
    ) -> Result<()>;

    /// Stream-copy with all metadata removed.
    fn strip_metadata(&self, input: &Path, output: &Path) -> Result<()>;

    /// CPU H.264 re-encode at the given CRF, resolution preserved.
    fn compress(&self, input: &Path, output: &Path, crf: u32, width: u32, height: u32)
    -> Result<()>;
}

/// Production implementor that shells out to ffmpeg/ffprobe.
pub struct FfmpegToolchain {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl FfmpegToolchain {
    /// `ffprobe` is resolved by name substitution on the ffmpeg path, which
    /// matches how the two binaries are distributed together.
    pub fn new(ffmpeg: impl Into<PathBuf>) -> Self {
        let ffmpeg: PathBuf = ffmpeg.into();
        let ffprobe = derive_ffprobe_path(&ffmpeg);
        Self { ffmpeg, ffprobe }
    }

    fn run(&self, program: &Path, args: &[String], context: &str) -> Result<Vec<u8>> {
        debug!(program = %program.display(), ?args, "running toolchain");
        let output = Command::new(program).args(args).output().map_err(|err| {
            Error::Internal(format!("failed to launch {}: {err}", program.display()))
        })?;

        if !output.status.success() {
            return Err(Error::toolchain(context, &output.stderr));
        }
        Ok(output.stdout)
    }

    fn run_ffmpeg(&self, args: &[String], context: &str) -> Result<()> {
        self.run(&self.ffmpeg, args, context).map(|_| ())
    }
}

fn derive_ffprobe_path(ffmpeg: &Path) -> PathBuf {
    let name = ffmpeg
        .file_name()
        .map(|n| n.to_string_lossy().replace("ffmpeg", "ffprobe"))
        .unwrap_or_else(|| "ffprobe".to_owned());
    match ffmpeg.parent() {
        Some(parent) if parent != Path::new("") => parent.join(name),
        _ => PathBuf::from(name),
    }
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| (*s).to_owned()).collect()
}

fn path_str(p: &Path) -> String {
    p.to_string_lossy().into_owned()
}

#[derive(Deserialize)]
struct ProbeDoc {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    nb_frames: Option<String>,
}

#[derive(Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

/// Parse ffprobe's `r_frame_rate` rational (e.g. `"30000/1001"`).
fn parse_frame_rate(raw: &str) -> Option<f64> {
    match raw.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            (den != 0.0).then_some(num / den)
        }
        None => raw.trim().parse().ok(),
    }
}

impl MediaToolchain for FfmpegToolchain {
    fn verify(&self) -> Result<()> {
        self.run(&self.ffmpeg, &args(&["-version"]), "ffmpeg is not runnable")
            .map(|_| ())
    }

    fn probe(&self, input: &Path) -> Result<VideoInfo> {
        let argv = args(&[
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height,r_frame_rate,nb_frames",
            "-show_entries",
            "format=duration",
            "-of",
            "json",
            &path_str(input),
        ]);
        let stdout = self.run(&self.ffprobe, &argv, "ffprobe failed")?;
        let doc: ProbeDoc = serde_json::from_slice(&stdout)
            .map_err(|err| Error::Internal(format!("unparseable ffprobe output: {err}")))?;

        let stream = doc
            .streams
            .first()
            .ok_or_else(|| Error::Internal(format!("no video stream in {}", input.display())))?;

        let fps = stream
            .r_frame_rate
            .as_deref()
            .and_then(parse_frame_rate)
            .unwrap_or(0.0);
        let duration = doc
            .format
            .and_then(|f| f.duration)
            .and_then(|d| d.parse::<f64>().ok())
            .unwrap_or(0.0);
        // Some containers don't carry nb_frames; estimate from duration.
        let total_frames = stream
            .nb_frames
            .as_deref()
            .and_then(|n| n.parse::<u64>().ok())
            .unwrap_or_else(|| (duration * fps).round() as u64);

        let info = VideoInfo {
            fps,
            total_frames,
            width: stream.width.unwrap_or(0),
            height: stream.height.unwrap_or(0),
            duration,
        };
        if info.fps <= 0.0 || info.total_frames == 0 {
            return Err(Error::Internal(format!(
                "could not read video parameters from {}",
                input.display()
            )));
        }
        Ok(info)
    }

    fn probe_encoders(&self) -> Encoder {
        let stdout = match self.run(&self.ffmpeg, &args(&["-codecs"]), "codec probe failed") {
            Ok(out) => out,
            Err(err) => {
                warn!(%err, "encoder probe failed, using CPU encoder");
                return Encoder::Cpu;
            }
        };
        let listing = String::from_utf8_lossy(&stdout);
        if listing.contains("hevc_nvenc") {
            Encoder::HevcNvenc
        } else if listing.contains("h264_nvenc") {
            Encoder::H264Nvenc
        } else {
            Encoder::Cpu
        }
    }

    fn extract_frames(&self, input: &Path, dir: &Path, width: u32, height: u32) -> Result<()> {
        self.run_ffmpeg(
            &extract_frames_args(input, dir, width, height),
            "frame extraction failed",
        )
    }

    fn extract_audio(&self, input: &Path, out_wav: &Path) -> Result<()> {
        self.run_ffmpeg(&extract_audio_args(input, out_wav), "audio extraction failed")
    }

    fn mux(
        &self,
        frames_pattern: &Path,
        audio: &Path,
        fps: f64,
        output: &Path,
        encoder: Encoder,
    ) -> Result<()> {
        self.run_ffmpeg(
            &mux_args(frames_pattern, audio, fps, output, encoder),
            "mux failed",
        )
    }

    fn strip_metadata(&self, input: &Path, output: &Path) -> Result<()> {
        self.run_ffmpeg(&strip_args(input, output), "metadata strip failed")
    }

    fn compress(
        &self,
        input: &Path,
        output: &Path,
        crf: u32,
        width: u32,
        height: u32,
    ) -> Result<()> {
        self.run_ffmpeg(
            &compress_args(input, output, crf, width, height),
            "compression failed",
        )
    }
}

// Argument-list builders, kept as pure functions so the exact invocation
// forms are testable without launching processes.

fn extract_frames_args(input: &Path, dir: &Path, width: u32, height: u32) -> Vec<String> {
    let pattern = dir.join("frame_%06d.png");
    args(&[
        "-y",
        "-i",
        &path_str(input),
        "-vf",
        &format!("scale={width}:{height}"),
        &path_str(&pattern),
    ])
}

fn extract_audio_args(input: &Path, out_wav: &Path) -> Vec<String> {
    args(&[
        "-y",
        "-i",
        &path_str(input),
        "-vn",
        "-acodec",
        "pcm_s16le",
        "-ar",
        "16000",
        "-map_metadata",
        "-1",
        &path_str(out_wav),
    ])
}

fn mux_args(
    frames_pattern: &Path,
    audio: &Path,
    fps: f64,
    output: &Path,
    encoder: Encoder,
) -> Vec<String> {
    let mut argv = args(&[
        "-y",
        "-framerate",
        &fps.to_string(),
        "-i",
        &path_str(frames_pattern),
        "-i",
        &path_str(audio),
        "-c:v",
        encoder.codec_name(),
        "-pix_fmt",
        "yuv420p",
    ]);
    if encoder.is_hardware() {
        argv.extend(args(&["-rc", "vbr", "-cq", "23", "-preset", "fast"]));
    } else {
        argv.extend(args(&["-preset", "fast"]));
    }
    argv.extend(args(&[
        "-c:a",
        "aac",
        "-b:a",
        "128k",
        "-shortest",
        "-map_metadata",
        "-1",
        &path_str(output),
    ]));
    argv
}

fn strip_args(input: &Path, output: &Path) -> Vec<String> {
    args(&[
        "-y",
        "-i",
        &path_str(input),
        "-c:v",
        "copy",
        "-c:a",
        "copy",
        "-map_metadata",
        "-1",
        &path_str(output),
    ])
}

fn compress_args(input: &Path, output: &Path, crf: u32, width: u32, height: u32) -> Vec<String> {
    args(&[
        "-y",
        "-i",
        &path_str(input),
        "-c:v",
        "libx264",
        "-crf",
        &crf.to_string(),
        "-preset",
        "slow",
        "-vf",
        &format!("scale={width}:{height}"),
        "-c:a",
        "aac",
        "-b:a",
        "192k",
        &path_str(output),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn even_dimensions_round_down() {
        let info = VideoInfo {
            fps: 30.0,
            total_frames: 150,
            width: 641,
            height: 479,
            duration: 5.0,
        };
        assert_eq!(info.even_dimensions(), (640, 478));
    }

    #[test]
    fn frame_rate_parses_rationals_and_plain_numbers() {
        assert_eq!(parse_frame_rate("30/1"), Some(30.0));
        let ntsc = parse_frame_rate("30000/1001").unwrap();
        assert!((ntsc - 29.97).abs() < 0.01);
        assert_eq!(parse_frame_rate("25"), Some(25.0));
        assert_eq!(parse_frame_rate("30/0"), None);
        assert_eq!(parse_frame_rate("garbage"), None);
    }

    #[test]
    fn crf_table_follows_the_size_ratio() {
        assert_eq!(crf_for_ratio(0.9), 18);
        assert_eq!(crf_for_ratio(0.8), 18);
        assert_eq!(crf_for_ratio(0.7), 20);
        assert_eq!(crf_for_ratio(0.5), 23);
        assert_eq!(crf_for_ratio(0.31), 26);
        assert_eq!(crf_for_ratio(0.1), 26);
    }

    #[test]
    fn ffprobe_path_derives_from_ffmpeg() {
        let tc = FfmpegToolchain::new("/opt/media/bin/ffmpeg");
        assert_eq!(tc.ffprobe, PathBuf::from("/opt/media/bin/ffprobe"));

        let tc = FfmpegToolchain::new("ffmpeg");
        assert_eq!(tc.ffprobe, PathBuf::from("ffprobe"));
    }

    #[test]
    fn extract_audio_invocation_is_exact() {
        let argv = extract_audio_args(Path::new("in.mp4"), Path::new("out.wav"));
        assert_eq!(
            argv,
            vec![
                "-y",
                "-i",
                "in.mp4",
                "-vn",
                "-acodec",
                "pcm_s16le",
                "-ar",
                "16000",
                "-map_metadata",
                "-1",
                "out.wav",
            ]
        );
    }

    #[test]
    fn strip_invocation_is_exact() {
        let argv = strip_args(Path::new("in.mp4"), Path::new("out.mp4"));
        assert_eq!(
            argv,
            vec![
                "-y",
                "-i",
                "in.mp4",
                "-c:v",
                "copy",
                "-c:a",
                "copy",
                "-map_metadata",
                "-1",
                "out.mp4",
            ]
        );
    }

    #[test]
    fn hardware_mux_uses_vbr_quality_23() {
        let argv = mux_args(
            Path::new("t/frame_%06d.png"),
            Path::new("t/audio.wav"),
            30.0,
            Path::new("out.mp4"),
            Encoder::HevcNvenc,
        );
        assert_eq!(
            argv,
            vec![
                "-y",
                "-framerate",
                "30",
                "-i",
                "t/frame_%06d.png",
                "-i",
                "t/audio.wav",
                "-c:v",
                "hevc_nvenc",
                "-pix_fmt",
                "yuv420p",
                "-rc",
                "vbr",
                "-cq",
                "23",
                "-preset",
                "fast",
                "-c:a",
                "aac",
                "-b:a",
                "128k",
                "-shortest",
                "-map_metadata",
                "-1",
                "out.mp4",
            ]
        );
    }

    #[test]
    fn cpu_mux_swaps_codec_and_drops_the_rate_control_flags() {
        let argv = mux_args(
            Path::new("t/frame_%06d.png"),
            Path::new("t/audio.wav"),
            29.97,
            Path::new("out.mp4"),
            Encoder::Cpu,
        );
        let joined = argv.join(" ");
        assert!(joined.contains("-c:v libx264 -pix_fmt yuv420p -preset fast"));
        assert!(!joined.contains("-rc vbr"));
        assert!(joined.contains("-framerate 29.97"));
    }

    #[test]
    fn compress_invocation_is_exact() {
        let argv = compress_args(Path::new("in.mp4"), Path::new("out.mp4"), 26, 1280, 720);
        assert_eq!(
            argv,
            vec![
                "-y",
                "-i",
                "in.mp4",
                "-c:v",
                "libx264",
                "-crf",
                "26",
                "-preset",
                "slow",
                "-vf",
                "scale=1280:720",
                "-c:a",
                "aac",
                "-b:a",
                "192k",
                "out.mp4",
            ]
        );
    }

    #[test]
    fn frame_extraction_scales_to_even_geometry() {
        let argv = extract_frames_args(Path::new("in.mp4"), Path::new("t"), 640, 478);
        assert_eq!(
            argv,
            vec![
                "-y",
                "-i",
                "in.mp4",
                "-vf",
                "scale=640:478",
                "t/frame_%06d.png",
            ]
        );
    }

    #[test]
    fn encoder_names() {
        assert_eq!(Encoder::HevcNvenc.codec_name(), "hevc_nvenc");
        assert_eq!(Encoder::H264Nvenc.codec_name(), "h264_nvenc");
        assert_eq!(Encoder::Cpu.codec_name(), "libx264");
        assert!(Encoder::HevcNvenc.is_hardware());
        assert!(!Encoder::Cpu.is_hardware());
    }
}

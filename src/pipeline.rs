//! Per-task pipeline runner.
//!
//! A worker hands the runner an exclusively claimed task; the runner drives
//! the media toolchain, perturbation engine and audio masker end to end,
//! writing progress back into the store and polling for cancellation at the
//! documented checkpoints (between frames, after the audio phase, before mux,
//! and once more after mux for the late-cancel case).
//!
//! Progress marks: protect tasks hit 10/50/75/95/100 at the phase boundaries;
//! strip and compress tasks hit 20/90/100.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::SeedableRng;
use rand::rngs::SmallRng;
use tracing::{info, warn};

use crate::audio_mask;
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::perturb::PerturbationEngine;
use crate::store::{TaskStore, TaskUpdate};
use crate::task::{AudioLevel, CompressParams, ProtectParams, TaskParams, TaskRecord, TaskStatus};
use crate::toolchain::{MediaToolchain, crf_for_ratio};

pub struct PipelineRunner {
    store: Arc<TaskStore>,
    toolchain: Arc<dyn MediaToolchain>,
    engine: Arc<PerturbationEngine>,
    config: ServerConfig,
}

/// Filesystem names a task owns, all derived from its id so tasks never
/// contend for paths.
struct TaskPaths {
    input: PathBuf,
    frames_dir: PathBuf,
    audio_orig: PathBuf,
    audio_adv: PathBuf,
}

impl PipelineRunner {
    pub fn new(
        store: Arc<TaskStore>,
        toolchain: Arc<dyn MediaToolchain>,
        engine: Arc<PerturbationEngine>,
        config: ServerConfig,
    ) -> Self {
        Self {
            store,
            toolchain,
            engine,
            config,
        }
    }

    /// Run one claimed task to completion.
    ///
    /// Returns `Ok(true)` when the task completed, `Ok(false)` when it was
    /// abandoned because the record left PROCESSING (cancellation or a
    /// supervisor timeout). Errors are the caller's cue to mark the task
    /// FAILED.
    pub fn run(&self, task: &TaskRecord) -> Result<bool> {
        info!(task_id = %task.id, kind = ?task.kind(), "processing task");
        match task.params.clone() {
            TaskParams::Protect(params) => self.run_protect(task, params),
            TaskParams::StripMetadata => self.run_strip(task),
            TaskParams::Compress(params) => self.run_compress(task, params),
        }
    }

    fn run_protect(&self, task: &TaskRecord, params: ProtectParams) -> Result<bool> {
        let paths = self.paths_for(task);
        let output = self.output_path(task, "protected");

        if !paths.input.exists() {
            return Err(Error::Internal(format!(
                "input file not found: {}",
                paths.input.display()
            )));
        }

        // Admission and probe.
        let info = self.toolchain.probe(&paths.input)?;
        let (width, height) = info.even_dimensions();
        let every_n = params.every_n.max(1) as u64;
        let eligible_frames = info.total_frames.div_ceil(every_n);
        info!(
            task_id = %task.id,
            frames = info.total_frames,
            fps = info.fps,
            width,
            height,
            "video probed"
        );
        self.store.update(
            &task.id,
            TaskUpdate {
                progress: Some(10.0),
                total_frames: Some(eligible_frames),
                ..Default::default()
            },
        )?;

        // Frame pass.
        if paths.frames_dir.exists() {
            std::fs::remove_dir_all(&paths.frames_dir)?;
        }
        std::fs::create_dir_all(&paths.frames_dir)?;
        self.toolchain
            .extract_frames(&paths.input, &paths.frames_dir, width, height)?;

        let mut rng = SmallRng::from_entropy();
        let mut perturbed_frames = 0u64;
        for idx in 1..=info.total_frames {
            if self.should_abandon(&task.id) {
                self.discard_temp(&paths);
                return Ok(false);
            }
            if idx % every_n != 0 {
                continue;
            }

            let frame_path = paths.frames_dir.join(format!("frame_{idx:06}.png"));
            match perturb_frame_file(
                &self.engine,
                &frame_path,
                params.epsilon,
                params.strength,
                &mut rng,
            ) {
                Ok(()) => perturbed_frames += 1,
                Err(err) => {
                    // A single bad frame keeps its original pixels.
                    warn!(task_id = %task.id, frame = idx, %err, "frame perturbation failed");
                }
            }
        }
        self.store.update(
            &task.id,
            TaskUpdate {
                progress: Some(50.0),
                processed_frames: Some(perturbed_frames),
                ..Default::default()
            },
        )?;

        // Audio phase. Failures here downgrade to the unmasked track; they
        // never fail the task.
        let mut final_audio = paths.audio_orig.clone();
        if let Err(err) = self
            .toolchain
            .extract_audio(&paths.input, &paths.audio_orig)
        {
            warn!(task_id = %task.id, %err, "audio extraction failed");
        }
        if self.should_abandon(&task.id) {
            self.discard_temp(&paths);
            return Ok(false);
        }

        if params.audio_level != AudioLevel::None {
            match audio_mask::mask_wav(
                &paths.audio_orig,
                &paths.audio_adv,
                params.audio_level,
                &mut rng,
            ) {
                Ok(()) => final_audio = paths.audio_adv.clone(),
                Err(err) => {
                    warn!(task_id = %task.id, %err, "audio masking failed, using unmasked audio");
                }
            }
        }
        if self.should_abandon(&task.id) {
            self.discard_temp(&paths);
            return Ok(false);
        }
        self.store.update(
            &task.id,
            TaskUpdate {
                progress: Some(75.0),
                ..Default::default()
            },
        )?;

        if self.should_abandon(&task.id) {
            self.discard_temp(&paths);
            return Ok(false);
        }

        // Mux. Not interruptible once started.
        let encoder = self.toolchain.probe_encoders();
        let frames_pattern = paths.frames_dir.join("frame_%06d.png");
        self.toolchain
            .mux(&frames_pattern, &final_audio, info.fps, &output, encoder)?;
        self.store.update(
            &task.id,
            TaskUpdate {
                progress: Some(95.0),
                ..Default::default()
            },
        )?;

        // Late cancellation: the output exists but must not survive.
        if self.should_abandon(&task.id) {
            if let Err(err) = std::fs::remove_file(&output) {
                warn!(task_id = %task.id, %err, "failed to unlink output of cancelled task");
            }
            self.discard_temp(&paths);
            return Ok(false);
        }

        // Cleanup and metadata strip.
        self.discard_temp(&paths);
        self.remove_input(&paths);
        self.strip_in_place(&output)?;

        self.complete(task, &output)
    }

    fn run_strip(&self, task: &TaskRecord) -> Result<bool> {
        let paths = self.paths_for(task);
        let output = self.output_path(task, "cleaned");

        if !paths.input.exists() {
            return Err(Error::Internal(format!(
                "input file not found: {}",
                paths.input.display()
            )));
        }
        self.store.update(
            &task.id,
            TaskUpdate {
                progress: Some(20.0),
                ..Default::default()
            },
        )?;

        if self.should_abandon(&task.id) {
            return Ok(false);
        }
        self.toolchain.strip_metadata(&paths.input, &output)?;
        self.store.update(
            &task.id,
            TaskUpdate {
                progress: Some(90.0),
                ..Default::default()
            },
        )?;

        if self.should_abandon(&task.id) {
            let _ = std::fs::remove_file(&output);
            return Ok(false);
        }

        self.remove_input(&paths);
        self.complete(task, &output)
    }

    fn run_compress(&self, task: &TaskRecord, params: CompressParams) -> Result<bool> {
        let paths = self.paths_for(task);
        let output = self.output_path(task, "compressed");

        if !paths.input.exists() {
            return Err(Error::Internal(format!(
                "input file not found: {}",
                paths.input.display()
            )));
        }

        let info = self.toolchain.probe(&paths.input)?;
        let original_mb = file_size_mb(&paths.input)?;
        let ratio = if original_mb > 0.0 {
            params.target_mb as f64 / original_mb
        } else {
            0.5
        };
        let crf = crf_for_ratio(ratio);
        info!(
            task_id = %task.id,
            original_mb,
            target_mb = params.target_mb,
            crf,
            "compressing"
        );
        self.store.update(
            &task.id,
            TaskUpdate {
                progress: Some(20.0),
                ..Default::default()
            },
        )?;

        if self.should_abandon(&task.id) {
            return Ok(false);
        }
        self.toolchain
            .compress(&paths.input, &output, crf, info.width, info.height)?;
        self.store.update(
            &task.id,
            TaskUpdate {
                progress: Some(90.0),
                ..Default::default()
            },
        )?;

        if self.should_abandon(&task.id) {
            let _ = std::fs::remove_file(&output);
            return Ok(false);
        }

        self.remove_input(&paths);
        self.complete(task, &output)
    }

    /// True when the record has left PROCESSING (cancelled by a caller, or
    /// timed out by the supervisor) and the worker must abandon its work.
    fn should_abandon(&self, task_id: &str) -> bool {
        match self.store.get(task_id) {
            Some(rec) => rec.status != TaskStatus::Processing,
            None => true,
        }
    }

    /// Record completion. A cancel can still land between the last checkpoint
    /// and this transition; the store rejects the illegal Cancelled→Completed
    /// move, and the fresh output is unlinked so nothing survives the cancel.
    fn complete(&self, task: &TaskRecord, output: &Path) -> Result<bool> {
        let output_name = output
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let size_mb = file_size_mb(output)?;
        let res = self.store.update(
            &task.id,
            TaskUpdate {
                status: Some(TaskStatus::Completed),
                output_name: Some(output_name),
                output_size_mb: Some(size_mb),
                progress: Some(100.0),
                ..Default::default()
            },
        );
        if res.is_err() && self.should_abandon(&task.id) {
            let _ = std::fs::remove_file(output);
            return Ok(false);
        }
        res?;
        info!(task_id = %task.id, output = %output.display(), size_mb, "task completed");
        Ok(true)
    }

    /// Strip metadata off the finished artifact in place: encode next to it,
    /// then rename over.
    fn strip_in_place(&self, output: &Path) -> Result<()> {
        let tmp = output.with_extension("tmp.mp4");
        self.toolchain.strip_metadata(output, &tmp)?;
        std::fs::rename(&tmp, output)?;
        Ok(())
    }

    fn discard_temp(&self, paths: &TaskPaths) {
        if paths.frames_dir.exists()
            && let Err(err) = std::fs::remove_dir_all(&paths.frames_dir)
        {
            warn!(%err, dir = %paths.frames_dir.display(), "failed to remove temp frames");
        }
        for wav in [&paths.audio_orig, &paths.audio_adv] {
            if wav.exists() {
                let _ = std::fs::remove_file(wav);
            }
        }
    }

    fn remove_input(&self, paths: &TaskPaths) {
        if paths.input.exists()
            && let Err(err) = std::fs::remove_file(&paths.input)
        {
            warn!(%err, input = %paths.input.display(), "failed to remove input file");
        }
    }

    fn paths_for(&self, task: &TaskRecord) -> TaskPaths {
        let base = file_stem(&task.input_name);
        let temp = self.config.temp_dir();
        TaskPaths {
            input: self.config.input_dir().join(&task.input_name),
            frames_dir: temp.join(format!("{}_{base}_frames", task.id)),
            audio_orig: temp.join(format!("{}_{base}_audio_orig.wav", task.id)),
            audio_adv: temp.join(format!("{}_{base}_audio_adv.wav", task.id)),
        }
    }

    fn output_path(&self, task: &TaskRecord, suffix: &str) -> PathBuf {
        let base = file_stem(&task.input_name);
        self.config
            .output_dir()
            .join(format!("{}_{base}_{suffix}.mp4", task.id))
    }
}

fn file_stem(name: &str) -> String {
    Path::new(name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_owned())
}

fn file_size_mb(path: &Path) -> Result<f64> {
    let len = std::fs::metadata(path)?.len();
    Ok(len as f64 / (1024.0 * 1024.0))
}

/// Load, perturb and rewrite a single frame file.
fn perturb_frame_file(
    engine: &PerturbationEngine,
    path: &Path,
    epsilon: f32,
    strength: f32,
    rng: &mut SmallRng,
) -> Result<()> {
    let img = image::open(path)
        .map_err(|err| Error::FrameIo(format!("{}: {err}", path.display())))?
        .to_rgb8();
    let perturbed = engine.perturb_image(&img, epsilon, strength, rng);
    perturbed
        .save(path)
        .map_err(|err| Error::FrameIo(format!("{}: {err}", path.display())))
}

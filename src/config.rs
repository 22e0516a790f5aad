//! Server configuration and on-disk layout.
//!
//! Every path the service touches lives under a single server root:
//!
//! - `videos_input`  — uploaded artifacts awaiting processing
//! - `videos_output` — finished artifacts served by `/download`
//! - `videos_temp`   — per-task frame dumps and intermediate audio
//! - `server_logs`   — the plain-text server log
//! - `queue_db`      — the persisted task store (`tasks.json`)
//!
//! `bootstrap` creates whatever is missing and verifies the layout is usable
//! before the server accepts work.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::task::AudioLevel;

/// Upload extensions the admission check accepts.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["mp4", "mov", "avi", "mkv", "webm"];

/// Runtime configuration for the service.
///
/// This struct represents *library-level configuration*, not CLI flags
/// directly. The launcher maps user input into this type so other frontends
/// (tests, batch jobs) can construct configurations programmatically.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Directory the five service folders are created under.
    pub root: PathBuf,

    /// Host interface the HTTP server binds to.
    pub host: String,

    /// TCP port the HTTP server listens on.
    pub port: u16,

    /// Number of media-processing workers.
    pub workers: usize,

    /// Name or path of the ffmpeg binary. `ffprobe` is derived from it by
    /// name substitution, matching how the two tools ship together.
    pub ffmpeg: String,

    /// Default perturbation budget for protect tasks.
    pub default_epsilon: f32,

    /// Default perturbation strength multiplier.
    pub default_strength: f32,

    /// Default audio masking level.
    pub default_audio_level: AudioLevel,

    /// Default frame stride: perturb every n-th frame.
    pub default_every_n: u32,

    /// Upload size cap in GiB.
    pub max_video_size_gb: u64,

    /// Maximum tasks in PROCESSING at once; uploads beyond it get 429.
    pub max_concurrent_tasks: usize,

    /// Tasks PROCESSING longer than this are failed by the supervisor.
    pub task_timeout_hours: i64,

    /// Default age for `/cleanup` and the scheduled sweep.
    pub auto_cleanup_days: i64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            host: "127.0.0.1".to_owned(),
            port: 8000,
            workers: 3,
            ffmpeg: "ffmpeg".to_owned(),
            default_epsilon: 0.120,
            default_strength: 1.0,
            default_audio_level: AudioLevel::Weak,
            default_every_n: 10,
            max_video_size_gb: 2,
            max_concurrent_tasks: 3,
            task_timeout_hours: 24,
            auto_cleanup_days: 7,
        }
    }
}

impl ServerConfig {
    pub fn input_dir(&self) -> PathBuf {
        self.root.join("videos_input")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join("videos_output")
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.root.join("videos_temp")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("server_logs")
    }

    pub fn queue_db_dir(&self) -> PathBuf {
        self.root.join("queue_db")
    }

    /// Path of the persisted task store document.
    pub fn tasks_db_path(&self) -> PathBuf {
        self.queue_db_dir().join("tasks.json")
    }

    /// Upload size cap in bytes.
    pub fn max_video_size_bytes(&self) -> u64 {
        self.max_video_size_gb * 1024 * 1024 * 1024
    }

    /// Create missing service directories and verify the logs directory is
    /// writable. Toolchain presence is verified separately by the launcher so
    /// a test configuration never needs a real ffmpeg on PATH.
    pub fn bootstrap(&self) -> Result<()> {
        for dir in [
            self.input_dir(),
            self.output_dir(),
            self.temp_dir(),
            self.logs_dir(),
            self.queue_db_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|err| {
                Error::Internal(format!("failed to create {}: {err}", dir.display()))
            })?;
        }

        verify_writable(&self.logs_dir())?;
        Ok(())
    }
}

/// Touch-and-remove a probe file to confirm write access.
fn verify_writable(dir: &Path) -> Result<()> {
    let probe = dir.join(".write_probe");
    std::fs::write(&probe, b"")
        .map_err(|err| Error::Internal(format!("{} is not writable: {err}", dir.display())))?;
    let _ = std::fs::remove_file(&probe);
    Ok(())
}

//! Task records: the persisted unit of work.
//!
//! A record is created by the upload handlers, mutated by the worker that owns
//! it (and by the cancel handler), and deleted only by the cleanup sweep once
//! terminal. The store in [`crate::store`] enforces the status transition
//! graph; this module defines the shapes and the per-kind parameter schemas.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Lifecycle state of a task.
///
/// Transitions are exactly `PENDING → PROCESSING → {COMPLETED, FAILED,
/// CANCELLED}`, plus direct cancellation from PENDING or PROCESSING. The three
/// right-hand states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the transition graph permits `self → to`.
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Pending, Processing)
                | (Pending, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// The three task variants the service runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Protect,
    StripMetadata,
    Compress,
}

/// Audio masking intensity.
///
/// The canonical set is exactly these four spellings; anything else is
/// rejected at the HTTP boundary. `None` leaves the extracted track untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioLevel {
    None,
    Weak,
    Medium,
    Strong,
}

impl AudioLevel {
    /// Gaussian sigma for the masking noise, or `None` when masking is off.
    pub fn sigma(self) -> Option<f32> {
        match self {
            Self::None => None,
            Self::Weak => Some(0.0035),
            Self::Medium => Some(0.0050),
            Self::Strong => Some(0.0080),
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Self::None),
            "weak" => Ok(Self::Weak),
            "medium" => Ok(Self::Medium),
            "strong" => Ok(Self::Strong),
            other => Err(Error::BadRequest(format!(
                "unknown audio_level '{other}' (expected none, weak, medium or strong)"
            ))),
        }
    }
}

/// Parameters of a full adversarial-protection run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProtectParams {
    /// L∞ perturbation budget in normalized space.
    pub epsilon: f32,
    /// Multiplier applied to `epsilon` for the sign step.
    pub strength: f32,
    /// Perturb every n-th frame.
    pub every_n: u32,
    pub audio_level: AudioLevel,
}

impl ProtectParams {
    pub fn validate(&self) -> Result<()> {
        if !(0.01..=0.5).contains(&self.epsilon) {
            return Err(Error::BadRequest(format!(
                "epsilon {} out of range [0.01, 0.5]",
                self.epsilon
            )));
        }
        if !(0.1..=2.0).contains(&self.strength) {
            return Err(Error::BadRequest(format!(
                "strength {} out of range [0.1, 2.0]",
                self.strength
            )));
        }
        if !(1..=30).contains(&self.every_n) {
            return Err(Error::BadRequest(format!(
                "every_n {} out of range [1, 30]",
                self.every_n
            )));
        }
        Ok(())
    }
}

/// Parameters of a bitrate-targeted recompression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressParams {
    /// Target output size in megabytes.
    pub target_mb: u64,
}

impl CompressParams {
    pub fn validate(&self) -> Result<()> {
        if !(5..=500).contains(&self.target_mb) {
            return Err(Error::BadRequest(format!(
                "target_size_mb {} out of range [5, 500]",
                self.target_mb
            )));
        }
        Ok(())
    }
}

/// Per-kind task parameters.
///
/// Externally tagged so the persisted document reads as
/// `"params": {"protect": {…}}`; the kind is derived from the variant rather
/// than stored twice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskParams {
    Protect(ProtectParams),
    StripMetadata,
    Compress(CompressParams),
}

impl TaskParams {
    pub fn kind(&self) -> TaskKind {
        match self {
            Self::Protect(_) => TaskKind::Protect,
            Self::StripMetadata => TaskKind::StripMetadata,
            Self::Compress(_) => TaskKind::Compress,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Protect(p) => p.validate(),
            Self::StripMetadata => Ok(()),
            Self::Compress(p) => p.validate(),
        }
    }
}

/// First 8 hex chars of a fresh v4 UUID; used for task ids and upload
/// filename prefixes.
pub fn short_uid() -> String {
    let id = Uuid::new_v4().simple().to_string();
    id[..8].to_owned()
}

/// The persisted unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    /// Filename of the uploaded artifact inside the input directory.
    pub input_name: String,
    pub params: TaskParams,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// [0, 100]; non-decreasing until the task terminalizes.
    pub progress: f32,
    #[serde(default)]
    pub processed_frames: u64,
    #[serde(default)]
    pub total_frames: u64,
    #[serde(default)]
    pub output_name: Option<String>,
    #[serde(default)]
    pub output_size_mb: Option<f64>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl TaskRecord {
    pub fn new(
        input_name: impl Into<String>,
        params: TaskParams,
        user_id: Option<String>,
        notes: Option<String>,
    ) -> Self {
        Self {
            id: short_uid(),
            input_name: input_name.into(),
            params,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            progress: 0.0,
            processed_frames: 0,
            total_frames: 0,
            output_name: None,
            output_size_mb: None,
            error_message: None,
            user_id,
            notes,
        }
    }

    pub fn kind(&self) -> TaskKind {
        self.params.kind()
    }

    /// The projection served by `GET /task/{id}` and `/tasks`.
    pub fn public(&self) -> PublicTask {
        PublicTask {
            task_id: self.id.clone(),
            kind: self.kind(),
            status: self.status,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            progress: self.progress,
            processed_frames: self.processed_frames,
            total_frames: self.total_frames,
            input_name: self.input_name.clone(),
            output_name: self.output_name.clone(),
            output_size_mb: self.output_size_mb,
            error_message: self.error_message.clone(),
            params: self.params.clone(),
            user_id: self.user_id.clone(),
        }
    }
}

/// Public view of a task record; `notes` stays private to the store.
#[derive(Debug, Clone, Serialize)]
pub struct PublicTask {
    pub task_id: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: f32,
    pub processed_frames: u64,
    pub total_frames: u64,
    pub input_name: String,
    pub output_name: Option<String>,
    pub output_size_mb: Option<f64>,
    pub error_message: Option<String>,
    pub params: TaskParams,
    pub user_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_graph_matches_the_lifecycle() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(Processing.can_transition_to(Cancelled));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Failed));
        assert!(!Processing.can_transition_to(Pending));
        for terminal in [Completed, Failed, Cancelled] {
            for to in [Pending, Processing, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(to));
            }
        }
    }

    #[test]
    fn audio_level_parses_only_the_canonical_set() {
        assert_eq!(AudioLevel::parse("weak").unwrap(), AudioLevel::Weak);
        assert_eq!(AudioLevel::parse("none").unwrap(), AudioLevel::None);
        assert!(AudioLevel::parse("Weak").is_err());
        assert!(AudioLevel::parse("soft").is_err());
        assert!(AudioLevel::parse("").is_err());
    }

    #[test]
    fn audio_level_sigmas() {
        assert_eq!(AudioLevel::None.sigma(), None);
        assert_eq!(AudioLevel::Weak.sigma(), Some(0.0035));
        assert_eq!(AudioLevel::Medium.sigma(), Some(0.0050));
        assert_eq!(AudioLevel::Strong.sigma(), Some(0.0080));
    }

    #[test]
    fn protect_params_validate_ranges() {
        let ok = ProtectParams {
            epsilon: 0.12,
            strength: 1.0,
            every_n: 10,
            audio_level: AudioLevel::Weak,
        };
        assert!(ok.validate().is_ok());

        assert!(ProtectParams { epsilon: 0.6, ..ok }.validate().is_err());
        assert!(ProtectParams { epsilon: 0.001, ..ok }.validate().is_err());
        assert!(ProtectParams { strength: 2.5, ..ok }.validate().is_err());
        assert!(ProtectParams { every_n: 0, ..ok }.validate().is_err());
        assert!(ProtectParams { every_n: 31, ..ok }.validate().is_err());
    }

    #[test]
    fn compress_params_validate_range() {
        assert!(CompressParams { target_mb: 5 }.validate().is_ok());
        assert!(CompressParams { target_mb: 500 }.validate().is_ok());
        assert!(CompressParams { target_mb: 4 }.validate().is_err());
        assert!(CompressParams { target_mb: 501 }.validate().is_err());
    }

    #[test]
    fn short_uid_is_8_hex_chars() {
        let id = short_uid();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn record_round_trips_through_json() -> anyhow::Result<()> {
        let rec = TaskRecord::new(
            "abc_clip.mp4",
            TaskParams::Protect(ProtectParams {
                epsilon: 0.12,
                strength: 1.0,
                every_n: 10,
                audio_level: AudioLevel::Weak,
            }),
            Some("u1".into()),
            None,
        );
        let json = serde_json::to_string(&rec)?;
        let back: TaskRecord = serde_json::from_str(&json)?;
        assert_eq!(back.id, rec.id);
        assert_eq!(back.params, rec.params);
        assert_eq!(back.status, TaskStatus::Pending);
        assert_eq!(back.created_at, rec.created_at);
        Ok(())
    }
}

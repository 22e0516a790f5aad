//! Durable task store.
//!
//! An in-memory id → record map persisted as one pretty-printed JSON document
//! at `queue_db/tasks.json`. Every mutation rewrites the document while
//! holding the store lock, via a temp-file rename so a crash mid-write never
//! corrupts the queue. Reads copy records out and release the lock
//! immediately.
//!
//! The store is the only place task state changes: it enforces the status
//! transition graph and the progress/timestamp coupling invariants, so callers
//! cannot drive a record into an inconsistent shape.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::task::{TaskRecord, TaskStatus};

/// Field updates applied atomically by [`TaskStore::update`].
///
/// Only the fields a worker legitimately mutates are here; identity and
/// parameters are immutable after creation.
#[derive(Debug, Default, Clone)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub progress: Option<f32>,
    pub processed_frames: Option<u64>,
    pub total_frames: Option<u64>,
    pub output_name: Option<String>,
    pub output_size_mb: Option<f64>,
    pub error_message: Option<String>,
}

/// Queue counters served by `/stats`, `/health` and `/`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct QueueStats {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

pub struct TaskStore {
    inner: Mutex<Inner>,
}

struct Inner {
    tasks: HashMap<String, TaskRecord>,
    db_path: PathBuf,
}

impl TaskStore {
    /// Open the store, loading any persisted document.
    ///
    /// Malformed records are logged and dropped rather than aborting startup.
    /// Records found in PROCESSING are reset to PENDING (their `started_at`
    /// cleared) so a worker re-claims them; no task is lost across a crash.
    pub fn open(db_path: PathBuf) -> Result<Self> {
        let mut tasks = HashMap::new();

        if db_path.exists() {
            let raw = std::fs::read_to_string(&db_path)?;
            let doc: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&raw)
                .map_err(|err| {
                    Error::Internal(format!("task db {} is unreadable: {err}", db_path.display()))
                })?;

            for (id, value) in doc {
                match serde_json::from_value::<TaskRecord>(value) {
                    Ok(mut rec) => {
                        if rec.status == TaskStatus::Processing {
                            info!(task_id = %id, "resetting interrupted task to pending");
                            rec.status = TaskStatus::Pending;
                            rec.started_at = None;
                        }
                        tasks.insert(id, rec);
                    }
                    Err(err) => {
                        warn!(task_id = %id, %err, "dropping malformed task record");
                    }
                }
            }
            info!(count = tasks.len(), "loaded task records");
        }

        let store = Self {
            inner: Mutex::new(Inner { tasks, db_path }),
        };
        // Persist immediately so the reset-to-pending policy survives a crash
        // that happens before the first mutation.
        store.with_inner(|inner| inner.persist())?;
        Ok(store)
    }

    fn with_inner<T>(&self, f: impl FnOnce(&mut Inner) -> Result<T>) -> Result<T> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| Error::Internal("task store lock poisoned".into()))?;
        f(&mut inner)
    }

    /// Insert a fresh record. The id must be unused.
    pub fn create(&self, record: TaskRecord) -> Result<TaskRecord> {
        self.with_inner(|inner| {
            if inner.tasks.contains_key(&record.id) {
                return Err(Error::Internal(format!("duplicate task id {}", record.id)));
            }
            inner.tasks.insert(record.id.clone(), record.clone());
            inner.persist()?;
            Ok(record)
        })
    }

    pub fn get(&self, id: &str) -> Option<TaskRecord> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.tasks.get(id).cloned())
    }

    /// Apply field updates atomically, enforcing the record invariants:
    ///
    /// - status changes must follow the transition graph;
    /// - progress never decreases, and FAILED freezes it at its last value;
    /// - `started_at` is stamped on entering PROCESSING, `completed_at` on
    ///   entering any terminal state;
    /// - COMPLETED forces `progress = 100`.
    pub fn update(&self, id: &str, update: TaskUpdate) -> Result<TaskRecord> {
        self.with_inner(|inner| {
            let rec = inner
                .tasks
                .get_mut(id)
                .ok_or_else(|| Error::NotFound(format!("task not found: {id}")))?;

            if let Some(status) = update.status
                && status != rec.status
            {
                if !rec.status.can_transition_to(status) {
                    return Err(Error::Internal(format!(
                        "illegal status transition {} -> {} for task {id}",
                        rec.status, status
                    )));
                }
                rec.status = status;
                match status {
                    TaskStatus::Processing => rec.started_at = Some(Utc::now()),
                    s if s.is_terminal() => rec.completed_at = Some(Utc::now()),
                    _ => {}
                }
            }

            if let Some(p) = update.progress
                && rec.status != TaskStatus::Failed
            {
                rec.progress = rec.progress.max(p.clamp(0.0, 100.0));
            }
            if rec.status == TaskStatus::Completed {
                rec.progress = 100.0;
            }

            if let Some(n) = update.processed_frames {
                rec.processed_frames = n;
            }
            if let Some(n) = update.total_frames {
                rec.total_frames = n;
            }
            if let Some(name) = update.output_name {
                rec.output_name = Some(name);
            }
            if let Some(mb) = update.output_size_mb {
                rec.output_size_mb = Some(mb);
            }
            if let Some(msg) = update.error_message {
                rec.error_message = Some(msg);
            }

            let updated = rec.clone();
            inner.persist()?;
            Ok(updated)
        })
    }

    /// Atomically take the oldest PENDING record and move it to PROCESSING.
    ///
    /// This is the worker claim step; the single locked read-modify-write
    /// guarantees two workers never run the same task.
    pub fn claim_next_pending(&self) -> Result<Option<TaskRecord>> {
        self.with_inner(|inner| {
            let next_id = inner
                .tasks
                .values()
                .filter(|t| t.status == TaskStatus::Pending)
                .min_by_key(|t| t.created_at)
                .map(|t| t.id.clone());

            let Some(id) = next_id else {
                return Ok(None);
            };

            let rec = inner
                .tasks
                .get_mut(&id)
                .ok_or_else(|| Error::Internal("claimed task vanished".into()))?;
            rec.status = TaskStatus::Processing;
            rec.started_at = Some(Utc::now());
            let claimed = rec.clone();
            inner.persist()?;
            Ok(Some(claimed))
        })
    }

    pub fn list_pending(&self, limit: usize) -> Vec<TaskRecord> {
        let mut pending = self.list_all(Some(TaskStatus::Pending));
        pending.sort_by_key(|t| t.created_at);
        pending.truncate(limit);
        pending
    }

    pub fn list_by_user(&self, user_id: &str) -> Vec<TaskRecord> {
        self.snapshot(|t| t.user_id.as_deref() == Some(user_id))
    }

    pub fn list_all(&self, filter_status: Option<TaskStatus>) -> Vec<TaskRecord> {
        self.snapshot(|t| filter_status.is_none_or(|s| t.status == s))
    }

    fn snapshot(&self, keep: impl Fn(&TaskRecord) -> bool) -> Vec<TaskRecord> {
        self.inner
            .lock()
            .map(|inner| inner.tasks.values().filter(|t| keep(t)).cloned().collect())
            .unwrap_or_default()
    }

    /// Cancel a task. Succeeds iff the task exists and is PENDING or
    /// PROCESSING; a PROCESSING task's worker notices at its next checkpoint
    /// and discards its work.
    pub fn cancel(&self, id: &str) -> Result<TaskRecord> {
        self.with_inner(|inner| {
            let rec = inner
                .tasks
                .get_mut(id)
                .ok_or_else(|| Error::NotFound(format!("task not found: {id}")))?;

            if rec.status.is_terminal() {
                return Err(Error::BadRequest(format!(
                    "task {id} already finished (status: {})",
                    rec.status
                )));
            }

            rec.status = TaskStatus::Cancelled;
            rec.completed_at = Some(Utc::now());
            let cancelled = rec.clone();
            inner.persist()?;
            info!(task_id = %id, "task cancelled");
            Ok(cancelled)
        })
    }

    /// Remove terminal records whose `completed_at` is older than `days`.
    /// Returns how many were deleted. Files on disk belong to the pipeline
    /// and are not touched here.
    pub fn cleanup(&self, days: i64) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(days);
        self.with_inner(|inner| {
            let before = inner.tasks.len();
            inner.tasks.retain(|_, t| {
                !(t.status.is_terminal() && t.completed_at.is_some_and(|at| at < cutoff))
            });
            let deleted = before - inner.tasks.len();
            if deleted > 0 {
                inner.persist()?;
                info!(deleted, "cleaned up old tasks");
            }
            Ok(deleted)
        })
    }

    pub fn stats(&self) -> QueueStats {
        let count = |tasks: &HashMap<String, TaskRecord>, s: TaskStatus| {
            tasks.values().filter(|t| t.status == s).count()
        };
        self.inner
            .lock()
            .map(|inner| QueueStats {
                total: inner.tasks.len(),
                pending: count(&inner.tasks, TaskStatus::Pending),
                processing: count(&inner.tasks, TaskStatus::Processing),
                completed: count(&inner.tasks, TaskStatus::Completed),
                failed: count(&inner.tasks, TaskStatus::Failed),
                cancelled: count(&inner.tasks, TaskStatus::Cancelled),
            })
            .unwrap_or(QueueStats {
                total: 0,
                pending: 0,
                processing: 0,
                completed: 0,
                failed: 0,
                cancelled: 0,
            })
    }
}

impl Inner {
    /// Rewrite the whole document. Written to a sibling temp file first and
    /// renamed over, so readers never observe a torn document.
    fn persist(&self) -> Result<()> {
        let doc: serde_json::Map<String, serde_json::Value> = self
            .tasks
            .iter()
            .map(|(id, rec)| Ok((id.clone(), serde_json::to_value(rec)?)))
            .collect::<Result<_>>()?;

        let tmp = self.db_path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&doc)?)?;
        std::fs::rename(&tmp, &self.db_path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{AudioLevel, ProtectParams, TaskParams};

    fn protect_record(input: &str) -> TaskRecord {
        TaskRecord::new(
            input,
            TaskParams::Protect(ProtectParams {
                epsilon: 0.12,
                strength: 1.0,
                every_n: 10,
                audio_level: AudioLevel::Weak,
            }),
            None,
            None,
        )
    }

    fn open_store(dir: &tempfile::TempDir) -> TaskStore {
        TaskStore::open(dir.path().join("tasks.json")).unwrap()
    }

    #[test]
    fn update_rejects_illegal_transitions() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = open_store(&dir);
        let rec = store.create(protect_record("a.mp4"))?;

        let res = store.update(
            &rec.id,
            TaskUpdate {
                status: Some(TaskStatus::Completed),
                ..Default::default()
            },
        );
        assert!(res.is_err(), "pending cannot jump to completed");
        Ok(())
    }

    #[test]
    fn progress_never_decreases_and_freezes_on_failure() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = open_store(&dir);
        let rec = store.create(protect_record("a.mp4"))?;
        store.claim_next_pending()?;

        let up = |p: f32| TaskUpdate {
            progress: Some(p),
            ..Default::default()
        };
        assert_eq!(store.update(&rec.id, up(50.0))?.progress, 50.0);
        assert_eq!(store.update(&rec.id, up(10.0))?.progress, 50.0);

        let failed = store.update(
            &rec.id,
            TaskUpdate {
                status: Some(TaskStatus::Failed),
                error_message: Some("mux exploded".into()),
                progress: Some(0.0),
                ..Default::default()
            },
        )?;
        assert_eq!(failed.progress, 50.0);
        assert_eq!(failed.error_message.as_deref(), Some("mux exploded"));
        assert!(failed.completed_at.is_some());
        Ok(())
    }

    #[test]
    fn claim_takes_oldest_pending_exactly_once() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = open_store(&dir);
        let first = store.create(protect_record("first.mp4"))?;
        std::thread::sleep(std::time::Duration::from_millis(5));
        store.create(protect_record("second.mp4"))?;

        let claimed = store.claim_next_pending()?.expect("a pending task");
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.status, TaskStatus::Processing);
        assert!(claimed.started_at.is_some());

        let second = store.claim_next_pending()?.expect("the other task");
        assert_ne!(second.id, first.id);
        assert!(store.claim_next_pending()?.is_none());
        Ok(())
    }

    #[test]
    fn cancel_succeeds_once_then_rejects() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = open_store(&dir);
        let rec = store.create(protect_record("a.mp4"))?;

        let cancelled = store.cancel(&rec.id)?;
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert!(cancelled.completed_at.is_some());
        assert!(store.cancel(&rec.id).is_err());
        Ok(())
    }

    #[test]
    fn cleanup_removes_only_old_terminal_tasks() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = open_store(&dir);

        let old = store.create(protect_record("old.mp4"))?;
        store.cancel(&old.id)?;
        // Backdate the completion past the cutoff by rewriting through the
        // persistence document, the way an aged store would look on disk.
        let fresh = store.create(protect_record("fresh.mp4"))?;

        // Age the cancelled record 10 days.
        {
            let path = dir.path().join("tasks.json");
            let raw = std::fs::read_to_string(&path)?;
            let mut doc: serde_json::Map<String, serde_json::Value> =
                serde_json::from_str(&raw)?;
            let entry = doc.get_mut(&old.id).unwrap();
            entry["completed_at"] =
                serde_json::to_value(Utc::now() - Duration::days(10))?;
            std::fs::write(&path, serde_json::to_string_pretty(&doc)?)?;
        }
        let store = open_store(&dir);

        assert_eq!(store.cleanup(7)?, 1);
        assert!(store.get(&old.id).is_none());
        assert!(store.get(&fresh.id).is_some());
        Ok(())
    }
}

//! Worker pool and timeout supervisor.
//!
//! N long-lived OS threads poll the store for the oldest PENDING task,
//! claim it atomically (the store's single locked read-modify-write
//! guarantees two workers never share a task) and run the pipeline. Workers
//! are daemons: every pipeline error is caught, recorded on the task, and
//! the loop continues.
//!
//! An idle worker parks on [`WakeSignal`] with a short timeout instead of
//! spinning; the upload handlers ring the signal when new work arrives.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::pipeline::PipelineRunner;
use crate::store::{TaskStore, TaskUpdate};
use crate::task::TaskStatus;

/// Idle backoff when the queue is empty.
const IDLE_BACKOFF: Duration = Duration::from_secs(5);

/// Pause after an unexpected worker-loop error.
const ERROR_BACKOFF: Duration = Duration::from_secs(10);

/// Interval between supervisor timeout sweeps.
const SUPERVISOR_INTERVAL: Duration = Duration::from_secs(3600);

/// Wake-up channel between the HTTP surface and idle workers.
#[derive(Default)]
pub struct WakeSignal {
    pending: Mutex<bool>,
    condvar: Condvar,
}

impl WakeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ring the signal; one parked worker (at most) resumes immediately.
    pub fn notify(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            *pending = true;
            self.condvar.notify_one();
        }
    }

    /// Park until notified or until `timeout` elapses.
    fn wait(&self, timeout: Duration) {
        let Ok(mut pending) = self.pending.lock() else {
            std::thread::sleep(timeout);
            return;
        };
        if !*pending {
            let (guard, _) = self
                .condvar
                .wait_timeout(pending, timeout)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            pending = guard;
        }
        *pending = false;
    }
}

/// Start `workers` processing threads plus the hourly supervisor, which
/// times out stuck tasks and expires old terminal records.
///
/// Threads are detached daemons; they live for the rest of the process.
pub fn start(
    runner: Arc<PipelineRunner>,
    store: Arc<TaskStore>,
    signal: Arc<WakeSignal>,
    workers: usize,
    timeout_hours: i64,
    cleanup_days: i64,
) {
    info!(workers, "starting worker pool");
    for worker_id in 0..workers {
        let runner = runner.clone();
        let store = store.clone();
        let signal = signal.clone();
        std::thread::Builder::new()
            .name(format!("mirage-worker-{worker_id}"))
            .spawn(move || worker_loop(worker_id, &runner, &store, &signal))
            .map(|_| ())
            .unwrap_or_else(|err| error!(%err, worker_id, "failed to spawn worker"));
    }

    let supervisor_store = store.clone();
    std::thread::Builder::new()
        .name("mirage-supervisor".to_owned())
        .spawn(move || {
            loop {
                std::thread::sleep(SUPERVISOR_INTERVAL);
                let timed_out = run_timeout_sweep(&supervisor_store, timeout_hours);
                if timed_out > 0 {
                    warn!(timed_out, "supervisor failed stuck tasks");
                }
                match supervisor_store.cleanup(cleanup_days) {
                    Ok(0) => {}
                    Ok(deleted) => info!(deleted, "supervisor expired old tasks"),
                    Err(err) => warn!(%err, "scheduled cleanup failed"),
                }
            }
        })
        .map(|_| ())
        .unwrap_or_else(|err| error!(%err, "failed to spawn supervisor"));
}

fn worker_loop(worker_id: usize, runner: &PipelineRunner, store: &TaskStore, signal: &WakeSignal) {
    info!(worker_id, "worker ready");
    loop {
        match store.claim_next_pending() {
            Ok(Some(task)) => {
                info!(worker_id, task_id = %task.id, "claimed task");
                match runner.run(&task) {
                    Ok(true) => {}
                    Ok(false) => {
                        info!(worker_id, task_id = %task.id, "task abandoned at checkpoint");
                    }
                    Err(err) => {
                        error!(worker_id, task_id = %task.id, %err, "task failed");
                        // The record may have been cancelled while the error
                        // propagated; a rejected transition is fine then.
                        let _ = store.update(
                            &task.id,
                            TaskUpdate {
                                status: Some(TaskStatus::Failed),
                                error_message: Some(err.to_string()),
                                ..Default::default()
                            },
                        );
                    }
                }
            }
            Ok(None) => signal.wait(IDLE_BACKOFF),
            Err(err) => {
                error!(worker_id, %err, "worker loop error");
                std::thread::sleep(ERROR_BACKOFF);
            }
        }
    }
}

/// One supervisor pass: fail every task that has been PROCESSING longer than
/// `timeout_hours`. Returns how many were failed. The owning worker observes
/// the transition at its next checkpoint and abandons the work.
pub fn run_timeout_sweep(store: &TaskStore, timeout_hours: i64) -> usize {
    let cutoff = Utc::now() - chrono::Duration::hours(timeout_hours);
    let mut failed = 0;
    for task in store.list_all(Some(TaskStatus::Processing)) {
        if task.started_at.is_some_and(|at| at < cutoff) {
            let res = store.update(
                &task.id,
                TaskUpdate {
                    status: Some(TaskStatus::Failed),
                    error_message: Some(format!(
                        "task exceeded the {timeout_hours}h processing timeout"
                    )),
                    ..Default::default()
                },
            );
            match res {
                Ok(_) => failed += 1,
                Err(err) => warn!(task_id = %task.id, %err, "timeout sweep update failed"),
            }
        }
    }
    failed
}

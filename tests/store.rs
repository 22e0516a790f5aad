//! Durability and concurrency behavior of the task store.

use std::sync::Arc;

use mirage::store::{TaskStore, TaskUpdate};
use mirage::task::{
    AudioLevel, CompressParams, ProtectParams, TaskParams, TaskRecord, TaskStatus,
};

fn protect_record(input: &str) -> TaskRecord {
    TaskRecord::new(
        input,
        TaskParams::Protect(ProtectParams {
            epsilon: 0.12,
            strength: 1.4,
            every_n: 5,
            audio_level: AudioLevel::Medium,
        }),
        Some("user-7".into()),
        Some("weekly batch".into()),
    )
}

#[test]
fn records_survive_a_restart_with_identical_fields() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = dir.path().join("tasks.json");

    let created = {
        let store = TaskStore::open(db.clone())?;
        let rec = store.create(protect_record("aa11_clip.mp4"))?;
        store.update(
            &rec.id,
            TaskUpdate {
                total_frames: Some(30),
                ..Default::default()
            },
        )?
    };

    let reopened = TaskStore::open(db)?;
    let loaded = reopened.get(&created.id).expect("record survived restart");
    assert_eq!(loaded.id, created.id);
    assert_eq!(loaded.input_name, created.input_name);
    assert_eq!(loaded.params, created.params);
    assert_eq!(loaded.status, TaskStatus::Pending);
    assert_eq!(loaded.created_at, created.created_at);
    assert_eq!(loaded.total_frames, 30);
    assert_eq!(loaded.user_id.as_deref(), Some("user-7"));
    assert_eq!(loaded.notes.as_deref(), Some("weekly batch"));
    Ok(())
}

#[test]
fn interrupted_processing_tasks_requeue_on_reload() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = dir.path().join("tasks.json");

    let id = {
        let store = TaskStore::open(db.clone())?;
        store.create(protect_record("bb22_clip.mp4"))?;
        let claimed = store.claim_next_pending()?.expect("claimable task");
        assert_eq!(claimed.status, TaskStatus::Processing);
        claimed.id
        // Store dropped here: simulates the process dying mid-task.
    };

    let store = TaskStore::open(db)?;
    let rec = store.get(&id).expect("task not lost");
    assert_eq!(rec.status, TaskStatus::Pending);
    assert!(rec.started_at.is_none());

    // A worker can pick it back up and drive it forward.
    let reclaimed = store.claim_next_pending()?.expect("requeued task");
    assert_eq!(reclaimed.id, id);
    Ok(())
}

#[test]
fn malformed_records_are_dropped_not_fatal() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = dir.path().join("tasks.json");

    let good = {
        let store = TaskStore::open(db.clone())?;
        store.create(protect_record("cc33_clip.mp4"))?
    };

    // Corrupt one entry by hand.
    let raw = std::fs::read_to_string(&db)?;
    let mut doc: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&raw)?;
    doc.insert(
        "deadbeef".into(),
        serde_json::json!({"status": "pending", "half": "a record"}),
    );
    std::fs::write(&db, serde_json::to_string_pretty(&doc)?)?;

    let store = TaskStore::open(db)?;
    assert!(store.get(&good.id).is_some());
    assert!(store.get("deadbeef").is_none());
    assert_eq!(store.stats().total, 1);
    Ok(())
}

#[test]
fn absent_db_file_means_an_empty_store() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = TaskStore::open(dir.path().join("tasks.json"))?;
    assert_eq!(store.stats().total, 0);
    assert!(store.claim_next_pending()?.is_none());
    Ok(())
}

#[test]
fn parallel_cancels_transition_exactly_once() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Arc::new(TaskStore::open(dir.path().join("tasks.json"))?);
    let rec = store.create(protect_record("dd44_clip.mp4"))?;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        let id = rec.id.clone();
        handles.push(std::thread::spawn(move || store.cancel(&id).is_ok()));
    }
    let successes = handles
        .into_iter()
        .map(|h| h.join().unwrap_or(false))
        .filter(|ok| *ok)
        .count();

    assert_eq!(successes, 1, "exactly one cancel may win");
    assert_eq!(store.get(&rec.id).unwrap().status, TaskStatus::Cancelled);
    Ok(())
}

#[test]
fn parallel_claims_never_share_a_task() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Arc::new(TaskStore::open(dir.path().join("tasks.json"))?);
    for i in 0..4 {
        store.create(protect_record(&format!("ee55_clip{i}.mp4")))?;
    }

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        handles.push(std::thread::spawn(move || {
            store.claim_next_pending().ok().flatten().map(|t| t.id)
        }));
    }
    let mut claimed: Vec<String> = handles
        .into_iter()
        .filter_map(|h| h.join().ok().flatten())
        .collect();

    claimed.sort();
    let before = claimed.len();
    claimed.dedup();
    assert_eq!(claimed.len(), before, "a task was claimed twice");
    assert_eq!(claimed.len(), 4);
    Ok(())
}

#[test]
fn listing_filters_by_user_and_status() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = TaskStore::open(dir.path().join("tasks.json"))?;

    store.create(protect_record("ff66_a.mp4"))?;
    store.create(TaskRecord::new(
        "ff66_b.mp4",
        TaskParams::Compress(CompressParams { target_mb: 25 }),
        Some("other-user".into()),
        None,
    ))?;
    let cancelled = store.create(TaskRecord::new(
        "ff66_c.mp4",
        TaskParams::StripMetadata,
        None,
        None,
    ))?;
    store.cancel(&cancelled.id)?;

    assert_eq!(store.list_all(None).len(), 3);
    assert_eq!(store.list_all(Some(TaskStatus::Pending)).len(), 2);
    assert_eq!(store.list_all(Some(TaskStatus::Cancelled)).len(), 1);
    assert_eq!(store.list_by_user("user-7").len(), 1);
    assert_eq!(store.list_by_user("other-user").len(), 1);
    assert_eq!(store.list_by_user("nobody").len(), 0);
    assert_eq!(store.list_pending(1).len(), 1);

    let stats = store.stats();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.pending, 2);
    assert_eq!(stats.cancelled, 1);
    Ok(())
}

#[test]
fn completion_requires_going_through_processing() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = TaskStore::open(dir.path().join("tasks.json"))?;
    let rec = store.create(protect_record("gg77_clip.mp4"))?;

    let claimed = store.claim_next_pending()?.unwrap();
    assert_eq!(claimed.id, rec.id);

    let done = store.update(
        &rec.id,
        TaskUpdate {
            status: Some(TaskStatus::Completed),
            output_name: Some("out.mp4".into()),
            output_size_mb: Some(1.5),
            progress: Some(100.0),
            ..Default::default()
        },
    )?;
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.progress, 100.0);
    assert!(done.completed_at.is_some());
    assert!(done.started_at.is_some());

    // Terminal means terminal.
    assert!(store.cancel(&rec.id).is_err());
    assert!(
        store
            .update(
                &rec.id,
                TaskUpdate {
                    status: Some(TaskStatus::Processing),
                    ..Default::default()
                },
            )
            .is_err()
    );
    Ok(())
}

//! In-memory job registry with async crash-recovery checkpoints.
//!
//! `add`/`remove` are sub-microsecond map operations under a plain mutex;
//! disk never sits on that path. A background task snapshots the id set to
//! a versioned JSON file whenever it has changed, writing off-scheduler
//! with an atomic temp-file rename so a crash can only ever leave the
//! previous or the new snapshot behind.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Context as _;
use fs2::FileExt as _;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// A fetched job. Identity, equality, and hashing are by `id` alone; the
/// record is immutable once created and dropped after its outcome posts.
#[derive(Debug, Clone, Deserialize)]
pub struct Job {
    /// Control-plane-issued opaque identifier.
    pub id: String,
    /// Opaque input payload for the handler.
    pub input: serde_json::Value,
    /// Optional URL that also receives the final outcome.
    #[serde(default)]
    pub webhook: Option<String>,
}

impl Job {
    /// A job known only by id, as recovered from a checkpoint.
    pub fn from_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            input: serde_json::Value::Null,
            webhook: None,
        }
    }
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Job {}

impl std::hash::Hash for Job {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointFile {
    version: u32,
    jobs: Vec<String>,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<String, Job>,
    dirty: bool,
}

/// Registry of in-flight jobs, shared across the scaler and heartbeat.
///
/// A job is present iff the scaler accepted it and has not yet posted its
/// outcome. The checkpoint file may briefly lag the in-memory set; it
/// never leads it.
pub struct JobState {
    inner: Arc<Mutex<Inner>>,
    checkpoint_path: PathBuf,
    checkpoint_interval: Duration,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    stop: Arc<Notify>,
}

impl JobState {
    /// New, empty state. Call [`JobState::load`] to restore a checkpoint.
    pub fn new(checkpoint_path: impl Into<PathBuf>, checkpoint_interval: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            checkpoint_path: checkpoint_path.into(),
            checkpoint_interval,
            task: Mutex::new(None),
            stop: Arc::new(Notify::new()),
        }
    }

    /// Insert a job by id and mark the set dirty. Idempotent; no I/O.
    pub fn add(&self, job: Job) {
        let id = job.id.clone();
        let mut inner = lock(&self.inner);
        inner.jobs.insert(job.id.clone(), job);
        inner.dirty = true;
        drop(inner);
        debug!(job_id = %id, "added job to state");
    }

    /// Discard a job by id and mark the set dirty. Absent ids are a no-op
    /// for membership; no I/O.
    pub fn remove(&self, id: &str) {
        let mut inner = lock(&self.inner);
        inner.jobs.remove(id);
        inner.dirty = true;
        drop(inner);
        debug!(job_id = %id, "removed job from state");
    }

    /// Whether the id is currently registered.
    pub fn contains(&self, id: &str) -> bool {
        lock(&self.inner).jobs.contains_key(id)
    }

    /// Number of registered jobs.
    pub fn count(&self) -> usize {
        lock(&self.inner).jobs.len()
    }

    /// Comma-joined snapshot of the registered ids, `None` when empty.
    pub fn list_ids(&self) -> Option<String> {
        let inner = lock(&self.inner);
        if inner.jobs.is_empty() {
            return None;
        }
        Some(
            inner
                .jobs
                .keys()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(","),
        )
    }

    /// Whether the set has changed since the last successful checkpoint.
    pub fn is_dirty(&self) -> bool {
        lock(&self.inner).dirty
    }

    /// Restore membership from the checkpoint file, if present.
    ///
    /// A missing or corrupt file is never fatal: the worker starts empty
    /// and logs what happened.
    pub async fn load(&self) {
        let path = self.checkpoint_path.clone();
        if !path.exists() {
            info!(path = %path.display(), "no checkpoint file, starting with empty state");
            return;
        }

        let read = tokio::task::spawn_blocking(move || read_checkpoint(&path)).await;
        match read {
            Ok(Ok(ids)) => {
                let count = ids.len();
                let mut inner = lock(&self.inner);
                inner.jobs = ids
                    .into_iter()
                    .map(|id| (id.clone(), Job::from_id(id)))
                    .collect();
                inner.dirty = false;
                drop(inner);
                info!(count, "loaded jobs from checkpoint");
            }
            Ok(Err(err)) => {
                error!(error = %format!("{err:#}"), "failed to load checkpoint, starting with empty state");
            }
            Err(err) => {
                error!(error = %err, "checkpoint load task failed, starting with empty state");
            }
        }
    }

    /// Start the background checkpoint task. Double-start warns and is a
    /// no-op.
    pub fn start_checkpoint_task(&self) {
        let mut slot = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            warn!("checkpoint task already running");
            return;
        }

        let inner = Arc::clone(&self.inner);
        let stop = Arc::clone(&self.stop);
        let path = self.checkpoint_path.clone();
        let interval = self.checkpoint_interval;
        *slot = Some(tokio::spawn(checkpoint_loop(inner, path, interval, stop)));
        info!(
            interval_s = self.checkpoint_interval.as_secs_f64(),
            path = %self.checkpoint_path.display(),
            "started checkpoint task"
        );
    }

    /// Stop the checkpoint task, writing one final snapshot if dirty.
    pub async fn stop_checkpoint_task(&self) {
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(task) = task else { return };

        self.stop.notify_one();
        if let Err(err) = task.await {
            error!(error = %err, "checkpoint task join failed");
        }
        info!("stopped checkpoint task");
    }

    /// Snapshot under the lock and write off-scheduler. On failure the set
    /// is re-marked dirty so the next tick retries.
    pub async fn checkpoint_once(&self) {
        checkpoint_now(&self.inner, &self.checkpoint_path).await;
    }
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    // The lock is only ever held for map operations; a poisoned lock means
    // a panic mid-operation and the map is still consistent.
    inner.lock().unwrap_or_else(|e| e.into_inner())
}

/// Snapshot the id set and clear the dirty flag.
fn take_snapshot(inner: &Mutex<Inner>) -> Vec<String> {
    let mut guard = lock(inner);
    guard.dirty = false;
    let mut ids: Vec<String> = guard.jobs.keys().cloned().collect();
    drop(guard);
    ids.sort();
    ids
}

async fn checkpoint_loop(
    inner: Arc<Mutex<Inner>>,
    path: PathBuf,
    interval: Duration,
    stop: Arc<Notify>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                if lock(&inner).dirty {
                    checkpoint_now(&inner, &path).await;
                }
            }
            _ = stop.notified() => {
                if lock(&inner).dirty {
                    checkpoint_now(&inner, &path).await;
                    info!("performed final checkpoint before shutdown");
                }
                return;
            }
        }
    }
}

async fn checkpoint_now(inner: &Arc<Mutex<Inner>>, path: &Path) {
    let ids = take_snapshot(inner);
    let count = ids.len();
    let write_path = path.to_path_buf();

    let written = tokio::task::spawn_blocking(move || write_checkpoint(&write_path, &ids)).await;
    match written {
        Ok(Ok(())) => {
            debug!(count, path = %path.display(), "checkpointed jobs");
        }
        Ok(Err(err)) => {
            error!(error = %format!("{err:#}"), "failed to write checkpoint");
            lock(inner).dirty = true;
        }
        Err(err) => {
            error!(error = %err, "checkpoint write task failed");
            lock(inner).dirty = true;
        }
    }
}

fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(std::ffi::OsStr::to_os_string)
        .unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// Advisory lock on a sidecar file, serializing writers that share a
/// checkpoint path across processes. The lock is held only across the
/// write and released before the rename.
fn acquire_lock(path: &Path) -> anyhow::Result<std::fs::File> {
    let lock_file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(sibling_path(path, ".lock"))
        .context("open checkpoint lock file")?;
    lock_file
        .lock_exclusive()
        .context("lock checkpoint lock file")?;
    Ok(lock_file)
}

fn write_checkpoint(path: &Path, ids: &[String]) -> anyhow::Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir).context("create checkpoint directory")?;
        }
    }

    let doc = CheckpointFile {
        version: 1,
        jobs: ids.to_vec(),
    };
    let json = serde_json::to_vec(&doc).context("serialize checkpoint")?;

    let tmp = sibling_path(path, ".tmp");
    let guard = acquire_lock(path)?;
    let write_result = std::fs::write(&tmp, &json).context("write checkpoint temp file");
    drop(guard);
    write_result?;

    std::fs::rename(&tmp, path).context("rename checkpoint into place")?;
    Ok(())
}

fn read_checkpoint(path: &Path) -> anyhow::Result<Vec<String>> {
    let guard = acquire_lock(path)?;
    let raw = std::fs::read(path).context("read checkpoint file");
    drop(guard);

    let doc: CheckpointFile = serde_json::from_slice(&raw?).context("parse checkpoint file")?;
    Ok(doc.jobs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(id: &str) -> Job {
        Job {
            id: id.to_string(),
            input: json!({"value": 1}),
            webhook: None,
        }
    }

    fn temp_state(dir: &tempfile::TempDir) -> JobState {
        JobState::new(dir.path().join("jobs.json"), Duration::from_secs(60))
    }

    fn mark_dirty(state: &JobState) {
        lock(&state.inner).dirty = true;
    }

    #[test]
    fn add_then_remove_leaves_membership_unchanged_and_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let state = temp_state(&dir);

        state.add(job("a"));
        state.remove("a");

        assert_eq!(state.count(), 0);
        assert!(!state.contains("a"));
        assert!(state.is_dirty());
    }

    #[test]
    fn add_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let state = temp_state(&dir);

        state.add(job("a"));
        state.add(job("a"));

        assert_eq!(state.count(), 1);
    }

    #[test]
    fn remove_absent_id_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let state = temp_state(&dir);

        state.remove("missing");
        assert_eq!(state.count(), 0);
    }

    #[test]
    fn list_ids_is_none_when_empty_and_comma_joined_otherwise() {
        let dir = tempfile::tempdir().unwrap();
        let state = temp_state(&dir);

        assert_eq!(state.list_ids(), None);

        state.add(job("a"));
        state.add(job("b"));
        let ids = state.list_ids().unwrap();
        let mut parts: Vec<&str> = ids.split(',').collect();
        parts.sort_unstable();
        assert_eq!(parts, vec!["a", "b"]);
    }

    #[test]
    fn jobs_are_equal_by_id_alone() {
        let a = job("same");
        let b = Job {
            id: "same".to_string(),
            input: json!({"different": true}),
            webhook: Some("https://hook.test".to_string()),
        };
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn checkpoint_roundtrip_restores_membership() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");

        let state = JobState::new(&path, Duration::from_secs(60));
        state.add(job("job-1"));
        state.add(job("job-2"));
        state.checkpoint_once().await;
        assert!(!state.is_dirty());

        let restored = JobState::new(&path, Duration::from_secs(60));
        restored.load().await;
        assert_eq!(restored.count(), 2);
        assert!(restored.contains("job-1"));
        assert!(restored.contains("job-2"));
        assert!(!restored.is_dirty());
    }

    #[tokio::test]
    async fn checkpoint_is_byte_stable_for_unchanged_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");

        let state = JobState::new(&path, Duration::from_secs(60));
        state.add(job("b"));
        state.add(job("a"));
        state.checkpoint_once().await;
        let first = std::fs::read(&path).unwrap();

        let restored = JobState::new(&path, Duration::from_secs(60));
        restored.load().await;
        mark_dirty(&restored);
        restored.checkpoint_once().await;
        let second = std::fs::read(&path).unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn corrupt_checkpoint_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        std::fs::write(&path, b"not json at all").unwrap();

        let state = JobState::new(&path, Duration::from_secs(60));
        state.load().await;
        assert_eq!(state.count(), 0);
    }

    #[tokio::test]
    async fn stop_writes_final_checkpoint_when_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");

        let state = JobState::new(&path, Duration::from_secs(3600));
        state.start_checkpoint_task();
        state.add(job("pending"));
        state.stop_checkpoint_task().await;

        let restored = JobState::new(&path, Duration::from_secs(60));
        restored.load().await;
        assert!(restored.contains("pending"));
    }

    #[tokio::test]
    async fn clean_state_skips_checkpoint_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");

        let state = JobState::new(&path, Duration::from_millis(10));
        state.start_checkpoint_task();
        tokio::time::sleep(Duration::from_millis(50)).await;
        state.stop_checkpoint_task().await;

        assert!(!path.exists());
    }

    #[tokio::test]
    async fn double_start_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let state = temp_state(&dir);
        state.start_checkpoint_task();
        state.start_checkpoint_task();
        state.stop_checkpoint_task().await;
    }
}

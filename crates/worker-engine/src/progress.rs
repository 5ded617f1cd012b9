//! Asynchronous progress-update pipeline.
//!
//! Handlers enqueue updates in microseconds; a background batcher flushes
//! them by size or age and retries transient control-plane failures with
//! capped backoff. Bounded memory wins over delivery: a full queue drops
//! the newest update, and a batch that exhausts its retries is dropped.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// One intermediate update, timestamped at enqueue time.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct ProgressUpdate {
    pub(crate) job_id: String,
    pub(crate) data: serde_json::Value,
    pub(crate) timestamp: DateTime<Utc>,
}

#[derive(Serialize)]
struct ProgressBatch<'a> {
    updates: &'a [ProgressUpdate],
}

/// Cheap handle for enqueueing updates from handler context.
#[derive(Clone)]
pub struct ProgressHandle {
    tx: mpsc::Sender<ProgressUpdate>,
}

impl ProgressHandle {
    /// Enqueue an update. Returns immediately; a full queue drops the
    /// update with a warning.
    pub fn send(&self, job_id: &str, data: serde_json::Value) {
        let update = ProgressUpdate {
            job_id: job_id.to_string(),
            data,
            timestamp: Utc::now(),
        };
        match self.tx.try_send(update) {
            Ok(()) => debug!(job_id = %job_id, "queued progress update"),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(job_id = %job_id, "progress queue full, dropping update");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(job_id = %job_id, "progress system stopped, dropping update");
            }
        }
    }
}

/// Tuning knobs for the batcher.
#[derive(Debug, Clone)]
pub struct ProgressConfig {
    /// Updates per flushed batch.
    pub batch_size: usize,
    /// Maximum age of a non-empty pending batch before it flushes.
    pub flush_interval: Duration,
    /// Attempts per batch before it is dropped.
    pub max_retries: u32,
    /// Queue capacity; the worst-case buffered memory bound.
    pub max_queue_size: usize,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            flush_interval: Duration::from_secs(1),
            max_retries: 5,
            max_queue_size: 1000,
        }
    }
}

const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);
const RETRY_BACKOFF_START: Duration = Duration::from_millis(100);
const RETRY_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Queue + batcher + retry pipeline for intermediate updates.
pub struct ProgressSystem {
    handle: ProgressHandle,
    rx: Mutex<Option<mpsc::Receiver<ProgressUpdate>>>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    stop: Arc<Notify>,
    http: reqwest::Client,
    progress_url: String,
    config: ProgressConfig,
}

impl ProgressSystem {
    /// New system posting batches to `progress_url`. Call
    /// [`ProgressSystem::start`] to begin flushing.
    pub fn new(http: reqwest::Client, progress_url: String, config: ProgressConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.max_queue_size.max(1));
        Self {
            handle: ProgressHandle { tx },
            rx: Mutex::new(Some(rx)),
            task: Mutex::new(None),
            stop: Arc::new(Notify::new()),
            http,
            progress_url,
            config,
        }
    }

    /// Handle for handlers to enqueue updates through.
    pub fn handle(&self) -> ProgressHandle {
        self.handle.clone()
    }

    /// Start the background batcher. Double-start warns and is a no-op.
    pub fn start(&self) {
        let rx = self.rx.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(rx) = rx else {
            warn!("progress batcher already running");
            return;
        };

        let batcher = Batcher {
            http: self.http.clone(),
            progress_url: self.progress_url.clone(),
            config: self.config.clone(),
            stop: Arc::clone(&self.stop),
        };
        let task = tokio::spawn(async move { batcher.run(rx).await });
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
        debug!(
            batch_size = self.config.batch_size,
            flush_interval_s = self.config.flush_interval.as_secs_f64(),
            "started progress batcher"
        );
    }

    /// Drain the queue into a final batch, flush once, stop the task.
    pub async fn stop(&self) {
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(task) = task else { return };

        self.stop.notify_one();
        if let Err(err) = task.await {
            error!(error = %err, "progress batcher join failed");
        }
        debug!("stopped progress batcher");
    }
}

/// The background half of the pipeline, owned by the spawned task.
struct Batcher {
    http: reqwest::Client,
    progress_url: String,
    config: ProgressConfig,
    stop: Arc<Notify>,
}

impl Batcher {
    async fn run(&self, mut rx: mpsc::Receiver<ProgressUpdate>) {
        let mut pending: Vec<ProgressUpdate> = Vec::new();
        let mut deadline = Instant::now() + self.config.flush_interval;

        loop {
            tokio::select! {
                _ = self.stop.notified() => {
                    while let Ok(update) = rx.try_recv() {
                        pending.push(update);
                    }
                    self.flush(&mut pending).await;
                    return;
                }
                update = rx.recv() => {
                    match update {
                        Some(update) => {
                            pending.push(update);
                            if pending.len() >= self.config.batch_size {
                                self.flush(&mut pending).await;
                                deadline = Instant::now() + self.config.flush_interval;
                            }
                        }
                        None => {
                            self.flush(&mut pending).await;
                            return;
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    if !pending.is_empty() {
                        self.flush(&mut pending).await;
                    }
                    deadline = Instant::now() + self.config.flush_interval;
                }
            }
        }
    }

    /// Send the pending batch, retrying serially with capped exponential
    /// backoff. Batches never overlap; the final failure drops the batch.
    async fn flush(&self, pending: &mut Vec<ProgressUpdate>) {
        if pending.is_empty() {
            return;
        }
        let batch: Vec<ProgressUpdate> = std::mem::take(pending);
        let mut backoff = RETRY_BACKOFF_START;
        let max_retries = self.config.max_retries.max(1);

        for attempt in 1..=max_retries {
            match self.post_batch(&batch).await {
                Ok(()) => {
                    info!(count = batch.len(), "sent progress batch");
                    return;
                }
                Err(err) if attempt < max_retries => {
                    warn!(
                        attempt,
                        max_retries,
                        backoff_s = backoff.as_secs_f64(),
                        error = %format!("{err:#}"),
                        "progress batch send failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(RETRY_BACKOFF_CAP);
                }
                Err(err) => {
                    error!(
                        attempts = max_retries,
                        count = batch.len(),
                        error = %format!("{err:#}"),
                        "dropping progress batch after final retry"
                    );
                }
            }
        }
    }

    async fn post_batch(&self, batch: &[ProgressUpdate]) -> anyhow::Result<()> {
        let res = self
            .http
            .post(&self.progress_url)
            .timeout(FLUSH_TIMEOUT)
            .json(&ProgressBatch { updates: batch })
            .send()
            .await?;

        if !res.status().is_success() {
            let status = res.status();
            anyhow::bail!("http {status}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn system(url: String, config: ProgressConfig) -> Arc<ProgressSystem> {
        Arc::new(ProgressSystem::new(reqwest::Client::new(), url, config))
    }

    #[tokio::test]
    async fn full_batch_flushes_immediately() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/progress"))
            .and(body_partial_json(json!({
                "updates": [
                    {"job_id": "j1", "data": {"pct": 10}},
                    {"job_id": "j1", "data": {"pct": 20}},
                ]
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let system = system(
            format!("{}/progress", server.uri()),
            ProgressConfig {
                batch_size: 2,
                flush_interval: Duration::from_secs(60),
                ..ProgressConfig::default()
            },
        );
        system.start();

        let handle = system.handle();
        handle.send("j1", json!({"pct": 10}));
        handle.send("j1", json!({"pct": 20}));

        tokio::time::sleep(Duration::from_millis(200)).await;
        system.stop().await;
    }

    #[tokio::test]
    async fn stop_drains_and_flushes_remaining_updates() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/progress"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let system = system(
            format!("{}/progress", server.uri()),
            ProgressConfig {
                batch_size: 100,
                flush_interval: Duration::from_secs(60),
                ..ProgressConfig::default()
            },
        );
        system.start();
        system.handle().send("j1", json!({"pct": 50}));
        system.stop().await;
    }

    #[tokio::test]
    async fn failed_batch_is_retried_then_delivered() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/progress"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/progress"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let system = system(
            format!("{}/progress", server.uri()),
            ProgressConfig {
                batch_size: 1,
                flush_interval: Duration::from_secs(60),
                max_retries: 3,
                ..ProgressConfig::default()
            },
        );
        system.start();
        system.handle().send("j1", json!({"pct": 99}));

        tokio::time::sleep(Duration::from_millis(500)).await;
        system.stop().await;
    }

    #[tokio::test]
    async fn full_queue_drops_newest_update() {
        let system = system(
            "http://127.0.0.1:1/progress".to_string(),
            ProgressConfig {
                max_queue_size: 1,
                ..ProgressConfig::default()
            },
        );
        // Batcher not started: the queue cannot drain.
        let handle = system.handle();
        handle.send("j1", json!(1));
        handle.send("j1", json!(2));
        // The second send must not block or panic; nothing to assert
        // beyond returning here.
    }

    #[tokio::test]
    async fn double_start_is_a_noop() {
        let system = system("http://127.0.0.1:1/progress".to_string(), ProgressConfig::default());
        system.start();
        system.start();
        system.stop().await;
    }
}

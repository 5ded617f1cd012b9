//! Event-driven job acquisition under a live-tunable concurrency bound.
//!
//! A counting semaphore is the sole authority on concurrency: every
//! fetched job owns exactly one permit from acquisition until its outcome
//! has been posted and its state entry removed. Scaling up releases
//! permits immediately; scaling down absorbs permits as in-flight jobs
//! return them, so no running job is ever interrupted.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tracing::{debug, error, info, warn};

use crate::api::{Handler, JobContext, JobOutput};
use crate::backend::{self, ErrorMetadata, OutcomePayload};
use crate::executor::JobExecutor;
use crate::progress::ProgressHandle;
use crate::shutdown::Shutdown;
use crate::state::{Job, JobState};
use rp_worker_core::SDK_VERSION;

const EMPTY_POLL_DELAY: Duration = Duration::from_millis(500);
const FETCH_ERROR_DELAY: Duration = Duration::from_secs(1);

/// Worker identity stamped into handler-failure metadata.
#[derive(Debug, Clone)]
pub struct WorkerIdentity {
    /// Pod id (`RUNPOD_POD_ID`).
    pub worker_id: String,
    /// Host name (`RUNPOD_POD_HOSTNAME`).
    pub hostname: String,
}

/// Endpoints the scaler talks to. Result and stream templates still carry
/// the per-job `$ID` placeholder.
#[derive(Debug, Clone)]
pub struct ScalerUrls {
    /// Job fetch endpoint.
    pub job_fetch_url: String,
    /// Result endpoint template, if configured.
    pub result_url: Option<String>,
    /// Stream endpoint template, if configured.
    pub stream_url: Option<String>,
}

/// Scaler construction parameters.
pub struct ScalerConfig {
    /// Initial concurrency (semaphore capacity).
    pub concurrency: usize,
    /// The handler to dispatch per job.
    pub handler: Handler,
    /// Shut the worker down after each processed job.
    pub refresh_worker: bool,
    /// Include concatenated chunks in a streaming job's terminal payload.
    pub return_aggregate_stream: bool,
    /// Control-plane endpoints.
    pub urls: ScalerUrls,
    /// Identity for failure metadata.
    pub identity: WorkerIdentity,
}

/// Acquires jobs, drives the executor, posts outcomes.
pub struct JobScaler {
    http: reqwest::Client,
    handler: Handler,
    executor: Arc<JobExecutor>,
    state: Arc<JobState>,
    progress: Option<ProgressHandle>,
    shutdown: Arc<Shutdown>,
    urls: ScalerUrls,
    identity: WorkerIdentity,
    refresh_worker: bool,
    return_aggregate_stream: bool,

    semaphore: Arc<Semaphore>,
    concurrency: tokio::sync::Mutex<usize>,
    alive: AtomicBool,
    jobs_processed: AtomicU64,
    task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl JobScaler {
    /// New scaler; call [`JobScaler::start`] to begin acquiring.
    pub fn new(
        http: reqwest::Client,
        config: ScalerConfig,
        state: Arc<JobState>,
        executor: Arc<JobExecutor>,
        progress: Option<ProgressHandle>,
        shutdown: Arc<Shutdown>,
    ) -> Self {
        let concurrency = config.concurrency.max(1);
        Self {
            http,
            handler: config.handler,
            executor,
            state,
            progress,
            shutdown,
            urls: config.urls,
            identity: config.identity,
            refresh_worker: config.refresh_worker,
            return_aggregate_stream: config.return_aggregate_stream,
            semaphore: Arc::new(Semaphore::new(concurrency)),
            concurrency: tokio::sync::Mutex::new(concurrency),
            alive: AtomicBool::new(true),
            jobs_processed: AtomicU64::new(0),
            task: StdMutex::new(None),
        }
    }

    /// Spawn the acquisition loop. Double-start warns and is a no-op.
    pub fn start(self: Arc<Self>) {
        let mut slot = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            warn!("job acquisition loop already running");
            return;
        }

        self.alive.store(true, Ordering::SeqCst);
        let scaler = Arc::clone(&self);
        *slot = Some(tokio::spawn(async move { scaler.acquisition_loop().await }));
    }

    /// Stop accepting new jobs. The acquisition loop exits on its next
    /// iteration; in-flight jobs are unaffected.
    pub fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        info!("job scaler shutdown initiated");
    }

    /// `shutdown()` plus cancel-and-await of the acquisition task.
    pub async fn stop(&self) {
        self.shutdown();
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
        info!("job scaler stopped");
    }

    /// Wait for every in-flight processing task to release its permit.
    pub async fn wait_for_idle(&self) {
        let current = *self.concurrency.lock().await;
        let mut reacquired = 0;
        for _ in 0..current {
            match self.semaphore.acquire().await {
                Ok(permit) => {
                    permit.forget();
                    reacquired += 1;
                }
                Err(_) => break,
            }
        }
        self.semaphore.add_permits(reacquired);
    }

    /// Retarget concurrency. Values ≤ 0 coerce to 1.
    ///
    /// Scaling up releases the extra permits immediately. Scaling down
    /// absorbs permits as in-flight jobs finish; the call may wait for
    /// enough permits to come back, but it never cancels a running job.
    pub async fn adjust_concurrency(&self, desired: i64) {
        let new = desired.max(1) as usize;
        let mut current = self.concurrency.lock().await;
        if new == *current {
            return;
        }

        if new > *current {
            self.semaphore.add_permits(new - *current);
            info!(from = *current, to = new, "scaled up concurrency");
        } else {
            for _ in 0..(*current - new) {
                match self.semaphore.acquire().await {
                    Ok(permit) => permit.forget(),
                    Err(_) => break,
                }
            }
            info!(from = *current, to = new, "scaled down concurrency");
        }
        *current = new;
    }

    /// The current concurrency target.
    pub async fn current_concurrency(&self) -> usize {
        *self.concurrency.lock().await
    }

    /// Permits not held by fetched or in-flight jobs.
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Jobs whose processing has finished (outcome posted or post failure
    /// logged).
    pub fn jobs_processed(&self) -> u64 {
        self.jobs_processed.load(Ordering::SeqCst)
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn acquisition_loop(self: Arc<Self>) {
        info!("starting job acquisition loop");

        while self.is_alive() {
            let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            if !self.is_alive() {
                drop(permit);
                break;
            }

            let job_in_progress = self.state.count() > 0;
            match backend::fetch_job(&self.http, &self.urls.job_fetch_url, job_in_progress).await {
                Ok(Some(job)) => {
                    tokio::spawn(Arc::clone(&self).process_job(job, permit));
                }
                Ok(None) => {
                    drop(permit);
                    tokio::time::sleep(EMPTY_POLL_DELAY).await;
                }
                Err(err) => {
                    error!(error = %format!("{err:#}"), "job fetch failed");
                    drop(permit);
                    tokio::time::sleep(FETCH_ERROR_DELAY).await;
                }
            }
        }

        info!("job acquisition loop stopped");
    }

    /// Process one fetched job. The permit travels through the scope guard
    /// so every exit path deregisters the job and then releases exactly
    /// once, in that order.
    async fn process_job(self: Arc<Self>, job: Job, permit: OwnedSemaphorePermit) {
        let job_id = job.id.clone();
        self.state.add(job.clone());
        let _guard = JobGuard {
            state: Arc::clone(&self.state),
            job_id: job_id.clone(),
            _permit: permit,
        };
        info!(job_id = %job_id, "processing job");

        let refresh_requested = self.run_and_post(job).await;
        self.jobs_processed.fetch_add(1, Ordering::SeqCst);
        info!(job_id = %job_id, "finished job");

        if refresh_requested || self.refresh_worker {
            info!(job_id = %job_id, "refresh requested, signaling worker shutdown");
            self.shutdown.request();
        }
    }

    /// Execute the handler and post the outcome. Returns whether the
    /// result asked for a worker refresh.
    async fn run_and_post(&self, job: Job) -> bool {
        let ctx = JobContext::new(job.clone(), self.progress.clone());
        match self.executor.execute(&self.handler, ctx).await {
            Ok(JobOutput::Value(value)) => self.post_value_outcome(&job, value).await,
            Ok(JobOutput::Stream(rx)) => {
                self.post_stream_outcome(&job, rx).await;
                false
            }
            Err(err) => {
                self.post_failure(&job, err).await;
                false
            }
        }
    }

    async fn post_value_outcome(&self, job: &Job, value: serde_json::Value) -> bool {
        let mut refresh = false;
        let payload = match value {
            serde_json::Value::Object(mut map) => {
                if map.remove("refresh_worker") == Some(serde_json::Value::Bool(true)) {
                    refresh = true;
                }
                let error = map.remove("error");
                // An emptied object posts without an output field.
                let output = if map.is_empty() {
                    None
                } else {
                    Some(serde_json::Value::Object(map))
                };

                match error {
                    Some(error) => {
                        let message = match error {
                            serde_json::Value::String(s) => s,
                            other => other.to_string(),
                        };
                        OutcomePayload::failed(&job.id, message, output, None)
                    }
                    None => OutcomePayload::completed(&job.id, output),
                }
            }
            other => OutcomePayload::completed(&job.id, Some(other)),
        };

        self.post_result(job, payload).await;
        refresh
    }

    async fn post_stream_outcome(&self, job: &Job, mut rx: mpsc::Receiver<serde_json::Value>) {
        let mut aggregate = Vec::new();

        while let Some(chunk) = rx.recv().await {
            if let Some(stream_url) = &self.urls.stream_url {
                let payload = OutcomePayload::stream_chunk(&job.id, chunk.clone());
                if let Err(err) = backend::post_outcome(&self.http, stream_url, &payload).await {
                    error!(
                        job_id = %job.id,
                        error = %format!("{err:#}"),
                        "failed to post stream chunk"
                    );
                }
            } else {
                debug!(job_id = %job.id, "no stream endpoint configured, discarding chunk");
            }
            if self.return_aggregate_stream {
                aggregate.push(chunk);
            }
        }

        let output = if self.return_aggregate_stream {
            Some(serde_json::Value::Array(aggregate))
        } else {
            None
        };
        self.post_result(job, OutcomePayload::completed(&job.id, output))
            .await;
    }

    async fn post_failure(&self, job: &Job, err: anyhow::Error) {
        error!(job_id = %job.id, error = %format!("{err:#}"), "handler failed");

        let metadata = ErrorMetadata {
            error_type: err.root_cause().to_string(),
            error_traceback: format!("{err:?}"),
            worker_id: self.identity.worker_id.clone(),
            hostname: self.identity.hostname.clone(),
            runpod_version: SDK_VERSION.to_string(),
        };
        let payload =
            OutcomePayload::failed(&job.id, format!("{err:#}"), None, Some(metadata));
        self.post_result(job, payload).await;
    }

    /// Post the terminal outcome. Failures are logged, never retried: the
    /// control plane re-enqueues on its own liveness timeout, and a dead
    /// control plane must not back-pressure the worker into leaking
    /// permits or state entries.
    async fn post_result(&self, job: &Job, payload: OutcomePayload) {
        if let Some(result_url) = &self.urls.result_url {
            if let Err(err) = backend::post_outcome(&self.http, result_url, &payload).await {
                error!(
                    job_id = %payload.job_id,
                    error = %format!("{err:#}"),
                    "failed to post job outcome"
                );
            }
        } else {
            debug!(job_id = %payload.job_id, "no result endpoint configured, discarding outcome");
        }

        if let Some(webhook) = &job.webhook {
            if let Err(err) = backend::post_outcome(&self.http, webhook, &payload).await {
                warn!(
                    job_id = %payload.job_id,
                    error = %format!("{err:#}"),
                    "failed to post outcome to job webhook"
                );
            }
        }
    }
}

/// Scope guard covering one job's state entry and permit.
///
/// Drop order matters: the entry is removed in the drop body, then the
/// permit field releases during field teardown, so a freed permit is never
/// observable while the job is still listed.
struct JobGuard {
    state: Arc<JobState>,
    job_id: String,
    _permit: OwnedSemaphorePermit,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.state.remove(&self.job_id);
    }
}

//! Public API types for the `rp-worker` runtime.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::progress::ProgressHandle;
use crate::state::Job;

/// What a handler produced for one job.
pub enum JobOutput {
    /// A single JSON result, posted as the terminal `COMPLETED` output.
    ///
    /// An object carrying an `error` field maps the job to `FAILED`; an
    /// object carrying `refresh_worker: true` additionally asks the worker
    /// to shut down once this job's outcome is posted. A bare (non-object)
    /// value is posted as `{"output": value}`.
    Value(serde_json::Value),
    /// A lazy, finite sequence of chunks.
    ///
    /// Each chunk is posted to the stream endpoint in emission order while
    /// the handler keeps producing; the terminal `COMPLETED` record follows
    /// once the channel closes. The sequence is not restartable.
    Stream(mpsc::Receiver<serde_json::Value>),
}

impl std::fmt::Debug for JobOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobOutput::Value(value) => f.debug_tuple("Value").field(value).finish(),
            JobOutput::Stream(_) => f.debug_tuple("Stream").finish(),
        }
    }
}

impl From<serde_json::Value> for JobOutput {
    fn from(value: serde_json::Value) -> Self {
        JobOutput::Value(value)
    }
}

/// Per-job view handed to the handler.
///
/// Carries the fetched job and a handle for enqueueing intermediate
/// progress updates. Progress calls return immediately; delivery is
/// batched and retried in the background.
pub struct JobContext {
    job: Job,
    progress: Option<ProgressHandle>,
}

impl JobContext {
    pub(crate) fn new(job: Job, progress: Option<ProgressHandle>) -> Self {
        Self { job, progress }
    }

    /// The job being processed.
    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Control-plane-issued job identifier.
    pub fn job_id(&self) -> &str {
        &self.job.id
    }

    /// The job's input payload.
    pub fn input(&self) -> &serde_json::Value {
        &self.job.input
    }

    /// Enqueue an intermediate progress update for this job.
    ///
    /// Non-blocking; when the progress queue is full the update is dropped
    /// with a warning. A no-op when no result endpoint is configured.
    pub fn progress(&self, data: serde_json::Value) {
        if let Some(progress) = &self.progress {
            progress.send(&self.job.id, data);
        }
    }
}

/// Boxed future returned by async handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<JobOutput>> + Send>>;

/// The user-supplied job handler.
///
/// The variant declares the execution model up front: `Async` handlers run
/// inline on the scheduler, `Sync` handlers are dispatched to the blocking
/// thread pool so CPU-heavy work cannot stall acquisition, heartbeats, or
/// progress flushing.
#[derive(Clone)]
pub enum Handler {
    /// A plain blocking function, run on the worker-thread pool.
    Sync(Arc<dyn Fn(JobContext) -> anyhow::Result<JobOutput> + Send + Sync>),
    /// A cooperative async function, run inline on the scheduler.
    Async(Arc<dyn Fn(JobContext) -> HandlerFuture + Send + Sync>),
}

impl Handler {
    /// Wrap a blocking function.
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(JobContext) -> anyhow::Result<JobOutput> + Send + Sync + 'static,
    {
        Handler::Sync(Arc::new(f))
    }

    /// Wrap an async function.
    pub fn async_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<JobOutput>> + Send + 'static,
    {
        Handler::Async(Arc::new(move |ctx| -> HandlerFuture { Box::pin(f(ctx)) }))
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Handler::Sync(_) => f.write_str("Handler::Sync"),
            Handler::Async(_) => f.write_str("Handler::Async"),
        }
    }
}

/// Callback deciding the desired concurrency from the current one.
///
/// Polled every five seconds; values ≤ 0 coerce to 1.
pub type ConcurrencyModifier = Arc<dyn Fn(usize) -> i64 + Send + Sync>;

/// Worker configuration supplied by the embedding application.
#[derive(Clone)]
pub struct WorkerConfig {
    /// The handler dispatched once per fetched job (required).
    pub handler: Handler,
    /// Optional live concurrency policy; identity when absent.
    pub concurrency_modifier: Option<ConcurrencyModifier>,
    /// Exit after the first completed job (immutable-worker deployments).
    pub refresh_worker: bool,
    /// For streaming handlers, also carry the concatenated chunks in the
    /// terminal result payload.
    pub return_aggregate_stream: bool,
}

impl WorkerConfig {
    /// Configuration with defaults for everything but the handler.
    pub fn new(handler: Handler) -> Self {
        Self {
            handler,
            concurrency_modifier: None,
            refresh_worker: false,
            return_aggregate_stream: false,
        }
    }
}

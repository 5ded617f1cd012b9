//! Environment-derived worker configuration.
//!
//! The control plane hands workers their endpoints through `RUNPOD_*`
//! environment variables. URL templates carry `$RUNPOD_POD_ID` and
//! `$RUNPOD_GPU_TYPE_ID`, substituted once here at startup; the per-job
//! `$ID` placeholder is left in place and substituted at post time.

use std::path::PathBuf;
use std::time::Duration;

/// Errors raised while resolving the environment at startup.
///
/// Any of these is fatal: the worker exits non-zero before accepting jobs.
#[derive(Debug, thiserror::Error)]
pub enum EnvError {
    /// The job fetch URL is mandatory; a worker without it can do nothing.
    #[error("RUNPOD_WEBHOOK_GET_JOB must be set")]
    MissingFetchUrl,
    /// A numeric variable did not parse.
    #[error("invalid value for {name}: {value:?}")]
    Invalid {
        /// Variable name.
        name: &'static str,
        /// The rejected raw value.
        value: String,
    },
}

/// Resolved worker environment.
///
/// Every field is fixed for the lifetime of the process; components borrow
/// what they need from a single instance owned by the orchestrator.
#[derive(Debug, Clone)]
pub struct Env {
    /// Worker identity (`RUNPOD_POD_ID`), also used in failure metadata.
    pub worker_id: String,
    /// Host name reported in failure metadata (`RUNPOD_POD_HOSTNAME`).
    pub hostname: String,
    /// Job fetch endpoint, pod templates substituted.
    pub job_fetch_url: String,
    /// Result endpoint template (still carries `$ID`), if configured.
    pub result_url: Option<String>,
    /// Stream endpoint template (still carries `$ID`), if configured.
    pub stream_url: Option<String>,
    /// Liveness ping endpoint, if configured.
    pub ping_url: Option<String>,
    /// Interval between heartbeat pings.
    pub ping_interval: Duration,
    /// Initial job concurrency.
    pub concurrency: usize,
    /// Executor thread-pool cap for blocking handlers.
    pub max_workers: usize,
    /// Checkpoint file for the in-flight job-id set.
    pub checkpoint_path: PathBuf,
    /// Interval between checkpoint writes.
    pub checkpoint_interval: Duration,
    /// Progress updates per batch.
    pub progress_batch_size: usize,
    /// Maximum time a non-empty progress batch waits before flushing.
    pub progress_flush_interval: Duration,
    /// Bearer token for control-plane requests (`RUNPOD_AI_API_KEY`).
    pub api_key: Option<String>,
}

impl Env {
    /// Default checkpoint location when `RUNPOD_CHECKPOINT_PATH` is unset.
    pub const DEFAULT_CHECKPOINT_PATH: &'static str = "/tmp/runpod-jobs.pkl";

    /// Resolve the process environment.
    pub fn from_env() -> Result<Self, EnvError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Resolve from an arbitrary variable lookup, substituting pod-level
    /// URL templates. Empty values count as unset.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, EnvError> {
        let get = |name: &str| get(name).filter(|v| !v.is_empty());

        let worker_id = get("RUNPOD_POD_ID").unwrap_or_else(|| "unknown".into());
        let gpu_type_id = get("RUNPOD_GPU_TYPE_ID").unwrap_or_else(|| "unknown".into());
        let hostname = get("RUNPOD_POD_HOSTNAME").unwrap_or_else(|| "unknown".into());

        let substitute = |url: String| {
            url.replace("$RUNPOD_POD_ID", &worker_id)
                .replace("$RUNPOD_GPU_TYPE_ID", &gpu_type_id)
        };

        let job_fetch_url = get("RUNPOD_WEBHOOK_GET_JOB")
            .map(substitute)
            .ok_or(EnvError::MissingFetchUrl)?;
        let result_url = get("RUNPOD_WEBHOOK_POST_OUTPUT").map(substitute);
        let stream_url = get("RUNPOD_WEBHOOK_POST_STREAM").map(substitute);
        let ping_url = get("RUNPOD_WEBHOOK_PING").map(substitute);

        let ping_interval_ms: u64 = parse_or(&get, "RUNPOD_PING_INTERVAL", 10_000)?;
        let concurrency: usize = parse_or(&get, "RUNPOD_CONCURRENCY", 1)?;
        let max_workers: usize = parse_or(&get, "RUNPOD_MAX_WORKERS", default_max_workers())?;
        let checkpoint_interval_s: u64 = parse_or(&get, "RUNPOD_CHECKPOINT_INTERVAL", 5)?;
        let progress_batch_size: usize = parse_or(&get, "RUNPOD_PROGRESS_BATCH_SIZE", 10)?;
        let progress_flush_interval_s: f64 =
            parse_or(&get, "RUNPOD_PROGRESS_FLUSH_INTERVAL", 1.0)?;

        Ok(Self {
            worker_id,
            hostname,
            job_fetch_url,
            result_url,
            stream_url,
            ping_url,
            ping_interval: Duration::from_millis(ping_interval_ms),
            concurrency: concurrency.max(1),
            max_workers: max_workers.max(1),
            checkpoint_path: PathBuf::from(
                get("RUNPOD_CHECKPOINT_PATH")
                    .unwrap_or_else(|| Self::DEFAULT_CHECKPOINT_PATH.into()),
            ),
            checkpoint_interval: Duration::from_secs(checkpoint_interval_s),
            progress_flush_interval: Duration::from_secs_f64(progress_flush_interval_s.max(0.01)),
            progress_batch_size: progress_batch_size.max(1),
            api_key: get("RUNPOD_AI_API_KEY"),
        })
    }
}

fn default_max_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn parse_or<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, EnvError> {
    match get(name) {
        Some(raw) => raw
            .parse()
            .map_err(|_| EnvError::Invalid { name, value: raw }),
        None => Ok(default),
    }
}

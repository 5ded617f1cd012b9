#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Serverless worker runtime core: fetches jobs from the control plane,
//! executes a user handler under a live-tunable concurrency bound, streams
//! progress, posts outcomes, and sustains liveness pings.

/// Public API types for the runtime.
pub mod api;

mod adapter;
mod backend;
mod executor;
mod heartbeat;
mod progress;
mod scaler;
mod shutdown;
mod state;

pub use adapter::{run_worker, run_worker_with_env};
pub use api::{ConcurrencyModifier, Handler, HandlerFuture, JobContext, JobOutput, WorkerConfig};
pub use executor::{ExecutorError, JobExecutor};
pub use heartbeat::Heartbeat;
pub use progress::{ProgressConfig, ProgressHandle, ProgressSystem};
pub use scaler::{JobScaler, ScalerConfig, ScalerUrls, WorkerIdentity};
pub use shutdown::Shutdown;
pub use state::{Job, JobState};

pub use rp_worker_core::{Env, EnvError};

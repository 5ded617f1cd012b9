//! Handler dispatch.
//!
//! Async handlers run inline on the scheduler. Sync handlers hop to the
//! blocking thread pool, gated so at most `max_workers` run at once, which
//! keeps CPU-heavy user code off the acquisition loop, the heartbeat, and
//! the progress batcher.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Semaphore;
use tracing::debug;

use crate::api::{Handler, JobContext, JobOutput};

/// Dispatch failures owned by the executor itself. Handler errors pass
/// through unchanged.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// `execute` was called after `shutdown`.
    #[error("executor has been shut down")]
    ShutDown,
    /// A sync handler panicked on the worker thread.
    #[error("handler panicked: {0}")]
    HandlerPanic(String),
}

/// Runs handlers in the execution context their variant declares.
pub struct JobExecutor {
    gate: Arc<Semaphore>,
    open: AtomicBool,
}

impl JobExecutor {
    /// Executor with a blocking-dispatch cap of `max_workers`.
    pub fn new(max_workers: usize) -> Self {
        debug!(max_workers, "initialized job executor");
        Self {
            gate: Arc::new(Semaphore::new(max_workers.max(1))),
            open: AtomicBool::new(true),
        }
    }

    /// Run `handler` for one job and return its result unchanged.
    ///
    /// Fails fast with [`ExecutorError::ShutDown`] once the executor has
    /// been shut down.
    pub async fn execute(&self, handler: &Handler, ctx: JobContext) -> anyhow::Result<JobOutput> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(ExecutorError::ShutDown.into());
        }

        match handler {
            Handler::Async(f) => {
                debug!(job_id = %ctx.job_id(), "executing async handler");
                f(ctx).await
            }
            Handler::Sync(f) => {
                debug!(job_id = %ctx.job_id(), "executing sync handler on worker thread");
                let _slot = self
                    .gate
                    .acquire()
                    .await
                    .map_err(|_| ExecutorError::ShutDown)?;
                let f = Arc::clone(f);
                tokio::task::spawn_blocking(move || f(ctx))
                    .await
                    .map_err(|err| ExecutorError::HandlerPanic(err.to_string()))?
            }
        }
    }

    /// Stop accepting work. Subsequent `execute` calls fail fast; blocking
    /// calls already on a worker thread run to completion.
    pub fn shutdown(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.gate.close();
        debug!("job executor shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(id: &str) -> JobContext {
        JobContext::new(crate::state::Job::from_id(id), None)
    }

    #[tokio::test]
    async fn async_handler_runs_inline() {
        let executor = JobExecutor::new(2);
        let handler = Handler::async_fn(|ctx| async move {
            Ok(JobOutput::Value(json!({ "echo": ctx.job_id() })))
        });

        let out = executor.execute(&handler, ctx("j1")).await.unwrap();
        match out {
            JobOutput::Value(v) => assert_eq!(v, json!({"echo": "j1"})),
            JobOutput::Stream(_) => panic!("expected value output"),
        }
    }

    #[tokio::test]
    async fn sync_handler_runs_on_worker_thread() {
        let executor = JobExecutor::new(2);
        let handler = Handler::sync(|ctx| Ok(JobOutput::Value(json!(ctx.job_id().len()))));

        let out = executor.execute(&handler, ctx("abc")).await.unwrap();
        match out {
            JobOutput::Value(v) => assert_eq!(v, json!(3)),
            JobOutput::Stream(_) => panic!("expected value output"),
        }
    }

    #[tokio::test]
    async fn handler_errors_propagate_unchanged() {
        let executor = JobExecutor::new(1);
        let handler = Handler::sync(|_| Err(anyhow::anyhow!("boom")));

        let err = executor.execute(&handler, ctx("j1")).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[tokio::test]
    async fn sync_handler_panic_is_captured() {
        let executor = JobExecutor::new(1);
        let handler = Handler::sync(|_| panic!("kaboom"));

        let err = executor.execute(&handler, ctx("j1")).await.unwrap_err();
        assert!(err.downcast_ref::<ExecutorError>().is_some());
    }

    #[tokio::test]
    async fn execute_fails_fast_after_shutdown() {
        let executor = JobExecutor::new(1);
        let handler = Handler::sync(|_| Ok(JobOutput::Value(json!(null))));

        executor.shutdown();
        let err = executor.execute(&handler, ctx("j1")).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ExecutorError>(),
            Some(ExecutorError::ShutDown)
        ));
    }
}

//! Orchestrator: wires the subsystems, owns lifecycle and teardown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use tracing::{info, warn};

use crate::api::WorkerConfig;
use crate::executor::JobExecutor;
use crate::heartbeat::Heartbeat;
use crate::progress::{ProgressConfig, ProgressSystem};
use crate::scaler::{JobScaler, ScalerConfig, ScalerUrls, WorkerIdentity};
use crate::shutdown::Shutdown;
use crate::state::JobState;
use rp_worker_core::{Env, build_client};

const MODIFIER_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Run the worker against the process environment until shutdown.
///
/// Resolves `RUNPOD_*` variables, then behaves as
/// [`run_worker_with_env`]. Returns an error (and the process should exit
/// non-zero) when initialization fails before any job is accepted.
pub async fn run_worker(config: WorkerConfig) -> anyhow::Result<()> {
    let env = Env::from_env().context("resolve worker environment")?;
    run_worker_with_env(config, env).await
}

/// Run the worker with an already-resolved environment.
///
/// Teardown order on shutdown: acquisition loop, in-flight jobs,
/// heartbeat, progress batcher (final flush), checkpoint task (final
/// snapshot), executor, HTTP client.
pub async fn run_worker_with_env(config: WorkerConfig, env: Env) -> anyhow::Result<()> {
    info!(
        worker_id = %env.worker_id,
        concurrency = env.concurrency,
        ping_interval_s = env.ping_interval.as_secs_f64(),
        checkpoint_path = %env.checkpoint_path.display(),
        "starting worker"
    );

    let http = build_client(env.api_key.as_deref())?;

    let state = Arc::new(JobState::new(
        env.checkpoint_path.clone(),
        env.checkpoint_interval,
    ));
    state.load().await;
    state.start_checkpoint_task();

    let heartbeat = match env.ping_url.clone() {
        Some(url) => {
            let heartbeat = Arc::new(Heartbeat::new(
                http.clone(),
                Arc::clone(&state),
                url,
                env.ping_interval,
            ));
            heartbeat.start();
            Some(heartbeat)
        }
        None => {
            warn!("no RUNPOD_WEBHOOK_PING set, heartbeat disabled");
            None
        }
    };

    let progress = match env.result_url.clone() {
        Some(url) => {
            let system = Arc::new(ProgressSystem::new(
                http.clone(),
                url,
                ProgressConfig {
                    batch_size: env.progress_batch_size,
                    flush_interval: env.progress_flush_interval,
                    ..ProgressConfig::default()
                },
            ));
            system.start();
            Some(system)
        }
        None => {
            warn!("no RUNPOD_WEBHOOK_POST_OUTPUT set, progress updates disabled");
            None
        }
    };

    let executor = Arc::new(JobExecutor::new(env.max_workers));
    let shutdown = Arc::new(Shutdown::new());

    let scaler = Arc::new(JobScaler::new(
        http.clone(),
        ScalerConfig {
            concurrency: env.concurrency,
            handler: config.handler.clone(),
            refresh_worker: config.refresh_worker,
            return_aggregate_stream: config.return_aggregate_stream,
            urls: ScalerUrls {
                job_fetch_url: env.job_fetch_url.clone(),
                result_url: env.result_url.clone(),
                stream_url: env.stream_url.clone(),
            },
            identity: WorkerIdentity {
                worker_id: env.worker_id.clone(),
                hostname: env.hostname.clone(),
            },
        },
        Arc::clone(&state),
        Arc::clone(&executor),
        progress.as_ref().map(|p| p.handle()),
        Arc::clone(&shutdown),
    ));
    Arc::clone(&scaler).start();

    let modifier_task = config.concurrency_modifier.clone().map(|modifier| {
        let scaler = Arc::clone(&scaler);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(MODIFIER_POLL_INTERVAL).await;
                let current = scaler.current_concurrency().await;
                let desired = modifier(current);
                if desired != current as i64 {
                    scaler.adjust_concurrency(desired).await;
                }
            }
        })
    });

    let signal_task = spawn_signal_task(Arc::clone(&shutdown))?;

    info!("worker started, processing jobs");
    shutdown.wait().await;
    info!("shutdown requested, draining worker");

    if let Some(task) = modifier_task {
        task.abort();
        let _ = task.await;
    }
    signal_task.abort();
    let _ = signal_task.await;

    scaler.stop().await;
    scaler.wait_for_idle().await;
    if let Some(heartbeat) = &heartbeat {
        heartbeat.stop().await;
    }
    if let Some(progress) = &progress {
        progress.stop().await;
    }
    state.stop_checkpoint_task().await;
    executor.shutdown();
    drop(http);

    info!(
        jobs_processed = scaler.jobs_processed(),
        "worker shut down cleanly"
    );
    Ok(())
}

#[cfg(unix)]
fn spawn_signal_task(shutdown: Arc<Shutdown>) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt()).context("install SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    Ok(tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => info!("received SIGINT, initiating shutdown"),
            _ = sigterm.recv() => info!("received SIGTERM, initiating shutdown"),
        }
        shutdown.request();
    }))
}

#[cfg(not(unix))]
fn spawn_signal_task(shutdown: Arc<Shutdown>) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    Ok(tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received ctrl-c, initiating shutdown");
            shutdown.request();
        }
    }))
}

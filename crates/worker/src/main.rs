mod cli;
mod handlers;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rp_worker_engine::WorkerConfig;

use crate::cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,rp_worker_engine=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    tracing::info!(handler = ?cli.handler, "starting rp-worker");

    let mut config = WorkerConfig::new(handlers::build(cli.handler));
    config.refresh_worker = cli.refresh_worker;
    config.return_aggregate_stream = cli.return_aggregate_stream;

    rp_worker_engine::run_worker(config).await
}

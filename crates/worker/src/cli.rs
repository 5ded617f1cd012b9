use clap::{Parser, ValueEnum};

/// Built-in handlers for driving the runtime without user code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DemoHandler {
    /// Echo the job input back as the result.
    Echo,
    /// Sleep for `input.duration_ms` (default 100), reporting progress.
    Sleep,
    /// Stream `input.chunks` (default 3) incremental chunks.
    Stream,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "rp-worker", version, about = "RunPod serverless smoke worker")]
pub struct Cli {
    /// Built-in handler to serve.
    #[arg(long, env = "RP_WORKER_HANDLER", value_enum, default_value_t = DemoHandler::Echo)]
    pub handler: DemoHandler,

    /// Exit after the first completed job.
    #[arg(long, env = "RP_WORKER_REFRESH", default_value_t = false)]
    pub refresh_worker: bool,

    /// Include the concatenated chunks in a streaming job's final result.
    #[arg(long, env = "RP_WORKER_AGGREGATE_STREAM", default_value_t = false)]
    pub return_aggregate_stream: bool,
}

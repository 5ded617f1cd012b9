use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use rp_worker_engine::{Handler, JobOutput};

use crate::cli::DemoHandler;

pub fn build(kind: DemoHandler) -> Handler {
    match kind {
        DemoHandler::Echo => Handler::sync(|ctx| {
            Ok(JobOutput::Value(json!({ "echo": ctx.input().clone() })))
        }),
        DemoHandler::Sleep => Handler::async_fn(|ctx| async move {
            let duration_ms = ctx
                .input()
                .get("duration_ms")
                .and_then(|v| v.as_u64())
                .unwrap_or(100);

            ctx.progress(json!({"status": "sleeping", "duration_ms": duration_ms}));
            tokio::time::sleep(Duration::from_millis(duration_ms)).await;
            ctx.progress(json!({"status": "waking"}));

            Ok(JobOutput::Value(json!({ "slept_ms": duration_ms })))
        }),
        DemoHandler::Stream => Handler::async_fn(|ctx| async move {
            let chunks = ctx
                .input()
                .get("chunks")
                .and_then(|v| v.as_u64())
                .unwrap_or(3);

            let (tx, rx) = mpsc::channel(16);
            tokio::spawn(async move {
                for i in 0..chunks {
                    if tx.send(json!({ "chunk": i })).await.is_err() {
                        break;
                    }
                }
            });
            Ok(JobOutput::Stream(rx))
        }),
    }
}

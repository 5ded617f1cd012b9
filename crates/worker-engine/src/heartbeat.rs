//! Periodic liveness pings.
//!
//! One scheduler task reads the live job-id list straight from
//! [`JobState`] and GETs the ping endpoint; no file I/O and no separate
//! process. Failures back off exponentially so a degraded control plane
//! is not stormed, and a single success snaps the cadence back.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use crate::state::JobState;
use rp_worker_core::SDK_VERSION;

const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Periodic ping task advertising liveness and held job ids.
pub struct Heartbeat {
    http: reqwest::Client,
    state: Arc<JobState>,
    ping_url: String,
    interval: Duration,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Heartbeat {
    /// New heartbeat against `ping_url`, pinging every `interval`.
    pub fn new(
        http: reqwest::Client,
        state: Arc<JobState>,
        ping_url: String,
        interval: Duration,
    ) -> Self {
        Self {
            http,
            state,
            ping_url,
            interval: interval.max(Duration::from_millis(100)),
            task: Mutex::new(None),
        }
    }

    /// Spawn the ping loop. Double-start warns and is a no-op.
    pub fn start(&self) {
        let mut slot = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            warn!("heartbeat task already running");
            return;
        }

        *slot = Some(tokio::spawn(ping_loop(
            self.http.clone(),
            Arc::clone(&self.state),
            self.ping_url.clone(),
            self.interval,
        )));
        debug!(
            interval_s = self.interval.as_secs_f64(),
            url = %self.ping_url,
            "started heartbeat task"
        );
    }

    /// Cancel the ping loop and await its exit.
    pub async fn stop(&self) {
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(task) = task else { return };

        task.abort();
        let _ = task.await;
        debug!("stopped heartbeat task");
    }
}

async fn ping_loop(http: reqwest::Client, state: Arc<JobState>, ping_url: String, interval: Duration) {
    let mut backoff = BACKOFF_START;

    loop {
        match send_ping(&http, &state, &ping_url, interval).await {
            Ok(()) => {
                backoff = BACKOFF_START;
                tokio::time::sleep(interval).await;
            }
            Err(err) => {
                warn!(
                    backoff_s = backoff.as_secs_f64(),
                    error = %format!("{err:#}"),
                    "heartbeat failed, backing off"
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(BACKOFF_CAP);
            }
        }
    }
}

async fn send_ping(
    http: &reqwest::Client,
    state: &JobState,
    ping_url: &str,
    interval: Duration,
) -> anyhow::Result<()> {
    let job_ids = state.list_ids().unwrap_or_default();

    let res = http
        .get(ping_url)
        .query(&[("job_id", job_ids.as_str()), ("runpod_version", SDK_VERSION)])
        .timeout(interval * 2)
        .send()
        .await?;

    if !res.status().is_success() {
        let status = res.status();
        anyhow::bail!("http {status}");
    }
    debug!(url = %ping_url, status = %res.status(), "heartbeat sent");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn state_with(ids: &[&str]) -> Arc<JobState> {
        let state = Arc::new(JobState::new(
            std::env::temp_dir().join("hb-test-unused.json"),
            Duration::from_secs(3600),
        ));
        for id in ids {
            state.add(crate::state::Job::from_id(*id));
        }
        state
    }

    #[tokio::test]
    async fn ping_carries_job_ids_and_version() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ping"))
            .and(query_param("job_id", "j1"))
            .and(query_param("runpod_version", SDK_VERSION))
            .respond_with(ResponseTemplate::new(200))
            .expect(1..)
            .mount(&server)
            .await;

        let heartbeat = Heartbeat::new(
            reqwest::Client::new(),
            state_with(&["j1"]),
            format!("{}/ping", server.uri()),
            Duration::from_millis(200),
        );
        heartbeat.start();
        tokio::time::sleep(Duration::from_millis(300)).await;
        heartbeat.stop().await;
    }

    #[tokio::test]
    async fn empty_state_pings_with_empty_job_id() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ping"))
            .and(query_param("job_id", ""))
            .respond_with(ResponseTemplate::new(200))
            .expect(1..)
            .mount(&server)
            .await;

        let heartbeat = Heartbeat::new(
            reqwest::Client::new(),
            state_with(&[]),
            format!("{}/ping", server.uri()),
            Duration::from_millis(200),
        );
        heartbeat.start();
        tokio::time::sleep(Duration::from_millis(300)).await;
        heartbeat.stop().await;
    }

    #[tokio::test]
    async fn double_start_is_a_noop() {
        let heartbeat = Heartbeat::new(
            reqwest::Client::new(),
            state_with(&[]),
            "http://127.0.0.1:1/ping".to_string(),
            Duration::from_secs(10),
        );
        heartbeat.start();
        heartbeat.start();
        heartbeat.stop().await;
    }

    #[tokio::test]
    async fn failures_keep_the_loop_alive() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ping"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1..)
            .mount(&server)
            .await;

        let heartbeat = Heartbeat::new(
            reqwest::Client::new(),
            state_with(&[]),
            format!("{}/ping", server.uri()),
            Duration::from_millis(50),
        );
        heartbeat.start();
        // First failure backs off 1s; the task must still be running.
        tokio::time::sleep(Duration::from_millis(200)).await;
        heartbeat.stop().await;
    }
}

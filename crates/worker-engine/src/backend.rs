//! Control-plane HTTP protocol: job fetch, result posts, stream posts.

use serde::Serialize;
use tracing::{debug, error};

use crate::state::Job;

/// Control-plane protocol failures.
#[derive(Debug, thiserror::Error)]
pub(crate) enum BackendError {
    /// The request never completed.
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),
    /// The endpoint answered with a non-success status.
    #[error("http {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
}

/// Terminal and intermediate job statuses on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub(crate) enum JobStatus {
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "IN_PROGRESS")]
    InProgress,
}

/// Identity fields attached to handler-failure outcomes.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct ErrorMetadata {
    pub(crate) error_type: String,
    pub(crate) error_traceback: String,
    pub(crate) worker_id: String,
    pub(crate) hostname: String,
    pub(crate) runpod_version: String,
}

/// Payload posted to the result and stream endpoints.
#[derive(Debug, Serialize)]
pub(crate) struct OutcomePayload {
    pub(crate) job_id: String,
    pub(crate) status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) output: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) error_metadata: Option<ErrorMetadata>,
}

impl OutcomePayload {
    pub(crate) fn completed(job_id: &str, output: Option<serde_json::Value>) -> Self {
        Self {
            job_id: job_id.to_string(),
            status: JobStatus::Completed,
            output,
            error: None,
            error_metadata: None,
        }
    }

    pub(crate) fn failed(
        job_id: &str,
        error: String,
        output: Option<serde_json::Value>,
        error_metadata: Option<ErrorMetadata>,
    ) -> Self {
        Self {
            job_id: job_id.to_string(),
            status: JobStatus::Failed,
            output,
            error: Some(error),
            error_metadata,
        }
    }

    pub(crate) fn stream_chunk(job_id: &str, chunk: serde_json::Value) -> Self {
        Self {
            job_id: job_id.to_string(),
            status: JobStatus::InProgress,
            output: Some(chunk),
            error: None,
            error_metadata: None,
        }
    }
}

/// Fetch one job.
///
/// `job_in_progress` is an advisory hint for the control-plane scheduler.
/// 204 means no job; 400 means the same when flash-boot signaling is
/// active. Any other non-200 status is logged and treated as no job;
/// transport errors propagate so the caller can back off.
pub(crate) async fn fetch_job(
    http: &reqwest::Client,
    fetch_url: &str,
    job_in_progress: bool,
) -> Result<Option<Job>, BackendError> {
    let separator = if fetch_url.contains('?') { "&" } else { "?" };
    let in_progress = if job_in_progress { "1" } else { "0" };
    let url = format!("{fetch_url}{separator}job_in_progress={in_progress}");

    let res = http.get(url).send().await?;
    match res.status() {
        reqwest::StatusCode::OK => {
            let body = res.bytes().await?;
            match serde_json::from_slice::<Job>(&body) {
                Ok(job) => {
                    debug!(job_id = %job.id, "fetched job");
                    Ok(Some(job))
                }
                Err(err) => {
                    // Missing id or input means the job cannot be tracked
                    // or executed; skip it.
                    error!(error = %err, "fetched job has missing or invalid fields");
                    Ok(None)
                }
            }
        }
        reqwest::StatusCode::NO_CONTENT => Ok(None),
        reqwest::StatusCode::BAD_REQUEST => {
            debug!("received 400 from job fetch, expected with flash-boot");
            Ok(None)
        }
        status => {
            error!(status = %status, "unexpected status from job fetch");
            Ok(None)
        }
    }
}

/// POST an outcome to a per-job endpoint (`$ID` substituted here), carrying
/// the `X-Request-ID` trace header.
pub(crate) async fn post_outcome(
    http: &reqwest::Client,
    url_template: &str,
    payload: &OutcomePayload,
) -> Result<(), BackendError> {
    let url = url_template.replace("$ID", &payload.job_id);
    let res = http
        .post(url)
        .header("X-Request-ID", &payload.job_id)
        .json(payload)
        .send()
        .await?;

    if !res.status().is_success() {
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        return Err(BackendError::Status { status, body });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn fetch_carries_job_in_progress_hint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/take"))
            .and(query_param("job_in_progress", "1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"id": "j1", "input": {"n": 1}})),
            )
            .mount(&server)
            .await;

        let http = reqwest::Client::new();
        let job = fetch_job(&http, &format!("{}/take", server.uri()), true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.id, "j1");
        assert_eq!(job.input, json!({"n": 1}));
    }

    #[tokio::test]
    async fn fetch_treats_204_and_400_as_no_job() {
        for status in [204u16, 400] {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(status))
                .mount(&server)
                .await;

            let http = reqwest::Client::new();
            let job = fetch_job(&http, &format!("{}/take", server.uri()), false)
                .await
                .unwrap();
            assert!(job.is_none(), "status {status} should yield no job");
        }
    }

    #[tokio::test]
    async fn fetch_skips_jobs_with_missing_fields() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "j1"})))
            .mount(&server)
            .await;

        let http = reqwest::Client::new();
        let job = fetch_job(&http, &format!("{}/take", server.uri()), false)
            .await
            .unwrap();
        assert!(job.is_none());
    }

    #[tokio::test]
    async fn fetch_propagates_transport_errors() {
        let http = reqwest::Client::new();
        let result = fetch_job(&http, "http://127.0.0.1:1/take", false).await;
        assert!(matches!(result, Err(BackendError::Transport(_))));
    }

    #[tokio::test]
    async fn post_reports_non_success_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("control plane down"))
            .mount(&server)
            .await;

        let http = reqwest::Client::new();
        let payload = OutcomePayload::completed("j1", None);
        let result = post_outcome(&http, &format!("{}/done/$ID", server.uri()), &payload).await;
        match result {
            Err(BackendError::Status { status, body }) => {
                assert_eq!(status, reqwest::StatusCode::INTERNAL_SERVER_ERROR);
                assert_eq!(body, "control plane down");
            }
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn post_substitutes_job_id_and_sets_trace_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/done/j42"))
            .and(header("X-Request-ID", "j42"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let http = reqwest::Client::new();
        let payload = OutcomePayload::completed("j42", Some(json!("ok")));
        post_outcome(&http, &format!("{}/done/$ID", server.uri()), &payload)
            .await
            .unwrap();
    }

    #[test]
    fn failed_payload_serializes_expected_shape() {
        let payload = OutcomePayload::failed(
            "j1",
            "boom".to_string(),
            None,
            Some(ErrorMetadata {
                error_type: "boom".to_string(),
                error_traceback: "trace".to_string(),
                worker_id: "pod-1".to_string(),
                hostname: "host-1".to_string(),
                runpod_version: "0.3.0".to_string(),
            }),
        );

        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["status"], "FAILED");
        assert_eq!(value["error"], "boom");
        assert_eq!(value["error_metadata"]["worker_id"], "pod-1");
        assert!(value.get("output").is_none());
    }
}

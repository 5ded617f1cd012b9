//! Shared control-plane HTTP client.
//!
//! One pooled client serves every subsystem (fetch, result posts, pings,
//! progress batches). The pool is unbounded; each request carries its own
//! timeout, set at the call site.

use anyhow::Context as _;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};

/// SDK version advertised to the control plane (heartbeat query parameter
/// and failure metadata).
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// User agent sent with every control-plane request.
pub fn user_agent() -> String {
    format!(
        "RunPod-Rust-Worker/{} ({}; {})",
        SDK_VERSION,
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

/// Build the shared client with default auth headers.
///
/// The control plane authenticates with the raw token value in the
/// `Authorization` header. A missing token still yields a usable client so
/// local setups without auth keep working.
pub fn build_client(api_key: Option<&str>) -> anyhow::Result<reqwest::Client> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Some(key) = api_key {
        let mut value =
            HeaderValue::from_str(key).context("RUNPOD_AI_API_KEY is not a valid header value")?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
    }

    reqwest::Client::builder()
        .default_headers(headers)
        .user_agent(user_agent())
        .build()
        .context("build http client")
}

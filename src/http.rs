use reqwest::{Client, RequestBuilder};
use std::time::Duration;

pub fn build_client() -> Client {
    let timeout = crate::config::env_u64("HTTP_TIMEOUT_SECS", 30);
    let connect = crate::config::env_u64("HTTP_CONNECT_TIMEOUT_SECS", 5);
    Client::builder()
        .timeout(Duration::from_secs(timeout))
        .connect_timeout(Duration::from_secs(connect))
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Attaches the per-run session token when one was issued.
pub fn with_session(request: RequestBuilder, token: Option<&str>) -> RequestBuilder {
    match token {
        Some(token) if !token.is_empty() => request.bearer_auth(token),
        _ => request,
    }
}

use crate::models::ApiError;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{collections::HashMap, convert::Infallible, env, sync::Arc};
use tracing::{info, warn};

/// Operator API keys loaded from `OPERATOR_API_KEYS` (`operator:key,...`).
#[derive(Clone)]
pub struct OperatorAuth {
    keys: Arc<HashMap<String, OperatorContext>>,
}

/// Attached to authenticated requests; the operator owns the runs they create.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorContext {
    pub operator_id: String,
    pub api_key_id: String,
}

impl OperatorAuth {
    pub fn from_env() -> Self {
        let raw = env::var("OPERATOR_API_KEYS").unwrap_or_default();
        Self::from_list(&raw)
    }

    pub fn from_list(raw: &str) -> Self {
        Self {
            keys: Arc::new(parse_keys(raw)),
        }
    }

    fn authenticate(&self, presented: &str) -> Option<OperatorContext> {
        self.keys.get(presented).cloned()
    }
}

pub async fn require_operator(
    State(auth): State<OperatorAuth>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(presented) = extract_api_key(request.headers()) else {
        return Ok(unauthorized_response(
            "missing_api_key",
            "Provide X-Hermes-Key or Bearer token",
        ));
    };

    let Some(context) = auth.authenticate(&presented) else {
        return Ok(unauthorized_response("invalid_api_key", "Key not recognized"));
    };

    request.extensions_mut().insert(context);
    Ok(next.run(request).await)
}

pub(crate) fn extract_api_key(headers: &http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
        && raw.len() >= 7
        && raw[..6].eq_ignore_ascii_case("bearer")
    {
        return Some(raw[6..].trim().to_string());
    }
    headers
        .get("X-Hermes-Key")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn unauthorized_response(code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (StatusCode::UNAUTHORIZED, Json(payload)).into_response()
}

fn parse_keys(raw: &str) -> HashMap<String, OperatorContext> {
    let mut entries = HashMap::new();
    for (idx, token) in raw.split(',').enumerate() {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            continue;
        }
        match trimmed.split_once(':') {
            Some((operator, secret)) if !operator.trim().is_empty() && !secret.trim().is_empty() => {
                entries.insert(
                    secret.trim().to_string(),
                    OperatorContext {
                        operator_id: operator.trim().to_string(),
                        api_key_id: format!("key-{:02}", idx + 1),
                    },
                );
            }
            _ => warn!(
                target = "hermes.api",
                "ignored malformed OPERATOR_API_KEYS entry: {trimmed}"
            ),
        }
    }

    if entries.is_empty() {
        warn!(
            target = "hermes.api",
            "OPERATOR_API_KEYS produced no keys; every operator request will be rejected"
        );
    } else {
        info!(
            target = "hermes.api",
            key_count = entries.len(),
            "loaded operator keys from env"
        );
    }
    entries
}

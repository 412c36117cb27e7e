pub mod analysis;
pub mod grouping;
pub mod tensorzero;

pub use analysis::GatewayAnalyser;
pub use grouping::GatewayGrouper;
pub use tensorzero::{LlmClient, LlmConfig, LlmError, LlmMessage};

use crate::services::ServiceError;
use serde::de::DeserializeOwned;

/// Models like to wrap JSON in a markdown fence; peel it off.
fn strip_markdown_fence(input: &str) -> String {
    let trimmed = input.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    let mut body = Vec::new();
    for line in trimmed.lines().skip(1) {
        if line.trim_start().starts_with("```") {
            break;
        }
        body.push(line);
    }
    body.join("\n")
}

fn parse_reply<T: DeserializeOwned>(text: &str) -> Result<T, ServiceError> {
    let cleaned = strip_markdown_fence(text);
    serde_json::from_str(&cleaned).map_err(|err| ServiceError::Deserialize(err.to_string()))
}

impl From<LlmError> for ServiceError {
    fn from(value: LlmError) -> Self {
        match value {
            LlmError::InvalidResponse(detail) => ServiceError::Deserialize(detail),
            other => ServiceError::Request(other.to_string()),
        }
    }
}

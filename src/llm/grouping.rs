use crate::llm::{LlmClient, LlmMessage, parse_reply};
use crate::services::{CallContext, GroupSuggestion, PhotoGrouper, ServiceError};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

const SYSTEM_PROMPT: &str = r#"
You sort product photos into products. Each image is identified by its zero-based index. Photos of the same
physical item belong to one group. Respond with JSON only:
{"groups":[{"photoIndexes":[0,1],"suggestedName":"...","confidence":0.0}]}
"#;

#[derive(Debug, Deserialize)]
struct GroupingReply {
    #[serde(default)]
    groups: Vec<GroupSuggestion>,
}

/// Clustering service reached through the LLM gateway.
pub struct GatewayGrouper {
    llm: Arc<LlmClient>,
}

impl GatewayGrouper {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl PhotoGrouper for GatewayGrouper {
    async fn group(
        &self,
        ctx: &CallContext,
        image_urls: &[String],
    ) -> Result<Vec<GroupSuggestion>, ServiceError> {
        let images = image_urls
            .iter()
            .enumerate()
            .map(|(index, url)| json!({ "index": index, "url": url }))
            .collect::<Vec<_>>();
        let payload = json!({ "run_id": ctx.run_id, "images": images });
        let messages = [
            LlmMessage::system(SYSTEM_PROMPT),
            LlmMessage::user(payload.to_string()),
        ];
        let function = self.llm.config().grouping_function.clone();
        let response = self.llm.chat(&function, &messages, ctx.token()).await?;
        let reply: GroupingReply = parse_reply(&response.text)?;
        Ok(reply.groups)
    }
}

use crate::llm::{LlmClient, LlmMessage, parse_reply};
use crate::pipeline::analysis::AnalysisHints;
use crate::services::{AnalysisReport, CallContext, ProductAnalyser, ServiceError};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

const SYSTEM_PROMPT: &str = r#"
You are a cycling marketplace product analyst. Given photo URLs of one item, respond with a JSON object with
brand, model, item_type, category (bike|part|apparel), bike_details / part_details / apparel_details for the
matching category, condition_rating (1-10), wear_notes and price_estimate {min_aud, max_aud}. Output JSON only.
"#;

/// Structured-extraction service reached through the LLM gateway.
pub struct GatewayAnalyser {
    llm: Arc<LlmClient>,
}

impl GatewayAnalyser {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl ProductAnalyser for GatewayAnalyser {
    async fn analyze(
        &self,
        ctx: &CallContext,
        image_urls: &[String],
        hints: &AnalysisHints,
    ) -> Result<AnalysisReport, ServiceError> {
        if image_urls.is_empty() {
            return Err(ServiceError::Request("no images to analyse".into()));
        }
        let payload = json!({
            "images": image_urls,
            "hints": hints,
        });
        let messages = [
            LlmMessage::system(SYSTEM_PROMPT),
            LlmMessage::user(payload.to_string()),
        ];
        let function = self.llm.config().analysis_function.clone();
        let response = self.llm.chat(&function, &messages, ctx.token()).await?;
        parse_reply(&response.text)
    }
}

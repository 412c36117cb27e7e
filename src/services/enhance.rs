use crate::http::{build_client, with_session};
use crate::pipeline::run::EnhancedCover;
use crate::services::{CallContext, CoverEnhancer, ServiceError, read_json};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct HttpCoverEnhancer {
    base_url: String,
    http: Client,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EnhanceRequest<'a> {
    image_url: &'a str,
    run_id: String,
}

impl HttpCoverEnhancer {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: build_client(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(crate::config::ENHANCE_URL.as_str())
    }
}

#[async_trait]
impl CoverEnhancer for HttpCoverEnhancer {
    async fn enhance(
        &self,
        ctx: &CallContext,
        image_url: &str,
    ) -> Result<EnhancedCover, ServiceError> {
        let body = EnhanceRequest {
            image_url,
            run_id: ctx.run_id.to_string(),
        };
        let request = self
            .http
            .post(format!("{}/enhance", self.base_url))
            .json(&body);
        let response = with_session(request, ctx.token())
            .send()
            .await
            .map_err(|err| ServiceError::Request(err.to_string()))?;
        let cover: EnhancedCover = read_json(response).await?;
        if cover.url.trim().is_empty() {
            return Err(ServiceError::Deserialize("enhanced url is empty".into()));
        }
        Ok(cover)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_partial_json, method, path},
    };

    #[tokio::test]
    async fn rejects_blank_enhanced_url() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/enhance"))
            .and(body_partial_json(serde_json::json!({ "imageUrl": "https://cdn.test/0.jpg" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "url": " ",
                "cardUrl": "c",
                "thumbnailUrl": "t"
            })))
            .mount(&server)
            .await;
        let enhancer = HttpCoverEnhancer::new(server.uri());
        let ctx = CallContext::new(Uuid::new_v4(), None, CancellationToken::new());
        let err = enhancer
            .enhance(&ctx, "https://cdn.test/0.jpg")
            .await
            .expect_err("blank url");
        assert!(matches!(err, ServiceError::Deserialize(_)));
    }
}

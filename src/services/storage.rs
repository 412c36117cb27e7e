use crate::http::{build_client, with_session};
use crate::pipeline::run::UploadedAsset;
use crate::services::{AssetStorage, CallContext, ServiceError, read_json};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;
use urlencoding::encode;

/// Asset storage/transformation service client.
#[derive(Debug, Clone)]
pub struct HttpAssetStorage {
    base_url: String,
    http: Client,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredAsset {
    id: String,
    url: String,
    #[serde(default)]
    card_url: Option<String>,
    #[serde(default)]
    thumbnail_url: Option<String>,
    #[serde(default)]
    gallery_url: Option<String>,
    #[serde(default)]
    detail_url: Option<String>,
}

impl From<StoredAsset> for UploadedAsset {
    fn from(value: StoredAsset) -> Self {
        let card_url = value.card_url.unwrap_or_else(|| value.url.clone());
        let thumbnail_url = value.thumbnail_url.unwrap_or_else(|| card_url.clone());
        Self {
            id: value.id,
            original_url: value.url,
            card_url,
            thumbnail_url,
            gallery_url: value.gallery_url,
            detail_url: value.detail_url,
        }
    }
}

impl HttpAssetStorage {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: build_client(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(crate::config::ASSET_STORAGE_URL.as_str())
    }
}

#[async_trait]
impl AssetStorage for HttpAssetStorage {
    async fn upload(
        &self,
        ctx: &CallContext,
        index: usize,
        payload: &[u8],
    ) -> Result<UploadedAsset, ServiceError> {
        let run_id = ctx.run_id.to_string();
        let url = format!(
            "{}/assets?run_id={}&index={}",
            self.base_url,
            encode(&run_id),
            index
        );
        debug!(target = "hermes.storage", run_id = %run_id, index, bytes = payload.len(), "asset_upload");
        let request = self
            .http
            .post(url)
            .header("Content-Type", "application/octet-stream")
            .header("X-Run-Id", &run_id)
            .header("X-Asset-Index", index.to_string())
            .body(payload.to_vec());
        let response = with_session(request, ctx.token())
            .send()
            .await
            .map_err(|err| ServiceError::Request(err.to_string()))?;
        let stored: StoredAsset = read_json(response).await?;
        Ok(stored.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{header, method, path, query_param},
    };

    #[tokio::test]
    async fn upload_carries_run_id_index_and_session() {
        let server = MockServer::start().await;
        let run_id = Uuid::new_v4();
        Mock::given(method("POST"))
            .and(path("/assets"))
            .and(query_param("run_id", run_id.to_string().as_str()))
            .and(query_param("index", "4"))
            .and(header("X-Asset-Index", "4"))
            .and(header("Authorization", "Bearer session-abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "asset-4",
                "url": "https://cdn.test/a4.jpg",
                "cardUrl": "https://cdn.test/a4_card.jpg",
                "thumbnailUrl": "https://cdn.test/a4_thumb.jpg"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let storage = HttpAssetStorage::new(server.uri());
        let ctx = CallContext::new(run_id, Some("session-abc".into()), CancellationToken::new());
        let asset = storage.upload(&ctx, 4, b"jpeg-bytes").await.expect("upload");
        assert_eq!(asset.id, "asset-4");
        assert_eq!(asset.original_url, "https://cdn.test/a4.jpg");
        assert_eq!(asset.thumbnail_url, "https://cdn.test/a4_thumb.jpg");
        assert!(asset.gallery_url.is_none());
    }

    #[tokio::test]
    async fn upload_surfaces_http_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/assets"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .mount(&server)
            .await;
        let storage = HttpAssetStorage::new(server.uri());
        let ctx = CallContext::new(Uuid::new_v4(), None, CancellationToken::new());
        let err = storage.upload(&ctx, 0, b"x").await.expect_err("503");
        assert_eq!(
            err,
            ServiceError::Status {
                status: 503,
                body: "busy".into()
            }
        );
    }
}

use crate::http::{build_client, with_session};
use crate::pipeline::run::{DraftImage, ProductDraft};
use crate::services::{CallContext, ServiceError, read_json};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;

/// Form payload of one listing, as the listing-creation endpoint expects it.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingFormData {
    pub title: String,
    pub description: Option<String>,
    pub category: &'static str,
    pub brand: Option<String>,
    pub model: Option<String>,
    pub item_type: Option<String>,
    pub condition_rating: Option<u8>,
    pub wear_notes: Option<String>,
    pub price: Option<u32>,
    pub original_retail_price: Option<u32>,
    pub details: Value,
    pub images: Vec<DraftImage>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingSubmission {
    pub target_user_id: String,
    pub scheduled_for: String,
    pub form_data: ListingFormData,
    pub images: Vec<DraftImage>,
}

impl ListingSubmission {
    pub fn from_draft(draft: &ProductDraft, scheduled_for: DateTime<Utc>) -> Self {
        let fields = &draft.fields;
        let images = draft.images.clone();
        Self {
            target_user_id: draft
                .target_user_id
                .as_deref()
                .unwrap_or_default()
                .trim()
                .to_string(),
            scheduled_for: scheduled_for.to_rfc3339_opts(SecondsFormat::Secs, true),
            form_data: ListingFormData {
                title: fields.title.clone(),
                description: fields.description.clone(),
                category: fields.category.as_str(),
                brand: fields.brand.clone(),
                model: fields.model.clone(),
                item_type: fields.item_type.clone(),
                condition_rating: fields.condition_rating,
                wear_notes: fields.wear_notes.clone(),
                price: fields.price_aud,
                original_retail_price: fields.original_retail_price_aud,
                details: fields.visible_details(),
                images: images.clone(),
            },
            images,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListingReceipt {
    #[serde(alias = "listingId")]
    pub id: String,
}

#[async_trait]
pub trait ListingStore: Send + Sync {
    async fn create_listing(
        &self,
        ctx: &CallContext,
        submission: &ListingSubmission,
        idempotency_key: &str,
    ) -> Result<ListingReceipt, ServiceError>;
}

#[derive(Debug, Clone)]
pub struct HttpListingStore {
    base_url: String,
    http: Client,
}

impl HttpListingStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: build_client(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(crate::config::LISTINGS_URL.as_str())
    }
}

#[async_trait]
impl ListingStore for HttpListingStore {
    async fn create_listing(
        &self,
        ctx: &CallContext,
        submission: &ListingSubmission,
        idempotency_key: &str,
    ) -> Result<ListingReceipt, ServiceError> {
        let request = self
            .http
            .post(format!("{}/listings", self.base_url))
            .header("Idempotency-Key", idempotency_key)
            .json(submission);
        let response = with_session(request, ctx.token())
            .send()
            .await
            .map_err(|err| ServiceError::Request(err.to_string()))?;
        read_json(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::analysis::NormalizedFields;
    use chrono::TimeZone;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_partial_json, header, method, path},
    };

    fn saved_draft() -> ProductDraft {
        let mut fields = NormalizedFields {
            title: "Trek Domane".into(),
            price_aud: Some(2100),
            ..NormalizedFields::default()
        };
        fields.bike.frame_size = Some("56cm".into());
        fields.apparel.size = Some("L".into());
        let mut draft = ProductDraft::new(
            "group-1",
            vec!["https://cdn.test/0.jpg".into(), "https://cdn.test/1.jpg".into()],
            fields,
        );
        draft.target_user_id = Some("user-7".into());
        draft
    }

    #[test]
    fn submission_marks_single_primary_and_hides_latent_details() {
        let when = Utc.with_ymd_and_hms(2026, 11, 2, 8, 0, 0).unwrap();
        let submission = ListingSubmission::from_draft(&saved_draft(), when);
        let value = serde_json::to_value(&submission).unwrap();
        assert_eq!(value["scheduledFor"], "2026-11-02T08:00:00Z");
        assert_eq!(value["formData"]["images"][0]["isPrimary"], true);
        assert_eq!(value["formData"]["images"][1]["isPrimary"], false);
        assert_eq!(value["formData"]["images"][1]["order"], 1);
        assert_eq!(value["formData"]["details"]["frame_size"], "56cm");
        assert!(value["formData"]["details"].get("size").is_none());
    }

    #[tokio::test]
    async fn create_listing_posts_with_idempotency_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/listings"))
            .and(header("Idempotency-Key", "run:group-1"))
            .and(body_partial_json(serde_json::json!({ "targetUserId": "user-7" })))
            .respond_with(
                ResponseTemplate::new(201).set_body_json(serde_json::json!({ "listingId": "L-1" })),
            )
            .expect(1)
            .mount(&server)
            .await;
        let store = HttpListingStore::new(server.uri());
        let ctx = CallContext::new(Uuid::new_v4(), None, CancellationToken::new());
        let submission = ListingSubmission::from_draft(&saved_draft(), Utc::now());
        let receipt = store
            .create_listing(&ctx, &submission, "run:group-1")
            .await
            .expect("created");
        assert_eq!(receipt.id, "L-1");
    }
}

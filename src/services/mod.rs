//! External collaborators of the ingestion pipeline. Each one sits behind a
//! trait so the orchestrator can be driven by in-process fakes in tests; the
//! HTTP implementations live in the submodules and in `crate::llm`.

use crate::pipeline::analysis::{AnalysisHints, ApparelDetails, BikeDetails, PartDetails};
use crate::pipeline::run::{EnhancedCover, UploadedAsset};
use async_trait::async_trait;
use reqwest::Response;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::future::Future;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub mod auth;
pub mod enhance;
pub mod listings;
pub mod storage;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid response: {0}")]
    Deserialize(String),
    #[error("cancelled")]
    Cancelled,
}

/// Per-run context carried by every outbound call: the correlation id, the
/// session token obtained once for the run, and the run's cancellation token.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub run_id: Uuid,
    pub session_token: Option<String>,
    pub cancel: CancellationToken,
}

impl CallContext {
    pub fn new(run_id: Uuid, session_token: Option<String>, cancel: CancellationToken) -> Self {
        Self {
            run_id,
            session_token,
            cancel,
        }
    }

    pub fn token(&self) -> Option<&str> {
        self.session_token.as_deref()
    }

    /// Races `fut` against the run's cancellation. A cancelled run drops the
    /// in-flight future (aborting the request) instead of waiting it out.
    pub async fn guard<T, F>(&self, fut: F) -> Result<T, ServiceError>
    where
        F: Future<Output = Result<T, ServiceError>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ServiceError::Cancelled),
            out = fut => out,
        }
    }
}

pub(crate) async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, ServiceError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ServiceError::Status {
            status: status.as_u16(),
            body: body.chars().take(512).collect(),
        });
    }
    response
        .json()
        .await
        .map_err(|err| ServiceError::Deserialize(err.to_string()))
}

/// One cluster proposed by the grouping service, before sanitising.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSuggestion {
    #[serde(default)]
    pub photo_indexes: Vec<i64>,
    #[serde(default)]
    pub suggested_name: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct PriceEstimate {
    #[serde(default)]
    pub min_aud: Option<f64>,
    #[serde(default)]
    pub max_aud: Option<f64>,
}

/// Raw structured-extraction reply.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct AnalysisReport {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub item_type: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub bike_details: Option<BikeDetails>,
    #[serde(default)]
    pub part_details: Option<PartDetails>,
    #[serde(default)]
    pub apparel_details: Option<ApparelDetails>,
    #[serde(default)]
    pub condition_rating: Option<f64>,
    #[serde(default)]
    pub wear_notes: Option<String>,
    #[serde(default)]
    pub price_estimate: Option<PriceEstimate>,
}

#[async_trait]
pub trait AssetStorage: Send + Sync {
    /// Stores one payload. `index` is the asset's position within the run and
    /// together with the run id lets the service deduplicate re-submissions.
    async fn upload(
        &self,
        ctx: &CallContext,
        index: usize,
        payload: &[u8],
    ) -> Result<UploadedAsset, ServiceError>;
}

#[async_trait]
pub trait CoverEnhancer: Send + Sync {
    async fn enhance(&self, ctx: &CallContext, image_url: &str)
    -> Result<EnhancedCover, ServiceError>;
}

#[async_trait]
pub trait PhotoGrouper: Send + Sync {
    async fn group(
        &self,
        ctx: &CallContext,
        image_urls: &[String],
    ) -> Result<Vec<GroupSuggestion>, ServiceError>;
}

#[async_trait]
pub trait ProductAnalyser: Send + Sync {
    async fn analyze(
        &self,
        ctx: &CallContext,
        image_urls: &[String],
        hints: &AnalysisHints,
    ) -> Result<AnalysisReport, ServiceError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn guard_aborts_pending_call_on_cancel() {
        let ctx = CallContext::new(Uuid::new_v4(), None, CancellationToken::new());
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel.cancel();
        });
        let out: Result<(), ServiceError> = ctx
            .guard(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .await;
        assert_eq!(out, Err(ServiceError::Cancelled));
    }

    #[test]
    fn analysis_report_tolerates_partial_payloads() {
        let report: AnalysisReport = serde_json::from_value(serde_json::json!({
            "brand": "Giant",
            "item_type": "gravel bike",
            "bike_details": { "frame_size": "M" },
            "price_estimate": { "min_aud": 900 }
        }))
        .expect("partial report");
        assert_eq!(report.brand.as_deref(), Some("Giant"));
        assert_eq!(
            report.price_estimate.and_then(|p| p.min_aud),
            Some(900.0)
        );
        assert!(report.condition_rating.is_none());
    }
}

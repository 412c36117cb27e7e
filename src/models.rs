use crate::pipeline::analysis::{ApparelDetails, BikeDetails, Category, PartDetails};
use crate::pipeline::run::{PhotoGroup, ProductDraft, RunStage, UploadedAsset};
use crate::review::CursorState;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
pub struct PhotoUpload {
    /// Raw base64 or a `data:image/...;base64,` URL.
    pub data_base64: String,
    #[serde(default)]
    pub filename: Option<String>,
}

impl PhotoUpload {
    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        let raw = self.data_base64.trim();
        let payload = match raw.split_once(";base64,") {
            Some((prefix, data)) if prefix.starts_with("data:") => data,
            _ => raw,
        };
        STANDARD.decode(payload)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AddPhotosRequest {
    #[serde(default)]
    pub photos: Vec<PhotoUpload>,
}

/// `POST /runs` body; photos are optional so an empty run can be opened first.
pub type CreateRunRequest = AddPhotosRequest;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DraftPatch {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<Category>,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub item_type: Option<String>,
    #[serde(default)]
    pub wear_notes: Option<String>,
    #[serde(default)]
    pub condition_rating: Option<u8>,
    #[serde(default)]
    pub price_aud: Option<u32>,
    #[serde(default)]
    pub original_retail_price_aud: Option<u32>,
    #[serde(default)]
    pub bike: Option<BikeDetails>,
    #[serde(default)]
    pub part: Option<PartDetails>,
    #[serde(default)]
    pub apparel: Option<ApparelDetails>,
    #[serde(default)]
    pub target_user_id: Option<String>,
    #[serde(default)]
    pub scheduled_for: Option<String>,
    #[serde(default)]
    pub utc_offset_minutes: Option<i32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoverRequest {
    pub image_index: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JumpRequest {
    pub index: usize,
}

#[derive(Debug, Serialize, Clone)]
pub struct RunSnapshot {
    pub id: String,
    pub stage: RunStage,
    /// The ingest worker holds the run; only `id` and `stage` are current.
    pub busy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    pub previews: Vec<String>,
    pub assets: Vec<UploadedAsset>,
    pub groups: Vec<PhotoGroup>,
    pub drafts: Vec<ProductDraft>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub stages: Vec<StageReport>,
}

impl RunSnapshot {
    pub fn busy(id: String, stage: RunStage) -> Self {
        Self {
            id,
            stage,
            busy: true,
            created_at: None,
            previews: Vec::new(),
            assets: Vec::new(),
            groups: Vec::new(),
            drafts: Vec::new(),
            cursor: None,
            last_error: None,
            stages: Vec::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StageReport {
    pub name: String,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    pub output: Value,
}

impl StageReport {
    pub fn new(name: &str, elapsed_ms: u128, output: Value) -> Self {
        Self {
            name: name.to_string(),
            elapsed_ms,
            timestamp: Utc::now(),
            output,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn photo_upload_accepts_data_urls() {
        let plain = PhotoUpload {
            data_base64: "aGVybWVz".into(),
            filename: None,
        };
        assert_eq!(plain.decode().expect("plain"), b"hermes");
        let data_url = PhotoUpload {
            data_base64: "data:image/jpeg;base64,aGVybWVz".into(),
            filename: Some("a.jpg".into()),
        };
        assert_eq!(data_url.decode().expect("data url"), b"hermes");
        let broken = PhotoUpload {
            data_base64: "***".into(),
            filename: None,
        };
        assert!(broken.decode().is_err());
    }

    #[test]
    fn draft_patch_accepts_partial_bodies() {
        let patch: DraftPatch = serde_json::from_value(serde_json::json!({
            "category": "part",
            "part": { "part_type": "wheelset" },
            "scheduled_for": "2026-11-02",
            "utc_offset_minutes": 600
        }))
        .expect("patch");
        assert_eq!(patch.category, Some(Category::Part));
        assert_eq!(
            patch.part.and_then(|p| p.part_type).as_deref(),
            Some("wheelset")
        );
        assert!(patch.title.is_none());
    }
}

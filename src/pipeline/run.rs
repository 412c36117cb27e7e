//! The per-run session object. One `PipelineRun` holds everything a single
//! ingestion owns: selected photos, uploaded assets, groups, drafts and the
//! review cursor. It is passed explicitly (`&mut PipelineRun`) to the stage
//! that is currently driving it.

use crate::models::{DraftPatch, RunSnapshot, StageReport};
use crate::pipeline::analysis::NormalizedFields;
use crate::review::{CursorState, ReviewCursor};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Selecting,
    Queued,
    Compressing,
    Uploading,
    Enhancing,
    Grouping,
    Analysing,
    Reviewing,
    Done,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestMode {
    #[default]
    Bulk,
    /// Single product: no grouping, every photo belongs to one implicit group.
    Quick,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IngestOptions {
    #[serde(default)]
    pub mode: IngestMode,
    #[serde(default)]
    pub enhance_cover: bool,
    #[serde(default)]
    pub category_hint: Option<crate::pipeline::analysis::Category>,
}

/// Opaque handle the operator UI uses to show a local preview of a photo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct PreviewHandle(String);

impl PreviewHandle {
    fn issue(run_id: Uuid) -> Self {
        Self(format!("preview:{}:{}", run_id.simple(), Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone)]
pub struct RawPhoto {
    pub bytes: Arc<[u8]>,
    pub preview: PreviewHandle,
    pub filename: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadedAsset {
    pub id: String,
    pub original_url: String,
    pub card_url: String,
    pub thumbnail_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gallery_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnhancedCover {
    pub url: String,
    pub card_url: String,
    pub thumbnail_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gallery_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhotoGroup {
    pub id: String,
    pub photo_indexes: Vec<usize>,
    pub suggested_name: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftImage {
    pub url: String,
    pub order: usize,
    pub is_primary: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DraftStatus {
    Pending,
    Persisted { listing_id: String },
    Discarded,
}

impl DraftStatus {
    pub fn is_final(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DraftError {
    #[error("image index {index} out of range for {len} images")]
    ImageOutOfRange { index: usize, len: usize },
}

#[derive(Debug, Clone, Serialize)]
pub struct ProductDraft {
    pub group_id: String,
    pub images: Vec<DraftImage>,
    pub fields: NormalizedFields,
    pub target_user_id: Option<String>,
    /// Operator-local schedule as entered; normalized to UTC at save time.
    pub scheduled_for: Option<String>,
    pub utc_offset_minutes: Option<i32>,
    pub status: DraftStatus,
    pub last_error: Option<String>,
    pub cover_enhanced: bool,
    pub analysis_failed: bool,
}

impl ProductDraft {
    pub fn new(group_id: impl Into<String>, urls: Vec<String>, fields: NormalizedFields) -> Self {
        let images = urls
            .into_iter()
            .enumerate()
            .map(|(order, url)| DraftImage {
                url,
                order,
                is_primary: order == 0,
            })
            .collect();
        Self {
            group_id: group_id.into(),
            images,
            fields,
            target_user_id: None,
            scheduled_for: None,
            utc_offset_minutes: None,
            status: DraftStatus::Pending,
            last_error: None,
            cover_enhanced: false,
            analysis_failed: false,
        }
    }

    pub fn image_urls(&self) -> Vec<&str> {
        self.images.iter().map(|img| img.url.as_str()).collect()
    }

    pub fn cover_url(&self) -> Option<&str> {
        self.images.first().map(|img| img.url.as_str())
    }

    /// Physically moves image `index` to position 0 and relabels every entry,
    /// since persistence derives the primary image from position.
    pub fn set_cover(&mut self, index: usize) -> Result<(), DraftError> {
        if index >= self.images.len() {
            return Err(DraftError::ImageOutOfRange {
                index,
                len: self.images.len(),
            });
        }
        let chosen = self.images.remove(index);
        self.images.insert(0, chosen);
        self.relabel();
        Ok(())
    }

    fn relabel(&mut self) {
        for (order, image) in self.images.iter_mut().enumerate() {
            image.order = order;
            image.is_primary = order == 0;
        }
    }

    pub fn apply_patch(&mut self, patch: &DraftPatch) {
        let fields = &mut self.fields;
        if let Some(title) = &patch.title {
            fields.title = title.trim().to_string();
        }
        if let Some(category) = patch.category {
            fields.category = category;
        }
        macro_rules! set_optional {
            ($target:ident, $source:ident, $($field:ident),+) => {
                $(
                    if let Some(value) = &$source.$field {
                        $target.$field = Some(value.clone());
                    }
                )+
            };
        }
        set_optional!(
            fields,
            patch,
            description,
            brand,
            model,
            item_type,
            wear_notes,
            condition_rating,
            price_aud,
            original_retail_price_aud
        );
        if let Some(bike) = &patch.bike {
            fields.bike.merge(bike);
        }
        if let Some(part) = &patch.part {
            fields.part.merge(part);
        }
        if let Some(apparel) = &patch.apparel {
            fields.apparel.merge(apparel);
        }
        if let Some(target) = &patch.target_user_id {
            self.target_user_id = Some(target.trim().to_string());
        }
        if let Some(schedule) = &patch.scheduled_for {
            self.scheduled_for = Some(schedule.trim().to_string());
        }
        if let Some(offset) = patch.utc_offset_minutes {
            self.utc_offset_minutes = Some(offset);
        }
    }
}

pub struct PipelineRun {
    id: Uuid,
    owner: String,
    stage: RunStage,
    stage_tx: watch::Sender<RunStage>,
    photos: Vec<RawPhoto>,
    assets: Vec<UploadedAsset>,
    groups: Vec<PhotoGroup>,
    drafts: Vec<ProductDraft>,
    cursor: Option<ReviewCursor>,
    last_error: Option<String>,
    stages: Vec<StageReport>,
    session_token: Option<String>,
    session_ready: bool,
    root_cancel: CancellationToken,
    cancel: CancellationToken,
    created_at: DateTime<Utc>,
}

impl PipelineRun {
    pub fn new(owner: impl Into<String>) -> Self {
        let (stage_tx, _) = watch::channel(RunStage::Selecting);
        let root_cancel = CancellationToken::new();
        let cancel = root_cancel.child_token();
        Self {
            id: Uuid::new_v4(),
            owner: owner.into(),
            stage: RunStage::Selecting,
            stage_tx,
            photos: Vec::new(),
            assets: Vec::new(),
            groups: Vec::new(),
            drafts: Vec::new(),
            cursor: None,
            last_error: None,
            stages: Vec::new(),
            session_token: None,
            session_ready: false,
            root_cancel,
            cancel,
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn stage(&self) -> RunStage {
        self.stage
    }

    pub fn set_stage(&mut self, stage: RunStage) {
        self.stage = stage;
        self.stage_tx.send_replace(stage);
    }

    pub fn watch_stage(&self) -> watch::Receiver<RunStage> {
        self.stage_tx.subscribe()
    }

    /// Token for the current ingestion; replaced on every reset.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancels every present and future ingestion of this run.
    pub fn root_cancel_token(&self) -> CancellationToken {
        self.root_cancel.clone()
    }

    pub fn photos(&self) -> &[RawPhoto] {
        &self.photos
    }

    pub fn assets(&self) -> &[UploadedAsset] {
        &self.assets
    }

    pub fn groups(&self) -> &[PhotoGroup] {
        &self.groups
    }

    pub fn drafts(&self) -> &[ProductDraft] {
        &self.drafts
    }

    pub fn draft_mut(&mut self, index: usize) -> Option<&mut ProductDraft> {
        self.drafts.get_mut(index)
    }

    pub fn cursor(&self) -> Option<&ReviewCursor> {
        self.cursor.as_ref()
    }

    pub fn cursor_mut(&mut self) -> Option<&mut ReviewCursor> {
        self.cursor.as_mut()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub(crate) fn session_token(&self) -> Option<&str> {
        self.session_token.as_deref()
    }

    /// Whether the session token for this run was already obtained (it may
    /// legitimately be `None` when no token endpoint is configured).
    pub(crate) fn has_session(&self) -> bool {
        self.session_ready
    }

    pub(crate) fn set_session(&mut self, token: Option<String>) {
        self.session_token = token;
        self.session_ready = true;
    }

    pub fn add_photo(&mut self, bytes: Vec<u8>, filename: Option<String>) -> PreviewHandle {
        let preview = PreviewHandle::issue(self.id);
        self.photos.push(RawPhoto {
            bytes: Arc::from(bytes),
            preview: preview.clone(),
            filename,
        });
        preview
    }

    pub fn remove_photo(&mut self, index: usize) -> Option<RawPhoto> {
        if index >= self.photos.len() {
            return None;
        }
        let photo = self.photos.remove(index);
        debug!(target = "hermes.pipeline", run_id = %self.id, preview = photo.preview.as_str(), "preview_released");
        Some(photo)
    }

    pub(crate) fn record_stages(&mut self, reports: Vec<StageReport>) {
        self.stages.extend(reports);
    }

    pub(crate) fn commit_uploads(&mut self, assets: Vec<UploadedAsset>) {
        self.assets = assets;
    }

    pub(crate) fn commit_drafts(&mut self, groups: Vec<PhotoGroup>, drafts: Vec<ProductDraft>) {
        self.cursor = Some(ReviewCursor::new(drafts.len()));
        self.groups = groups;
        self.drafts = drafts;
        self.last_error = None;
        if self.drafts.is_empty() {
            self.finish();
        } else {
            self.set_stage(RunStage::Reviewing);
        }
    }

    /// Fatal stage failure: uploads are discarded and the operator is back at
    /// photo selection with the error surfaced. Selected photos are kept.
    pub(crate) fn abort_to_selection(&mut self, error: impl Into<String>) {
        self.assets.clear();
        self.groups.clear();
        self.drafts.clear();
        self.cursor = None;
        self.last_error = Some(error.into());
        self.set_stage(RunStage::Selecting);
    }

    /// Clears every member, releases previews and swaps in a fresh
    /// cancellation token so in-flight calls of the old ingestion stop.
    pub fn reset(&mut self) {
        self.cancel.cancel();
        self.cancel = self.root_cancel.child_token();
        for photo in self.photos.drain(..) {
            debug!(target = "hermes.pipeline", run_id = %self.id, preview = photo.preview.as_str(), "preview_released");
        }
        self.assets.clear();
        self.groups.clear();
        self.drafts.clear();
        self.cursor = None;
        self.last_error = None;
        self.session_token = None;
        self.session_ready = false;
        self.set_stage(RunStage::Selecting);
    }

    /// Terminal transition after the last draft was saved or skipped.
    pub(crate) fn finish(&mut self) {
        self.reset();
        self.cursor = Some(ReviewCursor::finished());
        self.set_stage(RunStage::Done);
    }

    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            id: self.id.to_string(),
            stage: self.stage,
            busy: false,
            created_at: Some(self.created_at),
            previews: self
                .photos
                .iter()
                .map(|p| p.preview.as_str().to_string())
                .collect(),
            assets: self.assets.clone(),
            groups: self.groups.clone(),
            drafts: self.drafts.clone(),
            cursor: self.cursor.as_ref().map(ReviewCursor::state),
            last_error: self.last_error.clone(),
            stages: self.stages.clone(),
        }
    }

    pub fn cursor_state(&self) -> Option<CursorState> {
        self.cursor.as_ref().map(ReviewCursor::state)
    }
}

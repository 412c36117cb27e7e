pub mod analysis;
pub mod compress;
pub mod grouping;
pub mod pool;
pub mod run;

use crate::config::env_usize;
use crate::llm::{GatewayAnalyser, GatewayGrouper, LlmClient, LlmConfig};
use crate::models::StageReport;
use crate::services::auth::SessionAuth;
use crate::services::enhance::HttpCoverEnhancer;
use crate::services::listings::{HttpListingStore, ListingStore};
use crate::services::storage::HttpAssetStorage;
use crate::services::{
    AssetStorage, CallContext, CoverEnhancer, PhotoGrouper, ProductAnalyser, ServiceError,
};
use compress::CompressionPolicy;
use grouping::GroupSource;
use run::{IngestMode, IngestOptions, PipelineRun, RunStage};
use serde_json::Value;
use std::{future::Future, sync::Arc, time::Instant};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct Pipeline {
    pub config: Arc<PipelineConfig>,
    services: Arc<Services>,
}

/// The collaborators a run talks to.
pub struct Services {
    pub storage: Arc<dyn AssetStorage>,
    pub enhancer: Arc<dyn CoverEnhancer>,
    pub grouper: Arc<dyn PhotoGrouper>,
    pub analyser: Arc<dyn ProductAnalyser>,
    pub listings: Arc<dyn ListingStore>,
    pub auth: SessionAuth,
}

impl Services {
    pub fn from_env() -> Self {
        let llm = Arc::new(LlmClient::new(LlmConfig::from_env()));
        Self {
            storage: Arc::new(HttpAssetStorage::from_env()),
            enhancer: Arc::new(HttpCoverEnhancer::from_env()),
            grouper: Arc::new(GatewayGrouper::new(llm.clone())),
            analyser: Arc::new(GatewayAnalyser::new(llm)),
            listings: Arc::new(HttpListingStore::from_env()),
            auth: SessionAuth::from_env(),
        }
    }
}

impl Pipeline {
    pub fn new(config: PipelineConfig, services: Services) -> Self {
        Self {
            config: Arc::new(config),
            services: Arc::new(services),
        }
    }

    pub fn from_env() -> Self {
        Self::new(PipelineConfig::from_env(), Services::from_env())
    }

    pub fn listings(&self) -> &dyn ListingStore {
        self.services.listings.as_ref()
    }

    /// Context for outbound calls of `run`. The session token is fetched the
    /// first time and reused until the run is reset.
    pub async fn call_context(&self, run: &mut PipelineRun) -> Result<CallContext, PipelineError> {
        let cancel = run.cancel_token();
        if !run.has_session() {
            let pending = CallContext::new(run.id(), None, cancel.clone());
            let token = pending
                .guard(self.services.auth.acquire())
                .await
                .map_err(|err| PipelineError::from_service("session", err))?;
            run.set_session(token);
        }
        Ok(CallContext::new(
            run.id(),
            run.session_token().map(str::to_string),
            cancel,
        ))
    }

    /// Drives one ingestion from the selected photos to the first draft
    /// under review. Fatal failures send the run back to photo selection;
    /// cancellation resets it.
    pub async fn ingest(
        &self,
        run: &mut PipelineRun,
        options: &IngestOptions,
    ) -> Result<(), PipelineError> {
        if !matches!(run.stage(), RunStage::Selecting | RunStage::Queued) {
            return Err(PipelineError::conflict(
                "ingest",
                format!("run is {:?}, expected selecting", run.stage()),
            ));
        }

        let started = Instant::now();
        info!(
            target = "hermes.pipeline",
            run_id = %run.id(),
            photos = run.photos().len(),
            mode = ?options.mode,
            enhance_cover = options.enhance_cover,
            "ingest_started"
        );

        let mut stages = Vec::new();
        let result = self.drive(run, options, &mut stages).await;
        run.record_stages(stages);

        match &result {
            Ok(()) => {
                info!(
                    target = "hermes.pipeline",
                    run_id = %run.id(),
                    drafts = run.drafts().len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "ingest_completed"
                );
            }
            Err(err) if err.kind() == PipelineErrorKind::Cancelled => {
                warn!(target = "hermes.pipeline", run_id = %run.id(), stage = err.stage(), "ingest_cancelled");
                run.reset();
            }
            Err(err) => {
                error!(
                    target = "hermes.pipeline",
                    run_id = %run.id(),
                    stage = err.stage(),
                    error = %err,
                    "ingest_failed"
                );
                run.abort_to_selection(err.to_string());
            }
        }
        result
    }

    async fn drive(
        &self,
        run: &mut PipelineRun,
        options: &IngestOptions,
        stages: &mut Vec<StageReport>,
    ) -> Result<(), PipelineError> {
        let photo_count = run.photos().len();
        if photo_count == 0 {
            return Err(PipelineError::invalid_input("ingest", "no photos selected"));
        }
        if photo_count > self.config.max_photos {
            return Err(PipelineError::invalid_input(
                "ingest",
                format!(
                    "{photo_count} photos selected, at most {} allowed",
                    self.config.max_photos
                ),
            ));
        }

        let ctx = self.call_context(run).await?;
        let services = &self.services;

        run.set_stage(RunStage::Compressing);
        let raw = run.photos().iter().map(|p| p.bytes.clone()).collect();
        let payloads = self
            .capture_stage(
                "compress",
                stages,
                stages::compress_photos(
                    raw,
                    self.config.compression,
                    self.config.upload_concurrency,
                    &ctx,
                ),
            )
            .await?;

        run.set_stage(RunStage::Uploading);
        let assets = self
            .capture_stage(
                "upload",
                stages,
                stages::upload_photos(
                    services.storage.as_ref(),
                    &ctx,
                    payloads,
                    self.config.upload_concurrency,
                ),
            )
            .await?;
        run.commit_uploads(assets.clone());

        let urls: Vec<String> = assets.iter().map(|a| a.original_url.clone()).collect();
        let groups = match options.mode {
            IngestMode::Quick => {
                stages.push(StageReport::new(
                    "group",
                    0,
                    serde_json::json!({ "source": GroupSource::Quick.as_str(), "groups": 1 }),
                ));
                vec![grouping::single_group(urls.len())]
            }
            IngestMode::Bulk => {
                run.set_stage(RunStage::Grouping);
                self.capture_stage(
                    "group",
                    stages,
                    stages::group_photos(services.grouper.as_ref(), &ctx, &urls),
                )
                .await?
            }
        };

        let mut jobs: Vec<stages::AnalysisJob> = groups
            .iter()
            .map(|group| stages::AnalysisJob {
                group_id: group.id.clone(),
                suggested_name: group.suggested_name.clone(),
                urls: group
                    .photo_indexes
                    .iter()
                    .map(|&index| urls[index].clone())
                    .collect(),
                cover_enhanced: false,
            })
            .collect();

        if options.enhance_cover {
            run.set_stage(RunStage::Enhancing);
            let covers: Vec<String> = jobs
                .iter()
                .filter_map(|job| job.urls.first().cloned())
                .collect();
            let enhanced = self
                .capture_stage(
                    "enhance",
                    stages,
                    stages::enhance_covers(services.enhancer.as_ref(), &ctx, covers),
                )
                .await?;
            for (job, cover) in jobs.iter_mut().zip(enhanced) {
                if let (Some(cover), Some(first)) = (cover, job.urls.first_mut()) {
                    *first = cover.url;
                    job.cover_enhanced = true;
                }
            }
        }

        run.set_stage(RunStage::Analysing);
        let drafts = self
            .capture_stage(
                "analyse",
                stages,
                stages::analyse_groups(
                    services.analyser.as_ref(),
                    &ctx,
                    jobs,
                    options.category_hint,
                    self.config.analysis_concurrency,
                ),
            )
            .await?;

        run.commit_drafts(groups, drafts);
        Ok(())
    }

    async fn capture_stage<T, Fut>(
        &self,
        name: &'static str,
        stages: &mut Vec<StageReport>,
        fut: Fut,
    ) -> Result<T, PipelineError>
    where
        Fut: Future<Output = Result<StageOutcome<T>, PipelineError>>,
    {
        let started = Instant::now();
        let outcome = fut.await?;
        let elapsed_ms = started.elapsed().as_millis();
        crate::metrics::stage_elapsed(name, elapsed_ms);
        stages.push(StageReport::new(name, elapsed_ms, outcome.output));
        Ok(outcome.value)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub upload_concurrency: usize,
    pub analysis_concurrency: usize,
    pub max_photos: usize,
    pub compression: CompressionPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            upload_concurrency: 3,
            analysis_concurrency: 1,
            max_photos: 60,
            compression: CompressionPolicy::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            upload_concurrency: env_usize("UPLOAD_CONCURRENCY", defaults.upload_concurrency),
            analysis_concurrency: env_usize("ANALYSIS_CONCURRENCY", defaults.analysis_concurrency),
            max_photos: env_usize("MAX_PHOTOS", defaults.max_photos),
            compression: CompressionPolicy::from_env(),
        }
    }
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    InvalidInput,
    Validation,
    NotFound,
    Conflict,
    Cancelled,
    Upstream,
    Internal,
}

impl PipelineError {
    fn with_kind(stage: &'static str, message: impl Into<String>, kind: PipelineErrorKind) -> Self {
        Self {
            stage,
            message: message.into(),
            kind,
        }
    }

    pub fn invalid_input(stage: &'static str, message: impl Into<String>) -> Self {
        Self::with_kind(stage, message, PipelineErrorKind::InvalidInput)
    }

    pub fn validation(stage: &'static str, message: impl Into<String>) -> Self {
        Self::with_kind(stage, message, PipelineErrorKind::Validation)
    }

    pub fn not_found(stage: &'static str, message: impl Into<String>) -> Self {
        Self::with_kind(stage, message, PipelineErrorKind::NotFound)
    }

    pub fn conflict(stage: &'static str, message: impl Into<String>) -> Self {
        Self::with_kind(stage, message, PipelineErrorKind::Conflict)
    }

    pub fn cancelled(stage: &'static str) -> Self {
        Self::with_kind(stage, "run was cancelled", PipelineErrorKind::Cancelled)
    }

    pub fn upstream(stage: &'static str, message: impl Into<String>) -> Self {
        Self::with_kind(stage, message, PipelineErrorKind::Upstream)
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self::with_kind(stage, message, PipelineErrorKind::Internal)
    }

    pub fn from_service(stage: &'static str, err: ServiceError) -> Self {
        match err {
            ServiceError::Cancelled => Self::cancelled(stage),
            other => Self::upstream(stage, other.to_string()),
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

#[derive(Debug)]
pub struct StageOutcome<T> {
    pub value: T,
    pub output: Value,
}

impl<T> StageOutcome<T> {
    fn new(value: T, output: Value) -> Self {
        Self { value, output }
    }
}

pub mod stages {
    use super::analysis::{self, AnalysisHints, Category};
    use super::compress::{self, CompressError, CompressionPolicy};
    use super::grouping::{self, GroupSource};
    use super::pool::{map_bounded, try_map_bounded};
    use super::run::{EnhancedCover, PhotoGroup, ProductDraft, UploadedAsset};
    use super::{PipelineError, StageOutcome};
    use crate::services::{
        AssetStorage, CallContext, CoverEnhancer, PhotoGrouper, ProductAnalyser, ServiceError,
    };
    use serde_json::json;
    use std::sync::Arc;
    use tracing::{debug, warn};

    /// Image URLs of one group, cover first, ready for analysis.
    #[derive(Debug, Clone)]
    pub struct AnalysisJob {
        pub group_id: String,
        pub suggested_name: String,
        pub urls: Vec<String>,
        pub cover_enhanced: bool,
    }

    pub async fn compress_photos(
        photos: Vec<Arc<[u8]>>,
        policy: CompressionPolicy,
        limit: usize,
        ctx: &CallContext,
    ) -> Result<StageOutcome<Vec<Arc<[u8]>>>, PipelineError> {
        let bytes_in: usize = photos.iter().map(|p| p.len()).sum();
        let originals = photos.clone();
        let work = try_map_bounded(photos, limit, |index, bytes| async move {
            compress::compress_blocking(bytes, policy)
                .await
                .map_err(|err| match err {
                    CompressError::Empty | CompressError::Decode(_) => PipelineError::invalid_input(
                        "compress",
                        format!("photo {index}: {err}"),
                    ),
                    other => PipelineError::internal("compress", format!("photo {index}: {other}")),
                })
        });
        let payloads = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(PipelineError::cancelled("compress")),
            out = work => out?,
        };
        let recompressed = payloads
            .iter()
            .zip(&originals)
            .filter(|(out, raw)| !Arc::ptr_eq(out, raw))
            .count();
        let bytes_out: usize = payloads.iter().map(|p| p.len()).sum();
        Ok(StageOutcome::new(
            payloads,
            json!({
                "count": originals.len(),
                "recompressed": recompressed,
                "bytes_in": bytes_in,
                "bytes_out": bytes_out,
            }),
        ))
    }

    pub async fn upload_photos(
        storage: &dyn AssetStorage,
        ctx: &CallContext,
        payloads: Vec<Arc<[u8]>>,
        limit: usize,
    ) -> Result<StageOutcome<Vec<UploadedAsset>>, PipelineError> {
        let count = payloads.len();
        let assets = try_map_bounded(payloads, limit, |index, payload| async move {
            let asset = ctx
                .guard(storage.upload(ctx, index, &payload))
                .await
                .map_err(|err| PipelineError::from_service("upload", err))?;
            debug!(target = "hermes.pipeline", run_id = %ctx.run_id, index, asset_id = %asset.id, "asset_uploaded");
            Ok::<_, PipelineError>(asset)
        })
        .await?;
        Ok(StageOutcome::new(
            assets,
            json!({ "count": count, "concurrency": limit.max(1) }),
        ))
    }

    pub async fn group_photos(
        grouper: &dyn PhotoGrouper,
        ctx: &CallContext,
        urls: &[String],
    ) -> Result<StageOutcome<Vec<PhotoGroup>>, PipelineError> {
        let result = ctx.guard(grouper.group(ctx, urls)).await;
        match &result {
            Err(ServiceError::Cancelled) => return Err(PipelineError::cancelled("group")),
            Err(err) => {
                warn!(target = "hermes.pipeline", run_id = %ctx.run_id, error = %err, "grouping_failed");
            }
            Ok(_) => {}
        }
        let (groups, source) = grouping::resolve_groups(result, urls.len());
        if source == GroupSource::Fallback {
            crate::metrics::fallback_applied("grouping", groups.len());
        }
        let output = json!({
            "source": source.as_str(),
            "groups": groups.len(),
            "photos": urls.len(),
        });
        Ok(StageOutcome::new(groups, output))
    }

    /// One enhancement per cover, in group order. Failures leave the cover
    /// unenhanced (`None`).
    pub async fn enhance_covers(
        enhancer: &dyn CoverEnhancer,
        ctx: &CallContext,
        covers: Vec<String>,
    ) -> Result<StageOutcome<Vec<Option<EnhancedCover>>>, PipelineError> {
        let mut enhanced = Vec::with_capacity(covers.len());
        let mut failed = 0usize;
        for (position, cover) in covers.iter().enumerate() {
            match ctx.guard(enhancer.enhance(ctx, cover)).await {
                Ok(variant) => enhanced.push(Some(variant)),
                Err(ServiceError::Cancelled) => return Err(PipelineError::cancelled("enhance")),
                Err(err) => {
                    warn!(target = "hermes.enhance", run_id = %ctx.run_id, group = position, error = %err, "cover_enhancement_failed");
                    failed += 1;
                    enhanced.push(None);
                }
            }
        }
        if failed > 0 {
            crate::metrics::fallback_applied("enhance", failed);
        }
        Ok(StageOutcome::new(
            enhanced,
            json!({ "requested": covers.len(), "failed": failed }),
        ))
    }

    pub async fn analyse_groups(
        analyser: &dyn ProductAnalyser,
        ctx: &CallContext,
        jobs: Vec<AnalysisJob>,
        hint: Option<Category>,
        limit: usize,
    ) -> Result<StageOutcome<Vec<ProductDraft>>, PipelineError> {
        let reports = map_bounded(jobs.clone(), limit, |_, job| async move {
            let hints = AnalysisHints {
                category: hint,
                suggested_name: Some(job.suggested_name.clone()),
            };
            ctx.guard(analyser.analyze(ctx, &job.urls, &hints)).await
        })
        .await;

        if reports.iter().any(|r| matches!(r, Err(ServiceError::Cancelled))) {
            return Err(PipelineError::cancelled("analyse"));
        }

        let mut failed = 0usize;
        let drafts: Vec<ProductDraft> = jobs
            .into_iter()
            .zip(reports)
            .map(|(job, report)| {
                let (fields, analysis_failed) = match report {
                    Ok(report) => (analysis::map_report(&report, hint, &job.suggested_name), false),
                    Err(err) => {
                        warn!(target = "hermes.pipeline", run_id = %ctx.run_id, group_id = %job.group_id, error = %err, "analysis_failed");
                        failed += 1;
                        (analysis::default_fields(&job.suggested_name, hint), true)
                    }
                };
                let mut draft = ProductDraft::new(job.group_id, job.urls, fields);
                draft.cover_enhanced = job.cover_enhanced;
                draft.analysis_failed = analysis_failed;
                draft
            })
            .collect();
        if failed > 0 {
            crate::metrics::fallback_applied("analysis", failed);
        }
        let output = json!({
            "drafts": drafts.len(),
            "failed": failed,
            "concurrency": limit.max(1),
        });
        Ok(StageOutcome::new(drafts, output))
    }
}


#[cfg(test)]
mod tests {
    use super::fakes::*;
    use super::run::DraftStatus;
    use super::*;
    use crate::review::{self, CursorState};
    use crate::services::GroupSuggestion;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn seven_photo_groups() -> Vec<GroupSuggestion> {
        vec![
            GroupSuggestion {
                photo_indexes: vec![0, 1, 2],
                suggested_name: Some("Road bike".into()),
                confidence: Some(0.9),
            },
            GroupSuggestion {
                photo_indexes: vec![3, 4, 5, 6],
                suggested_name: Some("Wheelset".into()),
                confidence: Some(0.6),
            },
        ]
    }

    #[tokio::test]
    async fn bulk_run_isolates_analysis_failure_and_reviews_to_done() {
        let harness = Harness::new(
            FakeStorage::default(),
            FakeEnhancer::default(),
            grouper(Ok(seven_photo_groups())),
            FakeAnalyser {
                fail_marker: Some("asset-3".into()),
                ..FakeAnalyser::default()
            },
        );
        let mut run = run_with_photos(7);
        harness
            .pipeline
            .ingest(&mut run, &IngestOptions::default())
            .await
            .expect("ingest");

        assert_eq!(run.stage(), RunStage::Reviewing);
        assert_eq!(run.assets().len(), 7);
        for (i, asset) in run.assets().iter().enumerate() {
            assert_eq!(asset.original_url, asset_url(i));
        }
        assert_eq!(run.groups().len(), 2);
        assert_eq!(run.drafts().len(), 2);

        let bike = &run.drafts()[0];
        assert_eq!(bike.fields.title, "Trek Domane road bike");
        assert_eq!(bike.fields.bike.frame_size.as_deref(), Some("56cm"));
        assert_eq!(bike.fields.price_aud, Some(2100));
        assert_eq!(bike.image_urls(), vec![asset_url(0), asset_url(1), asset_url(2)]);

        let fallback = &run.drafts()[1];
        assert!(fallback.analysis_failed);
        assert_eq!(fallback.fields.title, "Wheelset");
        assert!(fallback.fields.category_details_empty());
        assert_eq!(run.cursor_state(), Some(CursorState::Reviewing(0)));

        let names: Vec<String> = run.snapshot().stages.into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["compress", "upload", "group", "analyse"]);

        let ctx = harness.pipeline.call_context(&mut run).await.expect("ctx");
        let draft = run.draft_mut(0).expect("draft 0");
        draft.target_user_id = Some("user-7".into());
        draft.scheduled_for = Some("2026-11-02T09:30".into());
        draft.utc_offset_minutes = Some(600);
        let saved = review::save_current(&mut run, harness.pipeline.listings(), &ctx)
            .await
            .expect("save");
        assert_eq!(saved.cursor, CursorState::Reviewing(1));
        assert_eq!(saved.listing_id.as_deref(), Some("listing-1"));
        assert!(matches!(
            run.drafts()[0].status,
            DraftStatus::Persisted { .. }
        ));
        {
            let submitted = harness.listings.submitted.lock().expect("log");
            assert_eq!(submitted.len(), 1);
            assert_eq!(
                submitted[0].0,
                format!("{}:group-1", run.id().simple())
            );
            assert_eq!(submitted[0].1["scheduledFor"], "2026-11-01T23:30:00Z");
        }

        let skipped = review::skip_current(&mut run).expect("skip");
        assert_eq!(skipped.cursor, CursorState::Done);
        assert_eq!(run.stage(), RunStage::Done);
        assert!(run.drafts().is_empty());
        assert_eq!(run.cursor_state(), Some(CursorState::Done));
    }

    #[tokio::test]
    async fn quick_mode_enhances_only_the_first_image() {
        let harness = Harness::new(
            FakeStorage::default(),
            FakeEnhancer::default(),
            grouper(Err(ServiceError::Request("must not be called".into()))),
            FakeAnalyser::default(),
        );
        let mut run = run_with_photos(3);
        let options = IngestOptions {
            mode: IngestMode::Quick,
            enhance_cover: true,
            category_hint: None,
        };
        harness.pipeline.ingest(&mut run, &options).await.expect("ingest");

        let seen = harness.enhancer.seen.lock().expect("log").clone();
        assert_eq!(seen, vec![asset_url(0)]);
        assert_eq!(run.drafts().len(), 1);
        let draft = &run.drafts()[0];
        assert!(draft.cover_enhanced);
        assert_eq!(draft.cover_url(), Some("https://cdn.test/asset-0-enhanced.jpg"));
        assert_eq!(draft.images.len(), 3);
        let analysed = harness.analyser.seen.lock().expect("log").clone();
        assert_eq!(analysed[0][0], "https://cdn.test/asset-0-enhanced.jpg");
    }

    #[tokio::test]
    async fn failed_enhancement_keeps_original_cover() {
        let harness = Harness::new(
            FakeStorage::default(),
            FakeEnhancer {
                fail: true,
                ..FakeEnhancer::default()
            },
            grouper(Ok(Vec::new())),
            FakeAnalyser::default(),
        );
        let mut run = run_with_photos(3);
        let options = IngestOptions {
            mode: IngestMode::Quick,
            enhance_cover: true,
            category_hint: None,
        };
        harness.pipeline.ingest(&mut run, &options).await.expect("ingest");
        assert_eq!(harness.enhancer.seen.lock().expect("log").len(), 1);
        let draft = &run.drafts()[0];
        assert!(!draft.cover_enhanced);
        assert_eq!(draft.cover_url(), Some(asset_url(0).as_str()));
    }

    #[tokio::test]
    async fn upload_failure_returns_to_selection() {
        let harness = Harness::new(
            FakeStorage {
                fail_at: Some(2),
                ..FakeStorage::default()
            },
            FakeEnhancer::default(),
            grouper(Ok(Vec::new())),
            FakeAnalyser::default(),
        );
        let mut run = run_with_photos(5);
        let err = harness
            .pipeline
            .ingest(&mut run, &IngestOptions::default())
            .await
            .expect_err("upload must fail");
        assert_eq!(err.kind(), PipelineErrorKind::Upstream);
        assert_eq!(err.stage(), "upload");
        assert_eq!(run.stage(), RunStage::Selecting);
        assert!(run.assets().is_empty());
        assert_eq!(run.photos().len(), 5);
        assert!(run.last_error().is_some_and(|e| e.contains("503")));
    }

    #[tokio::test]
    async fn cancelling_during_upload_leaves_no_assets() {
        let harness = Harness::new(
            FakeStorage {
                delay_ms: 500,
                ..FakeStorage::default()
            },
            FakeEnhancer::default(),
            grouper(Ok(Vec::new())),
            FakeAnalyser::default(),
        );
        let mut run = run_with_photos(4);
        let cancel = run.cancel_token();
        let options = IngestOptions::default();
        let (result, _) = tokio::join!(
            harness.pipeline.ingest(&mut run, &options),
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            }
        );
        let err = result.expect_err("cancelled");
        assert_eq!(err.kind(), PipelineErrorKind::Cancelled);
        assert!(run.assets().is_empty());
        assert!(run.drafts().is_empty());
        assert_eq!(run.stage(), RunStage::Selecting);
        assert!(!run.cancel_token().is_cancelled());
    }

    #[tokio::test]
    async fn grouping_failure_falls_back_to_one_group_per_photo() {
        let harness = Harness::new(
            FakeStorage::default(),
            FakeEnhancer::default(),
            grouper(Err(ServiceError::Status {
                status: 502,
                body: "bad gateway".into(),
            })),
            FakeAnalyser::default(),
        );
        let mut run = run_with_photos(3);
        harness
            .pipeline
            .ingest(&mut run, &IngestOptions::default())
            .await
            .expect("ingest");
        let groups = run.groups();
        assert_eq!(groups.len(), 3);
        for (i, group) in groups.iter().enumerate() {
            assert_eq!(group.photo_indexes, vec![i]);
        }
        let report = run
            .snapshot()
            .stages
            .into_iter()
            .find(|s| s.name == "group")
            .expect("group stage");
        assert_eq!(report.output["source"], "fallback");
    }

    #[tokio::test]
    async fn upload_concurrency_is_bounded_and_every_photo_uploaded_once() {
        let config = PipelineConfig {
            upload_concurrency: 2,
            ..PipelineConfig::default()
        };
        let harness = Harness::with_config(
            config,
            FakeStorage {
                delay_ms: 20,
                ..FakeStorage::default()
            },
            FakeEnhancer::default(),
            grouper(Ok(Vec::new())),
            FakeAnalyser::default(),
        );
        let mut run = run_with_photos(6);
        harness
            .pipeline
            .ingest(&mut run, &IngestOptions::default())
            .await
            .expect("ingest");
        assert_eq!(harness.storage.calls.load(Ordering::SeqCst), 6);
        let peak = harness.storage.peak_in_flight.load(Ordering::SeqCst);
        assert!(peak <= 2, "peak in flight {peak}");
        assert_eq!(peak, 2);
        assert_eq!(run.assets().len(), 6);
    }

    #[tokio::test]
    async fn rejects_empty_and_oversized_selections() {
        let config = PipelineConfig {
            max_photos: 2,
            ..PipelineConfig::default()
        };
        let harness = Harness::with_config(
            config,
            FakeStorage::default(),
            FakeEnhancer::default(),
            grouper(Ok(Vec::new())),
            FakeAnalyser::default(),
        );
        let mut empty = PipelineRun::new("operator-1");
        let err = harness
            .pipeline
            .ingest(&mut empty, &IngestOptions::default())
            .await
            .expect_err("empty");
        assert_eq!(err.kind(), PipelineErrorKind::InvalidInput);

        let mut crowded = run_with_photos(3);
        let err = harness
            .pipeline
            .ingest(&mut crowded, &IngestOptions::default())
            .await
            .expect_err("too many");
        assert_eq!(err.kind(), PipelineErrorKind::InvalidInput);
        assert_eq!(harness.storage.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn ingest_is_refused_while_reviewing() {
        let harness = Harness::new(
            FakeStorage::default(),
            FakeEnhancer::default(),
            grouper(Ok(Vec::new())),
            FakeAnalyser::default(),
        );
        let mut run = run_with_photos(1);
        harness
            .pipeline
            .ingest(&mut run, &IngestOptions::default())
            .await
            .expect("ingest");
        let err = harness
            .pipeline
            .ingest(&mut run, &IngestOptions::default())
            .await
            .expect_err("already reviewing");
        assert_eq!(err.kind(), PipelineErrorKind::Conflict);
        assert_eq!(run.stage(), RunStage::Reviewing);
        assert_eq!(run.drafts().len(), 1);
    }

    #[tokio::test]
    async fn persistence_failure_keeps_cursor() {
        let harness = Harness::new(
            FakeStorage::default(),
            FakeEnhancer::default(),
            grouper(Ok(Vec::new())),
            FakeAnalyser::default(),
        );
        let mut run = run_with_photos(2);
        harness
            .pipeline
            .ingest(&mut run, &IngestOptions::default())
            .await
            .expect("ingest");
        let ctx = harness.pipeline.call_context(&mut run).await.expect("ctx");

        let err = review::save_current(&mut run, harness.pipeline.listings(), &ctx)
            .await
            .expect_err("recipient missing");
        assert_eq!(err, review::ReviewError::MissingRecipient);

        let failing = FakeListings {
            fail: true,
            ..FakeListings::default()
        };
        let draft = run.draft_mut(0).expect("draft");
        draft.target_user_id = Some("user-1".into());
        draft.scheduled_for = Some("2026-12-01".into());
        let err = review::save_current(&mut run, &failing, &ctx)
            .await
            .expect_err("store down");
        assert!(matches!(err, review::ReviewError::Persist(_)));
        assert_eq!(run.cursor_state(), Some(CursorState::Reviewing(0)));
        assert!(run.drafts()[0].last_error.is_some());
        assert_eq!(run.drafts()[0].status, DraftStatus::Pending);
    }
}

//! Review cursor: walks the operator through the drafts of a run one at a
//! time. The cursor only moves forward on an explicit save or skip; a failed
//! validation or a failed persistence keeps it where it is.

use crate::pipeline::run::{DraftStatus, PipelineRun, ProductDraft};
use crate::services::listings::{ListingReceipt, ListingStore, ListingSubmission};
use crate::services::{CallContext, ServiceError};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "index", rename_all = "snake_case")]
pub enum CursorState {
    Reviewing(usize),
    Done,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReviewError {
    #[error("review is finished")]
    Finished,
    #[error("run has no drafts under review")]
    NotReviewing,
    #[error("draft index {index} out of range for {len} drafts")]
    OutOfRange { index: usize, len: usize },
    #[error("draft {0} was already saved or skipped")]
    AlreadyFinal(usize),
    #[error("target recipient is required")]
    MissingRecipient,
    #[error("schedule date is required")]
    MissingSchedule,
    #[error("invalid schedule `{0}`")]
    InvalidSchedule(String),
    #[error("listing submission failed: {0}")]
    Persist(String),
    #[error("cancelled")]
    Cancelled,
}

impl ReviewError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Finished => "review_finished",
            Self::NotReviewing => "not_reviewing",
            Self::OutOfRange { .. } => "draft_out_of_range",
            Self::AlreadyFinal(_) => "draft_already_final",
            Self::MissingRecipient => "missing_recipient",
            Self::MissingSchedule => "missing_schedule",
            Self::InvalidSchedule(_) => "invalid_schedule",
            Self::Persist(_) => "listing_submission_failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::MissingRecipient | Self::MissingSchedule | Self::InvalidSchedule(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewCursor {
    state: CursorState,
    len: usize,
}

impl ReviewCursor {
    pub fn new(len: usize) -> Self {
        let state = if len == 0 {
            CursorState::Done
        } else {
            CursorState::Reviewing(0)
        };
        Self { state, len }
    }

    pub(crate) fn finished() -> Self {
        Self {
            state: CursorState::Done,
            len: 0,
        }
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    pub fn current(&self) -> Result<usize, ReviewError> {
        match self.state {
            CursorState::Reviewing(i) => Ok(i),
            CursorState::Done => Err(ReviewError::Finished),
        }
    }

    /// Out-of-order navigation. Neither saves nor discards anything.
    pub fn jump_to(&mut self, index: usize) -> Result<CursorState, ReviewError> {
        self.current()?;
        if index >= self.len {
            return Err(ReviewError::OutOfRange {
                index,
                len: self.len,
            });
        }
        self.state = CursorState::Reviewing(index);
        Ok(self.state)
    }

    /// Advance-or-finish after a committed save or skip of draft `i`. Moves
    /// to the next pending draft after `i`, wrapping to drafts passed over by
    /// a jump; `Done` only once nothing is pending.
    fn advance_from(&mut self, i: usize, pending: &[bool]) -> CursorState {
        let is_pending = |j: &usize| pending.get(*j).copied().unwrap_or(false);
        let next = (i + 1..self.len)
            .find(is_pending)
            .or_else(|| (0..i.min(self.len)).find(is_pending));
        self.state = match next {
            Some(j) => CursorState::Reviewing(j),
            None => CursorState::Done,
        };
        self.state
    }
}

/// Operator-local schedule to UTC. Accepts RFC 3339 (offset wins), or a
/// local `YYYY-MM-DDTHH:MM[:SS]` / `YYYY-MM-DD` shifted by `utc_offset_minutes`
/// (minutes east of UTC). A bare date means local midnight.
pub fn normalize_schedule(
    raw: &str,
    utc_offset_minutes: Option<i32>,
) -> Result<DateTime<Utc>, ReviewError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ReviewError::MissingSchedule);
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    let offset_secs = utc_offset_minutes.unwrap_or(0).saturating_mul(60);
    let offset = FixedOffset::east_opt(offset_secs)
        .ok_or_else(|| ReviewError::InvalidSchedule(raw.to_string()))?;
    let local = ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .map(|date| date.and_time(NaiveTime::MIN))
        })
        .ok_or_else(|| ReviewError::InvalidSchedule(raw.to_string()))?;
    offset
        .from_local_datetime(&local)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| ReviewError::InvalidSchedule(raw.to_string()))
}

/// Save precondition: recipient and schedule present and parseable.
pub fn validate_for_save(draft: &ProductDraft) -> Result<DateTime<Utc>, ReviewError> {
    let recipient = draft
        .target_user_id
        .as_deref()
        .map(str::trim)
        .unwrap_or_default();
    if recipient.is_empty() {
        return Err(ReviewError::MissingRecipient);
    }
    let schedule = draft.scheduled_for.as_deref().unwrap_or_default();
    normalize_schedule(schedule, draft.utc_offset_minutes)
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewOutcome {
    pub draft_index: usize,
    pub cursor: CursorState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listing_id: Option<String>,
}

fn current_pending(run: &PipelineRun) -> Result<usize, ReviewError> {
    let cursor = run.cursor().ok_or(ReviewError::NotReviewing)?;
    let index = cursor.current()?;
    let draft = run.drafts().get(index).ok_or(ReviewError::OutOfRange {
        index,
        len: run.drafts().len(),
    })?;
    if draft.status.is_final() {
        return Err(ReviewError::AlreadyFinal(index));
    }
    Ok(index)
}

fn commit(run: &mut PipelineRun, index: usize) -> CursorState {
    let pending: Vec<bool> = run
        .drafts()
        .iter()
        .map(|draft| !draft.status.is_final())
        .collect();
    let next = match run.cursor_mut() {
        Some(cursor) => cursor.advance_from(index, &pending),
        None => CursorState::Done,
    };
    if next == CursorState::Done {
        info!(target = "hermes.review", run_id = %run.id(), "review_finished");
        run.finish();
    }
    next
}

/// `Save(i)` on the draft under the cursor.
pub async fn save_current(
    run: &mut PipelineRun,
    store: &dyn ListingStore,
    ctx: &CallContext,
) -> Result<ReviewOutcome, ReviewError> {
    let index = current_pending(run)?;
    let run_id = run.id();
    let draft = &run.drafts()[index];
    let scheduled_for = validate_for_save(draft)?;
    let submission = ListingSubmission::from_draft(draft, scheduled_for);
    let idempotency_key = format!("{}:{}", run_id.simple(), draft.group_id);

    let result: Result<ListingReceipt, ServiceError> = ctx
        .guard(store.create_listing(ctx, &submission, &idempotency_key))
        .await;

    let receipt = match result {
        Ok(receipt) => receipt,
        Err(ServiceError::Cancelled) => return Err(ReviewError::Cancelled),
        Err(err) => {
            warn!(target = "hermes.review", run_id = %run_id, draft = index, error = %err, "listing_submission_failed");
            if let Some(draft) = run.draft_mut(index) {
                draft.last_error = Some(err.to_string());
            }
            return Err(ReviewError::Persist(err.to_string()));
        }
    };

    if let Some(draft) = run.draft_mut(index) {
        draft.status = DraftStatus::Persisted {
            listing_id: receipt.id.clone(),
        };
        draft.last_error = None;
    }
    info!(target = "hermes.review", run_id = %run_id, draft = index, listing_id = %receipt.id, "draft_persisted");
    let cursor = commit(run, index);
    Ok(ReviewOutcome {
        draft_index: index,
        cursor,
        listing_id: Some(receipt.id),
    })
}

/// `Skip(i)`: discard without persistence.
pub fn skip_current(run: &mut PipelineRun) -> Result<ReviewOutcome, ReviewError> {
    let index = current_pending(run)?;
    if let Some(draft) = run.draft_mut(index) {
        draft.status = DraftStatus::Discarded;
    }
    info!(target = "hermes.review", run_id = %run.id(), draft = index, "draft_discarded");
    let cursor = commit(run, index);
    Ok(ReviewOutcome {
        draft_index: index,
        cursor,
        listing_id: None,
    })
}

pub fn jump_to(run: &mut PipelineRun, index: usize) -> Result<CursorState, ReviewError> {
    run.cursor_mut()
        .ok_or(ReviewError::NotReviewing)?
        .jump_to(index)
}

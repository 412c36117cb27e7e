use crate::pipeline::run::PhotoGroup;
use crate::services::{GroupSuggestion, ServiceError};
use std::collections::HashSet;

/// Where the groups of a run came from, recorded in the stage transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupSource {
    Service,
    Fallback,
    Quick,
}

impl GroupSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Service => "service",
            Self::Fallback => "fallback",
            Self::Quick => "quick",
        }
    }
}

fn group_id(ordinal: usize) -> String {
    format!("group-{ordinal}")
}

fn default_name(ordinal: usize) -> String {
    format!("Product {ordinal}")
}

/// One singleton group per photo.
pub fn fallback_groups(asset_count: usize) -> Vec<PhotoGroup> {
    (0..asset_count)
        .map(|index| PhotoGroup {
            id: group_id(index + 1),
            photo_indexes: vec![index],
            suggested_name: default_name(index + 1),
            confidence: 1.0,
        })
        .collect()
}

/// Quick mode: every photo in one implicit group.
pub fn single_group(asset_count: usize) -> PhotoGroup {
    PhotoGroup {
        id: group_id(1),
        photo_indexes: (0..asset_count).collect(),
        suggested_name: default_name(1),
        confidence: 1.0,
    }
}

/// Enforces the group invariants on raw service output: every index in range
/// and claimed at most once across all groups, no empty groups, confidence in
/// `[0, 1]`, and a non-blank name.
pub fn sanitize_groups(suggestions: Vec<GroupSuggestion>, asset_count: usize) -> Vec<PhotoGroup> {
    let mut claimed = HashSet::new();
    let mut groups = Vec::new();
    for suggestion in suggestions {
        let indexes: Vec<usize> = suggestion
            .photo_indexes
            .into_iter()
            .filter_map(|raw| usize::try_from(raw).ok())
            .filter(|index| *index < asset_count)
            .filter(|index| claimed.insert(*index))
            .collect();
        if indexes.is_empty() {
            continue;
        }
        let ordinal = groups.len() + 1;
        let suggested_name = suggestion
            .suggested_name
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| default_name(ordinal));
        let confidence = suggestion
            .confidence
            .filter(|c| c.is_finite())
            .unwrap_or(0.0)
            .clamp(0.0, 1.0);
        groups.push(PhotoGroup {
            id: group_id(ordinal),
            photo_indexes: indexes,
            suggested_name,
            confidence,
        });
    }
    groups
}

/// Picks the degrade branch: a failed call or an empty (post-sanitising)
/// answer both fall back to one group per photo.
pub fn resolve_groups(
    result: Result<Vec<GroupSuggestion>, ServiceError>,
    asset_count: usize,
) -> (Vec<PhotoGroup>, GroupSource) {
    let groups = match result {
        Ok(suggestions) => sanitize_groups(suggestions, asset_count),
        Err(_) => Vec::new(),
    };
    if groups.is_empty() {
        (fallback_groups(asset_count), GroupSource::Fallback)
    } else {
        (groups, GroupSource::Service)
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::scoring::{Violation, ViolationKind};

/// Where the archived clip for a flagged window stands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EvidenceStatus {
    Pending,
    Archived { video_ref: String },
    /// Storage or archive kept failing after retries; score and flag stand,
    /// only the reference is missing.
    Degraded { reason: String },
}

impl EvidenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvidenceStatus::Pending => "pending",
            EvidenceStatus::Archived { .. } => "archived",
            EvidenceStatus::Degraded { .. } => "degraded",
        }
    }

    pub fn video_ref(&self) -> Option<&str> {
        match self {
            EvidenceStatus::Archived { video_ref } => Some(video_ref),
            _ => None,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, EvidenceStatus::Degraded { .. })
    }
}

/// A closed window whose score reached the flag threshold. Keyed by
/// `(session_id, window_index)`; at most one exists per window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlaggedInterval {
    pub interval_id: String,
    pub session_id: String,
    pub user_id: String,
    pub window_index: u64,
    pub interval_start: DateTime<Utc>,
    pub interval_end: DateTime<Utc>,
    pub score: u32,
    pub violations: Vec<Violation>,
    pub evidence: EvidenceStatus,
    pub flagged_at: DateTime<Utc>,
}

impl FlaggedInterval {
    pub fn interval_key(session_id: &str, window_index: u64) -> String {
        format!("{session_id}:{window_index}")
    }

    pub fn has_violation(&self, kind: ViolationKind) -> bool {
        self.violations.iter().any(|violation| violation.kind == kind)
    }
}

/// Filters for listing flagged intervals across sessions.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FlaggedQuery {
    pub min_score: Option<u32>,
    pub max_score: Option<u32>,
    pub violation_type: Option<ViolationKind>,
    pub limit: Option<usize>,
}

impl FlaggedQuery {
    pub const DEFAULT_LIMIT: usize = 100;

    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(Self::DEFAULT_LIMIT).clamp(1, 1_000)
    }

    pub fn matches(&self, interval: &FlaggedInterval) -> bool {
        self.min_score.map_or(true, |min| interval.score >= min)
            && self.max_score.map_or(true, |max| interval.score <= max)
            && self
                .violation_type
                .map_or(true, |kind| interval.has_violation(kind))
    }
}

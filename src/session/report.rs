use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::evidence::FlaggedInterval;
use crate::scoring::{violation_breakdown, BreakdownEntry, Violation, ViolationKind};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum OverallStatus {
    Flagged,
    Clear,
}

/// Summary produced once, when a session ends.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionReport {
    pub total_score: u64,
    pub total_violations: usize,
    pub violation_breakdown: BTreeMap<ViolationKind, BreakdownEntry>,
    pub interval_duration: u64,
    pub flag_threshold: u32,
    pub windows_closed: u64,
    pub num_flagged_intervals: u64,
    pub overall_status: OverallStatus,
    pub generated_at: DateTime<Utc>,
}

impl SessionReport {
    pub fn build(
        total_score: u64,
        violations: &[Violation],
        interval_duration: u64,
        flag_threshold: u32,
        windows_closed: u64,
        num_flagged_intervals: u64,
    ) -> Self {
        Self {
            total_score,
            total_violations: violations.len(),
            violation_breakdown: violation_breakdown(violations),
            interval_duration,
            flag_threshold,
            windows_closed,
            num_flagged_intervals,
            overall_status: if num_flagged_intervals > 0 {
                OverallStatus::Flagged
            } else {
                OverallStatus::Clear
            },
            generated_at: Utc::now(),
        }
    }

    pub fn empty(interval_duration: u64, flag_threshold: u32) -> Self {
        Self::build(0, &[], interval_duration, flag_threshold, 0, 0)
    }
}

/// Aggregates over a session's flagged intervals.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SessionStatistics {
    pub total_flags: usize,
    pub total_violations: usize,
    pub average_score: f64,
    pub max_score: u32,
}

impl SessionStatistics {
    pub fn from_flagged(flagged: &[FlaggedInterval]) -> Self {
        if flagged.is_empty() {
            return Self::default();
        }
        let total: u64 = flagged.iter().map(|interval| u64::from(interval.score)).sum();
        Self {
            total_flags: flagged.len(),
            total_violations: flagged.iter().map(|interval| interval.violations.len()).sum(),
            average_score: total as f64 / flagged.len() as f64,
            max_score: flagged.iter().map(|interval| interval.score).max().unwrap_or(0),
        }
    }
}

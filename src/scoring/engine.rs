use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::rules::{Severity, Violation, ViolationKind};
use super::tally::WindowTally;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowScore {
    pub score: u32,
    pub violations: Vec<Violation>,
}

/// Scores a window. Pure: the same tally always yields the same score and
/// violation list, so running it on every sample (for the live view) and
/// again at close (final) is safe.
pub fn score_window(tally: &WindowTally, window_index: u64) -> WindowScore {
    let mut violations = Vec::new();
    let mut score = 0u32;

    for trigger in &tally.triggers {
        let points = trigger.kind.points();
        for _ in 0..trigger.occurrences {
            score = score.saturating_add(points);
            violations.push(Violation {
                kind: trigger.kind,
                points,
                timestamp: trigger.at,
                severity: Severity::from_points(points),
                window_index,
                details: trigger.details.clone(),
            });
        }
    }

    WindowScore { score, violations }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BreakdownEntry {
    pub count: u32,
    pub total_score: u32,
}

/// Per-type occurrence counts and points, as shown in session reports.
pub fn violation_breakdown<'a, I>(violations: I) -> BTreeMap<ViolationKind, BreakdownEntry>
where
    I: IntoIterator<Item = &'a Violation>,
{
    let mut breakdown: BTreeMap<ViolationKind, BreakdownEntry> = BTreeMap::new();
    for violation in violations {
        let entry = breakdown.entry(violation.kind).or_default();
        entry.count += 1;
        entry.total_score += violation.points;
    }
    breakdown
}

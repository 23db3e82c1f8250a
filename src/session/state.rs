use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::report::{SessionReport, SessionStatistics};
use crate::db::{SessionRecord, SessionStatus};
use crate::evidence::FlaggedInterval;
use crate::scoring::Violation;

/// Read-only view of a session, published by its worker after every
/// mutation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    pub exam_id: String,
    pub status: SessionStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub total_score: u64,
    pub current_interval_score: u32,
    pub interval_index: u64,
    pub windows_closed: u64,
    pub flagged_windows: u64,
    pub high_risk_windows: u64,
    pub interval_duration_secs: u64,
    pub flag_threshold: u32,
}

impl Session {
    pub fn from_record(record: &SessionRecord, interval_index: u64) -> Self {
        Self {
            session_id: record.id.clone(),
            user_id: record.user_id.clone(),
            exam_id: record.exam_id.clone(),
            status: record.status,
            start_time: record.started_at,
            end_time: record.ended_at,
            total_score: record.total_score,
            current_interval_score: record.current_interval_score,
            interval_index,
            windows_closed: record.windows_closed,
            flagged_windows: record.flagged_windows,
            high_risk_windows: record.high_risk_windows,
            interval_duration_secs: record.interval_duration_secs,
            flag_threshold: record.flag_threshold,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitoringData {
    pub total_score: u64,
    pub interval_score: u32,
}

/// Everything a reviewer sees for one session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionDetails {
    pub session: Session,
    pub monitoring_data: MonitoringData,
    pub flagged_intervals: Vec<FlaggedInterval>,
    pub all_violations: Vec<Violation>,
    pub statistics: SessionStatistics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<SessionReport>,
}

impl SessionDetails {
    pub fn assemble(
        session: Session,
        flagged_intervals: Vec<FlaggedInterval>,
        all_violations: Vec<Violation>,
        report: Option<SessionReport>,
    ) -> Self {
        Self {
            monitoring_data: MonitoringData {
                total_score: session.total_score,
                interval_score: session.current_interval_score,
            },
            statistics: SessionStatistics::from_flagged(&flagged_intervals),
            session,
            flagged_intervals,
            all_violations,
            report,
        }
    }
}

/// Registry-wide counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionStats {
    pub total_sessions: usize,
    pub active_sessions: usize,
    /// Flagged windows across all sessions held in memory.
    pub flagged: u64,
    pub high_risk: u64,
}

//! Persisted form of a proctoring session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::SessionReport;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Created,
    Active,
    Ended,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Created => "Created",
            SessionStatus::Active => "Active",
            SessionStatus::Ended => "Ended",
        }
    }
}

/// One row of the `sessions` table. `revision` increases with every state
/// change so out-of-order writes from concurrent tasks cannot roll a row back.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionRecord {
    pub id: String,
    pub user_id: String,
    pub exam_id: String,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub interval_duration_secs: u64,
    pub flag_threshold: u32,
    pub total_score: u64,
    pub current_interval_score: u32,
    pub windows_closed: u64,
    pub flagged_windows: u64,
    pub high_risk_windows: u64,
    pub revision: u64,
    pub report: Option<SessionReport>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

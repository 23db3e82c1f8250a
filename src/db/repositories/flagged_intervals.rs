use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

use crate::db::{
    connection::Database,
    helpers::{parse_datetime, to_i64, to_u32, to_u64},
};
use crate::evidence::{EvidenceStatus, FlaggedInterval, FlaggedQuery};

const FLAGGED_COLUMNS: &str = "session_id, window_index, user_id, interval_start, interval_end,
    score, violations_json, evidence_state, video_ref, degraded_reason, flagged_at";

fn row_to_flagged(row: &Row) -> Result<FlaggedInterval> {
    let session_id: String = row.get("session_id")?;
    let window_index = to_u64(row.get("window_index")?, "window_index")?;
    let interval_start: String = row.get("interval_start")?;
    let interval_end: String = row.get("interval_end")?;
    let flagged_at: String = row.get("flagged_at")?;
    let violations_json: String = row.get("violations_json")?;
    let evidence_state: String = row.get("evidence_state")?;
    let video_ref: Option<String> = row.get("video_ref")?;
    let degraded_reason: Option<String> = row.get("degraded_reason")?;

    let evidence = match evidence_state.as_str() {
        "pending" => EvidenceStatus::Pending,
        "archived" => EvidenceStatus::Archived {
            video_ref: video_ref.ok_or_else(|| anyhow!("archived interval without video_ref"))?,
        },
        "degraded" => EvidenceStatus::Degraded {
            reason: degraded_reason.unwrap_or_default(),
        },
        other => return Err(anyhow!("unknown evidence state {other}")),
    };

    Ok(FlaggedInterval {
        interval_id: FlaggedInterval::interval_key(&session_id, window_index),
        user_id: row.get("user_id")?,
        window_index,
        interval_start: parse_datetime(&interval_start, "interval_start")?,
        interval_end: parse_datetime(&interval_end, "interval_end")?,
        score: to_u32(row.get("score")?, "score")?,
        violations: serde_json::from_str(&violations_json)
            .context("failed to parse stored violations")?,
        evidence,
        flagged_at: parse_datetime(&flagged_at, "flagged_at")?,
        session_id,
    })
}

fn collect_rows(rows: &mut rusqlite::Rows<'_>) -> Result<Vec<FlaggedInterval>> {
    let mut intervals = Vec::new();
    while let Some(row) = rows.next()? {
        intervals.push(row_to_flagged(row)?);
    }
    Ok(intervals)
}

impl Database {
    /// Returns `true` when the row was created, `false` when the window was
    /// already recorded. The primary key is the idempotency key.
    pub async fn insert_flagged_interval(&self, interval: &FlaggedInterval) -> Result<bool> {
        let record = interval.clone();
        self.execute(move |conn| {
            let violations_json =
                serde_json::to_string(&record.violations).context("failed to serialize violations")?;
            let now = Utc::now().to_rfc3339();
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO flagged_intervals
                    (session_id, window_index, user_id, interval_start, interval_end, score,
                     violations_json, evidence_state, video_ref, degraded_reason, flagged_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    record.session_id,
                    to_i64(record.window_index)?,
                    record.user_id,
                    record.interval_start.to_rfc3339(),
                    record.interval_end.to_rfc3339(),
                    record.score,
                    violations_json,
                    record.evidence.as_str(),
                    record.evidence.video_ref(),
                    match &record.evidence {
                        EvidenceStatus::Degraded { reason } => Some(reason.as_str()),
                        _ => None,
                    },
                    record.flagged_at.to_rfc3339(),
                    now,
                ],
            )?;
            Ok(inserted == 1)
        })
        .await
    }

    pub async fn update_evidence(
        &self,
        session_id: &str,
        window_index: u64,
        evidence: &EvidenceStatus,
    ) -> Result<()> {
        let session_id = session_id.to_string();
        let evidence = evidence.clone();
        self.execute(move |conn| {
            let reason = match &evidence {
                EvidenceStatus::Degraded { reason } => Some(reason.clone()),
                _ => None,
            };
            let updated = conn.execute(
                "UPDATE flagged_intervals
                 SET evidence_state = ?1,
                     video_ref = ?2,
                     degraded_reason = ?3,
                     updated_at = ?4
                 WHERE session_id = ?5 AND window_index = ?6",
                params![
                    evidence.as_str(),
                    evidence.video_ref(),
                    reason,
                    Utc::now().to_rfc3339(),
                    session_id,
                    to_i64(window_index)?,
                ],
            )?;
            if updated == 0 {
                return Err(anyhow!(
                    "no flagged interval {}",
                    FlaggedInterval::interval_key(&session_id, window_index)
                ));
            }
            Ok(())
        })
        .await
    }

    pub async fn get_flagged_for_session(&self, session_id: &str) -> Result<Vec<FlaggedInterval>> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let sql = format!(
                "SELECT {FLAGGED_COLUMNS} FROM flagged_intervals
                 WHERE session_id = ?1 ORDER BY window_index ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params![session_id])?;
            collect_rows(&mut rows)
        })
        .await
    }

    /// Newest first. Score bounds are applied in SQL; the violation-type
    /// filter needs the decoded list and runs afterwards.
    pub async fn list_flagged_intervals(&self, query: &FlaggedQuery) -> Result<Vec<FlaggedInterval>> {
        let query = query.clone();
        self.execute(move |conn| {
            let sql = format!(
                "SELECT {FLAGGED_COLUMNS} FROM flagged_intervals
                 WHERE score >= ?1 AND score <= ?2
                 ORDER BY flagged_at DESC, window_index DESC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params![
                query.min_score.unwrap_or(0),
                query.max_score.unwrap_or(u32::MAX),
            ])?;

            let limit = query.effective_limit();
            let mut intervals = Vec::new();
            while let Some(row) = rows.next()? {
                let interval = row_to_flagged(row)?;
                if query.matches(&interval) {
                    intervals.push(interval);
                    if intervals.len() >= limit {
                        break;
                    }
                }
            }
            Ok(intervals)
        })
        .await
    }

    /// Deletes flagged intervals flagged before `cutoff` and returns the
    /// evidence references they held so the archive can drop them too.
    pub async fn purge_flagged_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            let refs = {
                let mut stmt = tx.prepare(
                    "SELECT video_ref FROM flagged_intervals
                     WHERE flagged_at < ?1 AND video_ref IS NOT NULL",
                )?;
                let refs = stmt
                    .query_map(params![cutoff.to_rfc3339()], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                refs
            };
            tx.execute(
                "DELETE FROM flagged_intervals WHERE flagged_at < ?1",
                params![cutoff.to_rfc3339()],
            )?;
            tx.commit()?;
            Ok(refs)
        })
        .await
    }
}

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use crate::db::{
    connection::Database,
    helpers::{parse_datetime, parse_optional_datetime, parse_status, to_i64, to_u32, to_u64},
    models::{SessionRecord, SessionStatus},
};

const SESSION_COLUMNS: &str = "id, user_id, exam_id, status, started_at, ended_at,
    interval_duration_secs, flag_threshold, total_score, current_interval_score,
    windows_closed, flagged_windows, high_risk_windows, revision, report_json,
    created_at, updated_at";

fn row_to_session(row: &Row) -> Result<SessionRecord> {
    let started_at: String = row.get("started_at")?;
    let ended_at: Option<String> = row.get("ended_at")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    let status: String = row.get("status")?;
    let report_json: Option<String> = row.get("report_json")?;

    let report = report_json
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .context("failed to parse stored session report")?;

    Ok(SessionRecord {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        exam_id: row.get("exam_id")?,
        status: parse_status(&status)?,
        started_at: parse_datetime(&started_at, "started_at")?,
        ended_at: parse_optional_datetime(ended_at, "ended_at")?,
        interval_duration_secs: to_u64(row.get("interval_duration_secs")?, "interval_duration_secs")?,
        flag_threshold: to_u32(row.get("flag_threshold")?, "flag_threshold")?,
        total_score: to_u64(row.get("total_score")?, "total_score")?,
        current_interval_score: to_u32(row.get("current_interval_score")?, "current_interval_score")?,
        windows_closed: to_u64(row.get("windows_closed")?, "windows_closed")?,
        flagged_windows: to_u64(row.get("flagged_windows")?, "flagged_windows")?,
        high_risk_windows: to_u64(row.get("high_risk_windows")?, "high_risk_windows")?,
        revision: to_u64(row.get("revision")?, "revision")?,
        report,
        created_at: parse_datetime(&created_at, "created_at")?,
        updated_at: parse_datetime(&updated_at, "updated_at")?,
    })
}

impl Database {
    /// Inserts the session or updates it in place. A write carrying an older
    /// revision than the stored row is ignored.
    pub async fn upsert_session(&self, session: &SessionRecord) -> Result<()> {
        let record = session.clone();
        self.execute(move |conn| {
            let report_json = record
                .report
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .context("failed to serialize session report")?;

            conn.execute(
                "INSERT INTO sessions (id, user_id, exam_id, status, started_at, ended_at,
                    interval_duration_secs, flag_threshold, total_score, current_interval_score,
                    windows_closed, flagged_windows, high_risk_windows, revision, report_json,
                    created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
                 ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status,
                    ended_at = excluded.ended_at,
                    total_score = excluded.total_score,
                    current_interval_score = excluded.current_interval_score,
                    windows_closed = excluded.windows_closed,
                    flagged_windows = excluded.flagged_windows,
                    high_risk_windows = excluded.high_risk_windows,
                    revision = excluded.revision,
                    report_json = COALESCE(excluded.report_json, sessions.report_json),
                    updated_at = excluded.updated_at
                 WHERE excluded.revision >= sessions.revision",
                params![
                    record.id,
                    record.user_id,
                    record.exam_id,
                    record.status.as_str(),
                    record.started_at.to_rfc3339(),
                    record.ended_at.map(|dt| dt.to_rfc3339()),
                    to_i64(record.interval_duration_secs)?,
                    record.flag_threshold,
                    to_i64(record.total_score)?,
                    record.current_interval_score,
                    to_i64(record.windows_closed)?,
                    to_i64(record.flagged_windows)?,
                    to_i64(record.high_risk_windows)?,
                    to_i64(record.revision)?,
                    report_json,
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                ],
            )
            .context("failed to upsert session")?;
            Ok(())
        })
        .await
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1");
            let mut stmt = conn.prepare(&sql)?;
            let session = stmt
                .query_row(params![session_id], |row| Ok(row_to_session(row)))
                .optional()?
                .transpose()?;
            Ok(session)
        })
        .await
    }

    /// Most recently started session of a (user, exam) pair.
    pub async fn latest_session_for(
        &self,
        user_id: &str,
        exam_id: &str,
    ) -> Result<Option<SessionRecord>> {
        let user_id = user_id.to_string();
        let exam_id = exam_id.to_string();
        self.execute(move |conn| {
            let sql = format!(
                "SELECT {SESSION_COLUMNS} FROM sessions
                 WHERE user_id = ?1 AND exam_id = ?2
                 ORDER BY started_at DESC, created_at DESC
                 LIMIT 1"
            );
            let mut stmt = conn.prepare(&sql)?;
            let session = stmt
                .query_row(params![user_id, exam_id], |row| Ok(row_to_session(row)))
                .optional()?
                .transpose()?;
            Ok(session)
        })
        .await
    }

    pub async fn list_sessions_with_status(
        &self,
        status: SessionStatus,
    ) -> Result<Vec<SessionRecord>> {
        self.execute(move |conn| {
            let sql = format!(
                "SELECT {SESSION_COLUMNS} FROM sessions WHERE status = ?1 ORDER BY started_at DESC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params![status.as_str()])?;
            let mut sessions = Vec::new();
            while let Some(row) = rows.next()? {
                sessions.push(row_to_session(row)?);
            }
            Ok(sessions)
        })
        .await
    }

    /// Ends every session still marked Active. Used at startup: their
    /// workers died with the previous process.
    pub async fn end_orphaned_sessions(&self, ended_at: DateTime<Utc>) -> Result<Vec<String>> {
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            let ids = {
                let mut stmt = tx.prepare("SELECT id FROM sessions WHERE status IN ('Created', 'Active')")?;
                let ids = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                ids
            };

            tx.execute(
                "UPDATE sessions
                 SET status = 'Ended',
                     ended_at = ?1,
                     current_interval_score = 0,
                     revision = revision + 1,
                     updated_at = ?1
                 WHERE status IN ('Created', 'Active')",
                params![ended_at.to_rfc3339()],
            )?;
            tx.commit()?;
            Ok(ids)
        })
        .await
    }
}

use anyhow::Result;
use rusqlite::{params, Row};

use crate::db::{
    connection::Database,
    helpers::{parse_datetime, parse_kind, parse_severity, to_i64, to_u32, to_u64},
};
use crate::scoring::Violation;

fn row_to_violation(row: &Row) -> Result<Violation> {
    let kind: String = row.get("kind")?;
    let severity: String = row.get("severity")?;
    let timestamp: String = row.get("timestamp")?;

    Ok(Violation {
        kind: parse_kind(&kind)?,
        points: to_u32(row.get("points")?, "points")?,
        timestamp: parse_datetime(&timestamp, "timestamp")?,
        severity: parse_severity(&severity)?,
        window_index: to_u64(row.get("window_index")?, "window_index")?,
        details: row.get("details")?,
    })
}

impl Database {
    /// Stores the final violation list of one closed window. Re-running it
    /// for the same window is a no-op, which makes retries safe.
    pub async fn insert_window_violations(
        &self,
        session_id: &str,
        window_index: u64,
        violations: &[Violation],
    ) -> Result<()> {
        let session_id = session_id.to_string();
        let violations = violations.to_vec();
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR IGNORE INTO violations
                        (session_id, window_index, seq, kind, points, severity, timestamp, details)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )?;
                for (seq, violation) in violations.iter().enumerate() {
                    stmt.execute(params![
                        session_id,
                        to_i64(window_index)?,
                        seq as i64,
                        violation.kind.as_str(),
                        violation.points,
                        violation.severity.as_str(),
                        violation.timestamp.to_rfc3339(),
                        violation.details,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn get_violations_for_session(&self, session_id: &str) -> Result<Vec<Violation>> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT kind, points, severity, timestamp, window_index, details
                 FROM violations
                 WHERE session_id = ?1
                 ORDER BY window_index ASC, seq ASC",
            )?;
            let mut rows = stmt.query(params![session_id])?;
            let mut violations = Vec::new();
            while let Some(row) = rows.next()? {
                violations.push(row_to_violation(row)?);
            }
            Ok(violations)
        })
        .await
    }
}

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::archive::VideoArchive;
use crate::db::Persistence;
use crate::settings::SettingsStore;

const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

const PURGE_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// Deletes flagged intervals older than `retention_days` along with their
/// archived evidence. Returns how many evidence files were removed.
pub async fn purge_expired(
    store: &dyn Persistence,
    archive: &dyn VideoArchive,
    retention_days: u32,
) -> anyhow::Result<usize> {
    if retention_days == 0 {
        return Ok(0);
    }
    let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
    let refs = store.purge_flagged_before(cutoff).await?;

    let mut removed = 0;
    for video_ref in &refs {
        match archive.remove(video_ref).await {
            Ok(()) => removed += 1,
            Err(err) => log_warn!("failed to remove evidence {video_ref}: {err:#}"),
        }
    }
    if removed > 0 {
        log_info!("purged {removed} evidence files older than {retention_days} days");
    }
    Ok(removed)
}

/// Runs [`purge_expired`] once a day with the current retention setting.
pub fn spawn_retention_task(
    store: Arc<dyn Persistence>,
    archive: Arc<dyn VideoArchive>,
    settings: Arc<SettingsStore>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PURGE_PERIOD);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let retention_days = settings.engine().retention_days;
                    if let Err(err) = purge_expired(store.as_ref(), archive.as_ref(), retention_days).await {
                        log_error!("evidence retention purge failed: {err:#}");
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::evidence::{EvidenceStatus, FileVideoArchive, FlaggedInterval};

    #[tokio::test]
    async fn old_evidence_is_removed_with_its_row() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("test.sqlite3")).unwrap();
        let archive = FileVideoArchive::new(dir.path()).unwrap();

        let flagged_at = Utc::now() - chrono::Duration::days(45);
        let mut interval = FlaggedInterval {
            interval_id: FlaggedInterval::interval_key("s1", 0),
            session_id: "s1".into(),
            user_id: "student-1".into(),
            window_index: 0,
            interval_start: flagged_at,
            interval_end: flagged_at + chrono::Duration::seconds(30),
            score: 12,
            violations: Vec::new(),
            evidence: EvidenceStatus::Pending,
            flagged_at,
        };
        let video_ref = archive.capture(&interval).await.unwrap();
        interval.evidence = EvidenceStatus::Archived {
            video_ref: video_ref.clone(),
        };
        db.insert_flagged_interval(&interval).await.unwrap();

        assert_eq!(purge_expired(&db, &archive, 0).await.unwrap(), 0);
        assert_eq!(purge_expired(&db, &archive, 30).await.unwrap(), 1);
        assert!(db.get_flagged_for_session("s1").await.unwrap().is_empty());
        assert_eq!(archive.fetch(&video_ref).await.unwrap_err().kind(), "not_found");
    }
}

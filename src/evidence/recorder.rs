use std::sync::Arc;

use tokio::{sync::mpsc, task::JoinHandle};

use super::{
    archive::VideoArchive,
    model::{EvidenceStatus, FlaggedInterval},
    retry::{retry_with_backoff, RetryPolicy},
};
use crate::db::{Persistence, SessionRecord};
use crate::scoring::Violation;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

/// Final evidence state of a flagged window, sent back to the owning
/// session worker.
#[derive(Debug, Clone, PartialEq)]
pub struct EvidenceOutcome {
    pub window_index: u64,
    pub status: EvidenceStatus,
}

/// Fire-and-forget writer for everything a session worker produces. Each
/// call spawns its own task so scoring never waits on disk or the archive.
#[derive(Clone)]
pub struct EvidenceRecorder {
    store: Arc<dyn Persistence>,
    archive: Arc<dyn VideoArchive>,
    policy: RetryPolicy,
}

impl EvidenceRecorder {
    pub fn new(store: Arc<dyn Persistence>, archive: Arc<dyn VideoArchive>, policy: RetryPolicy) -> Self {
        Self {
            store,
            archive,
            policy,
        }
    }

    pub fn store(&self) -> &Arc<dyn Persistence> {
        &self.store
    }

    pub fn persist_session(&self, record: SessionRecord) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let policy = self.policy;
        tokio::spawn(async move {
            let label = format!("save session {} rev {}", record.id, record.revision);
            if let Err(err) = retry_with_backoff(policy, &label, || store.save_session(&record)).await {
                log_error!("{err}");
            }
        })
    }

    pub fn persist_violations(
        &self,
        session_id: String,
        window_index: u64,
        violations: Vec<Violation>,
    ) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let policy = self.policy;
        tokio::spawn(async move {
            let label = format!("save violations {session_id}:{window_index}");
            let result = retry_with_backoff(policy, &label, || {
                store.save_violations(&session_id, window_index, &violations)
            })
            .await;
            if let Err(err) = result {
                log_error!("{err}");
            }
        })
    }

    /// Stores the flagged interval, captures evidence for its window and
    /// reports the resulting [`EvidenceStatus`] on `outcome_tx`. A window
    /// that is already stored is left untouched and reports nothing.
    pub fn record_flagged(
        &self,
        interval: FlaggedInterval,
        outcome_tx: mpsc::UnboundedSender<EvidenceOutcome>,
    ) -> JoinHandle<()> {
        let recorder = self.clone();
        tokio::spawn(async move {
            let window_index = interval.window_index;
            if let Some(status) = recorder.settle(&interval).await {
                // The worker may have been evicted already; the row is durable either way.
                let _ = outcome_tx.send(EvidenceOutcome {
                    window_index,
                    status,
                });
            }
        })
    }

    async fn settle(&self, interval: &FlaggedInterval) -> Option<EvidenceStatus> {
        let key = &interval.interval_id;
        let policy = self.policy;

        let inserted = match retry_with_backoff(policy, &format!("save flagged {key}"), || {
            self.store.save_flagged_interval(interval)
        })
        .await
        {
            Ok(inserted) => inserted,
            Err(err) => {
                log_error!("{err}");
                return Some(EvidenceStatus::Degraded {
                    reason: err.to_string(),
                });
            }
        };

        if !inserted {
            log_debug!("flagged interval {key} already recorded; skipping capture");
            return None;
        }

        let status = match retry_with_backoff(policy, &format!("capture {key}"), || {
            self.archive.capture(interval)
        })
        .await
        {
            Ok(video_ref) => {
                log_info!("evidence for {key} archived as {video_ref}");
                EvidenceStatus::Archived { video_ref }
            }
            Err(err) => {
                log_warn!("evidence for {key} degraded: {err}");
                EvidenceStatus::Degraded {
                    reason: err.to_string(),
                }
            }
        };

        let update = retry_with_backoff(policy, &format!("update evidence {key}"), || {
            self.store
                .update_evidence(&interval.session_id, interval.window_index, &status)
        })
        .await;
        if let Err(err) = update {
            log_error!("{err}");
        }

        Some(status)
    }
}

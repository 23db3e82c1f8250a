use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::Utc;
use tokio::{sync::RwLock, task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{
    state::{Session, SessionDetails, SessionStats},
    worker::{spawn_session, EndOutcome, IngestReceipt, SessionHandle, WorkerConfig},
};
use crate::broadcast::BroadcastHub;
use crate::db::{SessionRecord, SessionStatus};
use crate::error::{EngineError, EngineResult};
use crate::evidence::EvidenceRecorder;
use crate::settings::SettingsStore;
use crate::signal::Signal;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

pub const DEFAULT_EXAM_ID: &str = "default_exam";

struct SessionEntry {
    handle: SessionHandle,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<String, SessionEntry>,
    /// Latest session id per (user_id, exam_id).
    identities: HashMap<(String, String), String>,
}

/// Owns every live session. Creation and eviction go through here; all
/// other state changes happen inside the session's own worker.
pub struct SessionRegistry {
    inner: RwLock<RegistryInner>,
    recorder: EvidenceRecorder,
    hub: Arc<BroadcastHub>,
    settings: Arc<SettingsStore>,
}

impl SessionRegistry {
    pub fn new(
        recorder: EvidenceRecorder,
        hub: Arc<BroadcastHub>,
        settings: Arc<SettingsStore>,
    ) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            recorder,
            hub,
            settings,
        }
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    async fn handle(&self, session_id: &str) -> Option<SessionHandle> {
        self.inner
            .read()
            .await
            .sessions
            .get(session_id)
            .map(|entry| entry.handle.clone())
    }

    pub async fn create_session(
        &self,
        user_id: &str,
        exam_id: Option<&str>,
    ) -> EngineResult<Session> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(EngineError::Validation("user_id is required".into()));
        }
        let exam_id = exam_id
            .map(str::trim)
            .filter(|exam| !exam.is_empty())
            .unwrap_or(DEFAULT_EXAM_ID);

        let settings = self.settings.engine();
        let identity = (user_id.to_string(), exam_id.to_string());

        let mut inner = self.inner.write().await;
        if let Some(existing) = inner
            .identities
            .get(&identity)
            .and_then(|id| inner.sessions.get(id))
        {
            if existing.handle.snapshot().is_active() {
                return Err(EngineError::Validation(format!(
                    "user {user_id} already has an active session for exam {exam_id}"
                )));
            }
        }

        let now = Utc::now();
        let record = SessionRecord {
            id: Uuid::new_v4().to_string(),
            user_id: identity.0.clone(),
            exam_id: identity.1.clone(),
            status: SessionStatus::Active,
            started_at: now,
            ended_at: None,
            interval_duration_secs: settings.interval_duration_secs,
            flag_threshold: settings.flag_threshold,
            total_score: 0,
            current_interval_score: 0,
            windows_closed: 0,
            flagged_windows: 0,
            high_risk_windows: 0,
            revision: 1,
            report: None,
            created_at: now,
            updated_at: now,
        };
        let config = WorkerConfig {
            high_risk_score: settings.high_risk_score,
            rollover_tick: (settings.rollover_tick_ms > 0)
                .then(|| Duration::from_millis(settings.rollover_tick_ms)),
            echo_frames: settings.echo_frames,
        };

        self.recorder.persist_session(record.clone());
        let (handle, task) =
            spawn_session(record, config, self.recorder.clone(), Arc::clone(&self.hub));
        let session = handle.snapshot();

        inner
            .identities
            .insert(identity, session.session_id.clone());
        inner
            .sessions
            .insert(session.session_id.clone(), SessionEntry { handle, task });

        log_info!(
            "session {} started for user {} exam {} ({}s windows, threshold {})",
            session.session_id,
            session.user_id,
            session.exam_id,
            session.interval_duration_secs,
            session.flag_threshold
        );
        Ok(session)
    }

    pub async fn end_session(&self, session_id: &str) -> EngineResult<EndOutcome> {
        if let Some(handle) = self.handle(session_id).await {
            return handle.end().await;
        }

        // Evicted (or from a previous run): ended sessions stay ended.
        match self.persisted(session_id).await? {
            Some(record) if record.status == SessionStatus::Ended => {
                Ok(EndOutcome::AlreadyEnded(record.report))
            }
            _ => Err(EngineError::NotFound(format!("session {session_id}"))),
        }
    }

    /// Ends the latest session of `(user_id, exam_id)`.
    pub async fn end_session_for(
        &self,
        user_id: &str,
        exam_id: Option<&str>,
    ) -> EngineResult<(String, EndOutcome)> {
        let exam_id = exam_id
            .map(str::trim)
            .filter(|exam| !exam.is_empty())
            .unwrap_or(DEFAULT_EXAM_ID);
        let user_id = user_id.trim();
        let live = self
            .inner
            .read()
            .await
            .identities
            .get(&(user_id.to_string(), exam_id.to_string()))
            .cloned();

        // Evicted or from a previous run: storage knows the latest one.
        let session_id = match live {
            Some(session_id) => session_id,
            None => self
                .recorder
                .store()
                .latest_session_for(user_id, exam_id)
                .await
                .map_err(|err| EngineError::TransientStorage(format!("{err:#}")))?
                .map(|record| record.id)
                .ok_or_else(|| {
                    EngineError::NotFound(format!("no session for user {user_id} exam {exam_id}"))
                })?,
        };

        let outcome = self.end_session(&session_id).await?;
        Ok((session_id, outcome))
    }

    pub async fn ingest(
        &self,
        session_id: &str,
        signal: Signal,
        frame: Option<String>,
    ) -> EngineResult<IngestReceipt> {
        if let Some(handle) = self.handle(session_id).await {
            return handle.ingest(signal, frame).await;
        }

        match self.persisted(session_id).await? {
            Some(record) if record.status == SessionStatus::Ended => {
                Err(EngineError::SessionEnded(session_id.to_string()))
            }
            _ => Err(EngineError::NotFound(format!("session {session_id}"))),
        }
    }

    pub async fn active(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .inner
            .read()
            .await
            .sessions
            .values()
            .map(|entry| entry.handle.snapshot())
            .filter(Session::is_active)
            .collect();
        sessions.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        sessions
    }

    pub async fn stats(&self) -> SessionStats {
        let inner = self.inner.read().await;
        let mut stats = SessionStats {
            total_sessions: inner.sessions.len(),
            ..SessionStats::default()
        };
        for entry in inner.sessions.values() {
            let session = entry.handle.snapshot();
            if session.is_active() {
                stats.active_sessions += 1;
            }
            stats.flagged += session.flagged_windows;
            stats.high_risk += session.high_risk_windows;
        }
        stats
    }

    pub async fn details(&self, session_id: &str) -> EngineResult<SessionDetails> {
        if let Some(handle) = self.handle(session_id).await {
            match handle.details().await {
                Ok(details) => return Ok(details),
                // Evicted between lookup and request; storage has the rest.
                Err(EngineError::Unavailable(_)) => {}
                Err(err) => return Err(err),
            }
        }

        let record = self
            .persisted(session_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("session {session_id}")))?;
        let store = self.recorder.store();
        let flagged = store
            .session_flagged_intervals(session_id)
            .await
            .map_err(|err| EngineError::TransientStorage(format!("{err:#}")))?;
        let violations = store
            .session_violations(session_id)
            .await
            .map_err(|err| EngineError::TransientStorage(format!("{err:#}")))?;

        let report = record.report.clone();
        let session = Session::from_record(&record, record.windows_closed);
        Ok(SessionDetails::assemble(session, flagged, violations, report))
    }

    async fn persisted(&self, session_id: &str) -> EngineResult<Option<SessionRecord>> {
        self.recorder
            .store()
            .find_session(session_id)
            .await
            .map_err(|err| EngineError::TransientStorage(format!("{err:#}")))
    }

    /// Drops ended sessions whose end lies more than `retention` in the
    /// past. Returns how many were evicted.
    pub async fn evict_ended(&self, retention: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::zero());
        let mut inner = self.inner.write().await;

        let expired: Vec<String> = inner
            .sessions
            .iter()
            .filter_map(|(id, entry)| {
                let session = entry.handle.snapshot();
                match (session.status, session.end_time) {
                    (SessionStatus::Ended, Some(ended)) if ended <= cutoff => Some(id.clone()),
                    _ => None,
                }
            })
            .collect();

        for id in &expired {
            if let Some(entry) = inner.sessions.remove(id) {
                entry.handle.cancel();
            }
        }
        inner
            .identities
            .retain(|_, session_id| !expired.contains(session_id));

        if !expired.is_empty() {
            log_debug!("evicted {} ended sessions", expired.len());
        }
        expired.len()
    }

    /// Periodically evicts ended sessions using the current
    /// `ended_retention_secs` setting.
    pub fn spawn_reaper(
        self: &Arc<Self>,
        period: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period.max(Duration::from_millis(10)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let retention = Duration::from_secs(registry.settings.engine().ended_retention_secs);
                        registry.evict_ended(retention).await;
                    }
                    _ = cancel.cancelled() => {
                        log_debug!("session reaper shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Cancels every worker and waits for them to stop.
    pub async fn shutdown(&self) {
        let entries: Vec<SessionEntry> = {
            let mut inner = self.inner.write().await;
            inner.identities.clear();
            inner.sessions.drain().map(|(_, entry)| entry).collect()
        };

        let count = entries.len();
        for entry in &entries {
            entry.handle.cancel();
        }
        for entry in entries {
            if let Err(err) = entry.task.await {
                log_warn!("session worker {} failed to join: {err}", entry.handle.session_id());
            }
        }
        log_info!("session registry shut down ({count} workers stopped)");
    }
}

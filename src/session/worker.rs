use std::{collections::BTreeMap, sync::Arc};

use chrono::Utc;
use serde::Serialize;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::{Duration, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use super::{
    report::SessionReport,
    state::{Session, SessionDetails},
    window::{ClosedWindow, IntervalAggregator},
};
use crate::broadcast::{
    BroadcastHub, HubEvent, IntervalClosed, MonitoringUpdate, SessionEnded, UpdateContext,
    WindowStatus,
};
use crate::db::{SessionRecord, SessionStatus};
use crate::error::{EngineError, EngineResult};
use crate::evidence::{EvidenceOutcome, EvidenceRecorder, FlaggedInterval, EvidenceStatus};
use crate::scoring::Violation;
use crate::signal::Signal;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

const COMMAND_QUEUE_CAPACITY: usize = 256;

/// Per-session behaviour copied from the settings at creation.
#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    pub high_risk_score: u32,
    /// `None` disables wall-clock rollover.
    pub rollover_tick: Option<Duration>,
    pub echo_frames: bool,
}

pub enum SessionCommand {
    Ingest {
        signal: Signal,
        frame: Option<String>,
        reply: oneshot::Sender<EngineResult<IngestReceipt>>,
    },
    End {
        reply: oneshot::Sender<EndOutcome>,
    },
    Details {
        reply: oneshot::Sender<SessionDetails>,
    },
}

/// What the caller learns about an accepted signal.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct IngestReceipt {
    pub session_id: String,
    pub window_index: u64,
    pub interval_score: u32,
    pub total_score: u64,
    pub status: WindowStatus,
    pub violations: Vec<Violation>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EndOutcome {
    Ended(SessionReport),
    /// The session had already ended; carries the report produced then.
    AlreadyEnded(Option<SessionReport>),
}

/// Cloneable handle to a running session worker.
#[derive(Clone)]
pub struct SessionHandle {
    session_id: String,
    commands: mpsc::Sender<SessionCommand>,
    snapshot: watch::Receiver<Session>,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Latest state published by the worker.
    pub fn snapshot(&self) -> Session {
        self.snapshot.borrow().clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> EngineResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::Unavailable(self.session_id.clone()))?;
        reply_rx
            .await
            .map_err(|_| EngineError::Unavailable(self.session_id.clone()))
    }

    pub async fn ingest(&self, signal: Signal, frame: Option<String>) -> EngineResult<IngestReceipt> {
        self.request(|reply| SessionCommand::Ingest {
            signal,
            frame,
            reply,
        })
        .await?
    }

    pub async fn end(&self) -> EngineResult<EndOutcome> {
        self.request(|reply| SessionCommand::End { reply }).await
    }

    pub async fn details(&self) -> EngineResult<SessionDetails> {
        self.request(|reply| SessionCommand::Details { reply }).await
    }
}

/// Starts the worker task for a freshly created session.
pub fn spawn_session(
    record: SessionRecord,
    config: WorkerConfig,
    recorder: EvidenceRecorder,
    hub: Arc<BroadcastHub>,
) -> (SessionHandle, JoinHandle<()>) {
    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
    let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    let worker = SessionWorker::new(record, config, recorder, hub, outcome_tx);
    let handle = SessionHandle {
        session_id: worker.record.id.clone(),
        commands: command_tx,
        snapshot: worker.snapshot_tx.subscribe(),
        cancel: cancel.clone(),
    };

    let task = tokio::spawn(worker.run(command_rx, outcome_rx, cancel));
    (handle, task)
}

struct SessionWorker {
    record: SessionRecord,
    aggregator: IntervalAggregator,
    /// Flagged windows by index; a window is flagged at most once.
    flagged: BTreeMap<u64, FlaggedInterval>,
    /// Final violations of every closed window, in order.
    violations: Vec<Violation>,
    config: WorkerConfig,
    recorder: EvidenceRecorder,
    hub: Arc<BroadcastHub>,
    snapshot_tx: watch::Sender<Session>,
    outcome_tx: mpsc::UnboundedSender<EvidenceOutcome>,
}

impl SessionWorker {
    fn new(
        record: SessionRecord,
        config: WorkerConfig,
        recorder: EvidenceRecorder,
        hub: Arc<BroadcastHub>,
        outcome_tx: mpsc::UnboundedSender<EvidenceOutcome>,
    ) -> Self {
        let aggregator = IntervalAggregator::new(record.started_at, record.interval_duration_secs);
        let (snapshot_tx, _) = watch::channel(Session::from_record(&record, 0));
        Self {
            record,
            aggregator,
            flagged: BTreeMap::new(),
            violations: Vec::new(),
            config,
            recorder,
            hub,
            snapshot_tx,
            outcome_tx,
        }
    }

    fn is_ended(&self) -> bool {
        self.record.status == SessionStatus::Ended
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<SessionCommand>,
        mut outcomes: mpsc::UnboundedReceiver<EvidenceOutcome>,
        cancel: CancellationToken,
    ) {
        let tick_enabled = self.config.rollover_tick.is_some();
        let period = self
            .config
            .rollover_tick
            .unwrap_or(Duration::from_secs(3_600))
            .max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log_debug!("session worker {} cancelled", self.record.id);
                    break;
                }
                command = commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                Some(outcome) = outcomes.recv() => self.apply_outcome(outcome),
                _ = ticker.tick(), if tick_enabled && !self.is_ended() => {
                    self.roll_to(Utc::now()).await;
                }
            }
        }
    }

    async fn handle(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Ingest {
                signal,
                frame,
                reply,
            } => {
                let result = self.ingest(signal, frame).await;
                let _ = reply.send(result);
            }
            SessionCommand::End { reply } => {
                let outcome = self.end().await;
                let _ = reply.send(outcome);
            }
            SessionCommand::Details { reply } => {
                let _ = reply.send(self.details());
            }
        }
    }

    async fn ingest(&mut self, signal: Signal, frame: Option<String>) -> EngineResult<IngestReceipt> {
        if self.is_ended() {
            return Err(EngineError::SessionEnded(self.record.id.clone()));
        }
        signal.validate()?;

        // Close any finished window before the signal lands in its own.
        self.roll_to(signal.timestamp).await;
        self.aggregator.record(&signal);

        let running = self.aggregator.running_score();
        self.record.current_interval_score = running.score;
        self.publish_snapshot();

        let status = WindowStatus::for_score(running.score, self.record.flag_threshold);
        let receipt = IngestReceipt {
            session_id: self.record.id.clone(),
            window_index: self.aggregator.open_window().index,
            interval_score: running.score,
            total_score: self.record.total_score,
            status,
            violations: running.violations.clone(),
        };

        let update = MonitoringUpdate::from_signal(
            &signal,
            frame.filter(|_| self.config.echo_frames),
            UpdateContext {
                session_id: &self.record.id,
                user_id: &self.record.user_id,
                interval_score: running.score,
                total_score: self.record.total_score,
                flag_threshold: self.record.flag_threshold,
                violations: running.violations,
            },
        );
        self.hub
            .publish(&self.record.id, HubEvent::MonitoringUpdate(update))
            .await;

        Ok(receipt)
    }

    /// Closes the open window if `now` is past its end.
    async fn roll_to(&mut self, now: chrono::DateTime<Utc>) {
        if let Some(rollover) = self.aggregator.advance_to(now) {
            self.close_window(rollover.closed, rollover.skipped).await;
        }
    }

    async fn close_window(&mut self, closed: ClosedWindow, skipped: u64) {
        let score = closed.score.score;
        let threshold = self.record.flag_threshold;
        let status = WindowStatus::for_score(score, threshold);

        self.record.total_score += u64::from(score);
        self.record.windows_closed += 1 + skipped;
        self.record.current_interval_score = 0;

        if !closed.score.violations.is_empty() {
            self.violations.extend(closed.score.violations.iter().cloned());
            self.recorder.persist_violations(
                self.record.id.clone(),
                closed.index,
                closed.score.violations.clone(),
            );
        }

        if status == WindowStatus::Flagged && !self.flagged.contains_key(&closed.index) {
            self.record.flagged_windows += 1;
            if score > self.config.high_risk_score {
                self.record.high_risk_windows += 1;
            }

            let interval = FlaggedInterval {
                interval_id: FlaggedInterval::interval_key(&self.record.id, closed.index),
                session_id: self.record.id.clone(),
                user_id: self.record.user_id.clone(),
                window_index: closed.index,
                interval_start: closed.start,
                interval_end: closed.end,
                score,
                violations: closed.score.violations.clone(),
                evidence: EvidenceStatus::Pending,
                flagged_at: Utc::now(),
            };
            log_info!(
                "session {} window {} flagged with score {score} (threshold {threshold})",
                self.record.id,
                closed.index
            );
            self.flagged.insert(closed.index, interval.clone());
            self.recorder.record_flagged(interval, self.outcome_tx.clone());
        } else {
            log_debug!(
                "session {} window {} closed clear with score {score}",
                self.record.id,
                closed.index
            );
        }

        self.commit();

        let event = HubEvent::IntervalClosed(IntervalClosed {
            session_id: self.record.id.clone(),
            user_id: self.record.user_id.clone(),
            window_index: closed.index,
            interval_start: closed.start,
            interval_end: closed.end,
            score,
            status,
            violations: closed.score.violations,
            total_score: self.record.total_score,
            skipped_windows: skipped,
        });
        self.hub.publish(&self.record.id, event).await;
    }

    async fn end(&mut self) -> EndOutcome {
        if self.is_ended() {
            return EndOutcome::AlreadyEnded(self.record.report.clone());
        }

        let now = Utc::now();
        self.roll_to(now).await;
        let last = self.aggregator.close_final(now);
        self.close_window(last, 0).await;

        let report = SessionReport::build(
            self.record.total_score,
            &self.violations,
            self.record.interval_duration_secs,
            self.record.flag_threshold,
            self.record.windows_closed,
            self.record.flagged_windows,
        );
        self.record.status = SessionStatus::Ended;
        self.record.ended_at = Some(now);
        self.record.current_interval_score = 0;
        self.record.report = Some(report.clone());
        self.commit();

        log_info!(
            "session {} ended: total score {}, {} flagged windows",
            self.record.id,
            self.record.total_score,
            self.record.flagged_windows
        );

        let event = HubEvent::SessionEnded(SessionEnded {
            session_id: self.record.id.clone(),
            user_id: self.record.user_id.clone(),
            report: report.clone(),
        });
        self.hub.publish(&self.record.id, event).await;

        EndOutcome::Ended(report)
    }

    fn details(&self) -> SessionDetails {
        let mut all_violations = self.violations.clone();
        if !self.is_ended() {
            all_violations.extend(self.aggregator.running_score().violations);
        }
        SessionDetails::assemble(
            self.projection(),
            self.flagged.values().cloned().collect(),
            all_violations,
            self.record.report.clone(),
        )
    }

    fn apply_outcome(&mut self, outcome: EvidenceOutcome) {
        match self.flagged.get_mut(&outcome.window_index) {
            Some(interval) => {
                if outcome.status.is_degraded() {
                    log_warn!(
                        "session {} window {} evidence degraded",
                        self.record.id,
                        outcome.window_index
                    );
                }
                interval.evidence = outcome.status;
            }
            None => log_warn!(
                "evidence outcome for unknown window {} of session {}",
                outcome.window_index,
                self.record.id
            ),
        }
    }

    fn projection(&self) -> Session {
        let index = if self.is_ended() {
            self.record.windows_closed
        } else {
            self.aggregator.open_window().index
        };
        Session::from_record(&self.record, index)
    }

    fn publish_snapshot(&self) {
        self.snapshot_tx.send_replace(self.projection());
    }

    /// Bumps the revision, persists the record and publishes the snapshot.
    fn commit(&mut self) {
        self.record.revision += 1;
        self.record.updated_at = Utc::now();
        self.recorder.persist_session(self.record.clone());
        self.publish_snapshot();
    }
}

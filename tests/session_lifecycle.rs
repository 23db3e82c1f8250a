//! End-to-end session flows against a real SQLite store in a temp dir.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use pretty_assertions::assert_eq;
use proctorwatch_lib::{
    broadcast::HubEvent,
    db::{Database, Persistence, SessionStatus, StoreFuture},
    error::EngineError,
    evidence::{
        ArchiveFuture, ArchivedClip, EvidenceStatus, FileVideoArchive, FlaggedInterval,
        VideoArchive,
    },
    scoring::ViolationKind,
    session::{EndOutcome, OverallStatus},
    settings::{EngineSettings, SettingsStore},
    signal::{GazeStatus, PassthroughDetector, Signal},
    AppState, SharedState,
};
use tempfile::TempDir;
use tokio::sync::mpsc;

fn test_settings(interval_secs: u64) -> EngineSettings {
    EngineSettings {
        interval_duration_secs: interval_secs,
        rollover_tick_ms: 0,
        storage_retry_base_ms: 1,
        ..EngineSettings::default()
    }
}

fn build_state(dir: &TempDir, settings: EngineSettings) -> (SharedState, Arc<Database>) {
    let database = Arc::new(Database::new(dir.path().join("test.sqlite3")).unwrap());
    let archive = Arc::new(FileVideoArchive::new(dir.path()).unwrap());
    let state = AppState::new(
        database.clone(),
        archive,
        Arc::new(PassthroughDetector),
        Arc::new(SettingsStore::in_memory(settings)),
    );
    (state, database)
}

fn secs_after(start: DateTime<Utc>, millis: i64) -> DateTime<Utc> {
    start + chrono::Duration::milliseconds(millis)
}

/// Polls until every flagged interval of the session has settled evidence.
async fn settled_flags(store: &dyn Persistence, session_id: &str, expected: usize) -> Vec<FlaggedInterval> {
    for _ in 0..200 {
        let flagged = store.session_flagged_intervals(session_id).await.unwrap();
        if flagged.len() == expected
            && flagged.iter().all(|f| f.evidence != EvidenceStatus::Pending)
        {
            return flagged;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("flagged intervals for {session_id} never settled");
}

async fn persisted_status(store: &dyn Persistence, session_id: &str, status: SessionStatus) {
    for _ in 0..200 {
        if let Some(record) = store.find_session(session_id).await.unwrap() {
            if record.status == status {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session {session_id} never reached {status:?}");
}

#[tokio::test]
async fn two_tab_switches_and_a_glance_flag_the_window() {
    let dir = tempfile::tempdir().unwrap();
    let (state, database) = build_state(&dir, test_settings(60));

    let session = state.registry.create_session("alice", Some("midterm")).await.unwrap();
    let id = session.session_id.clone();
    let start = session.start_time;

    state.registry.ingest(&id, Signal::at(secs_after(start, 100)).with_screen(1, 0), None).await.unwrap();
    state.registry.ingest(&id, Signal::at(secs_after(start, 200)).with_screen(1, 0), None).await.unwrap();
    let receipt = state
        .registry
        .ingest(&id, Signal::at(secs_after(start, 300)).with_gaze(GazeStatus::Distracted), None)
        .await
        .unwrap();
    assert_eq!(receipt.interval_score, 10);
    assert_eq!(receipt.window_index, 0);

    let report = match state.registry.end_session(&id).await.unwrap() {
        EndOutcome::Ended(report) => report,
        other => panic!("expected a fresh end, got {other:?}"),
    };
    assert_eq!(report.total_score, 10);
    assert_eq!(report.num_flagged_intervals, 1);
    assert_eq!(report.windows_closed, 1);
    assert_eq!(report.total_violations, 3);
    assert_eq!(report.violation_breakdown[&ViolationKind::TabSwitch].count, 2);
    assert_eq!(report.violation_breakdown[&ViolationKind::TabSwitch].total_score, 8);

    let flagged = settled_flags(database.as_ref(), &id, 1).await;
    assert_eq!(flagged[0].score, 10);
    assert_eq!(flagged[0].window_index, 0);
    assert!(flagged[0].evidence.video_ref().is_some());

    let clip = state
        .archive
        .fetch(flagged[0].evidence.video_ref().unwrap())
        .await
        .unwrap();
    assert!(!clip.bytes.is_empty());

    persisted_status(database.as_ref(), &id, SessionStatus::Ended).await;
}

#[tokio::test]
async fn ending_without_signals_reports_a_clean_session() {
    let dir = tempfile::tempdir().unwrap();
    let (state, database) = build_state(&dir, test_settings(60));

    let session = state.registry.create_session("bob", None).await.unwrap();
    assert_eq!(session.exam_id, "default_exam");

    let report = match state.registry.end_session(&session.session_id).await.unwrap() {
        EndOutcome::Ended(report) => report,
        other => panic!("expected a fresh end, got {other:?}"),
    };
    assert_eq!(report.total_score, 0);
    assert_eq!(report.num_flagged_intervals, 0);
    assert_eq!(report.overall_status, OverallStatus::Clear);

    let details = state.registry.details(&session.session_id).await.unwrap();
    assert_eq!(details.session.status, SessionStatus::Ended);
    assert!(details.flagged_intervals.is_empty());
    assert!(details.all_violations.is_empty());

    persisted_status(database.as_ref(), &session.session_id, SessionStatus::Ended).await;
    let stored = database.session_flagged_intervals(&session.session_id).await.unwrap();
    assert!(stored.is_empty());
}

#[tokio::test]
async fn ending_twice_returns_the_original_report() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _database) = build_state(&dir, test_settings(60));

    let session = state.registry.create_session("carol", None).await.unwrap();
    let id = session.session_id;
    state
        .registry
        .ingest(&id, Signal::at(secs_after(session.start_time, 50)).with_screen(0, 1), None)
        .await
        .unwrap();

    let first = match state.registry.end_session(&id).await.unwrap() {
        EndOutcome::Ended(report) => report,
        other => panic!("expected a fresh end, got {other:?}"),
    };
    match state.registry.end_session(&id).await.unwrap() {
        EndOutcome::AlreadyEnded(Some(report)) => assert_eq!(report, first),
        other => panic!("expected AlreadyEnded, got {other:?}"),
    }

    let err = state
        .registry
        .ingest(&id, Signal::at(Utc::now()).with_screen(1, 0), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SessionEnded(_)));
}

#[tokio::test]
async fn sessions_score_independently() {
    let dir = tempfile::tempdir().unwrap();
    let (state, database) = build_state(&dir, test_settings(60));

    let noisy = state.registry.create_session("dave", Some("final")).await.unwrap();
    let quiet = state.registry.create_session("erin", Some("final")).await.unwrap();

    let mut tasks = Vec::new();
    for offset in 0..3 {
        let registry = Arc::clone(&state.registry);
        let id = noisy.session_id.clone();
        let at = secs_after(noisy.start_time, 100 + offset);
        tasks.push(tokio::spawn(async move {
            registry.ingest(&id, Signal::at(at).with_screen(1, 0), None).await
        }));
        let registry = Arc::clone(&state.registry);
        let id = quiet.session_id.clone();
        let at = secs_after(quiet.start_time, 100 + offset);
        tasks.push(tokio::spawn(async move {
            registry.ingest(&id, Signal::at(at).with_faces(1), None).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    state.registry.end_session(&noisy.session_id).await.unwrap();
    state.registry.end_session(&quiet.session_id).await.unwrap();

    let noisy_details = state.registry.details(&noisy.session_id).await.unwrap();
    let quiet_details = state.registry.details(&quiet.session_id).await.unwrap();
    assert_eq!(noisy_details.session.total_score, 12);
    assert_eq!(noisy_details.flagged_intervals.len(), 1);
    assert_eq!(quiet_details.session.total_score, 0);
    assert!(quiet_details.flagged_intervals.is_empty());

    settled_flags(database.as_ref(), &noisy.session_id, 1).await;
    let stats = state.registry.stats().await;
    assert_eq!(stats.total_sessions, 2);
    assert_eq!(stats.active_sessions, 0);
    assert_eq!(stats.flagged, 1);
}

#[tokio::test]
async fn a_late_signal_closes_skipped_windows_as_zero() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _database) = build_state(&dir, test_settings(1));

    let session = state.registry.create_session("frank", None).await.unwrap();
    let id = session.session_id.clone();
    let start = session.start_time;

    state.registry.ingest(&id, Signal::at(secs_after(start, 100)).with_screen(1, 0), None).await.unwrap();
    let receipt = state
        .registry
        .ingest(&id, Signal::at(secs_after(start, 3_500)).with_screen(1, 0), None)
        .await
        .unwrap();
    assert_eq!(receipt.window_index, 3);
    assert_eq!(receipt.total_score, 4);

    let snapshot = state.registry.active().await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].windows_closed, 3);
    assert_eq!(snapshot[0].interval_index, 3);
}

#[tokio::test]
async fn duplicate_active_sessions_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _database) = build_state(&dir, test_settings(60));

    let first = state.registry.create_session("gina", Some("quiz")).await.unwrap();
    let err = state.registry.create_session("gina", Some("quiz")).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    let (ended_id, _) = state.registry.end_session_for("gina", Some("quiz")).await.unwrap();
    assert_eq!(ended_id, first.session_id);
    let second = state.registry.create_session("gina", Some("quiz")).await.unwrap();
    assert_ne!(second.session_id, first.session_id);
}

/// Archive whose capture always fails.
struct BrokenArchive;

impl VideoArchive for BrokenArchive {
    fn capture<'a>(&'a self, _interval: &'a FlaggedInterval) -> StoreFuture<'a, String> {
        Box::pin(async { Err(anyhow::anyhow!("disk full")) })
    }

    fn fetch<'a>(&'a self, video_ref: &'a str) -> ArchiveFuture<'a, ArchivedClip> {
        Box::pin(async move { Err(EngineError::NotFound(video_ref.to_string())) })
    }

    fn fetch_path<'a>(&'a self, raw_path: &'a str) -> ArchiveFuture<'a, ArchivedClip> {
        Box::pin(async move { Err(EngineError::NotFound(raw_path.to_string())) })
    }

    fn remove<'a>(&'a self, _video_ref: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }
}

#[tokio::test]
async fn archive_failure_degrades_evidence_but_keeps_the_flag() {
    let dir = tempfile::tempdir().unwrap();
    let database = Arc::new(Database::new(dir.path().join("test.sqlite3")).unwrap());
    let state = AppState::new(
        database.clone(),
        Arc::new(BrokenArchive),
        Arc::new(PassthroughDetector),
        Arc::new(SettingsStore::in_memory(test_settings(60))),
    );

    let session = state.registry.create_session("hank", None).await.unwrap();
    let id = session.session_id.clone();
    state
        .registry
        .ingest(&id, Signal::at(secs_after(session.start_time, 10)).with_faces(3), None)
        .await
        .unwrap();
    let report = match state.registry.end_session(&id).await.unwrap() {
        EndOutcome::Ended(report) => report,
        other => panic!("expected a fresh end, got {other:?}"),
    };
    assert_eq!(report.num_flagged_intervals, 1);

    let flagged = settled_flags(database.as_ref(), &id, 1).await;
    assert!(flagged[0].evidence.is_degraded());
    assert!(flagged[0].has_violation(ViolationKind::MultipleFaces));

    // The worker hears about the degraded evidence too.
    for _ in 0..200 {
        let details = state.registry.details(&id).await.unwrap();
        if details.flagged_intervals[0].evidence.is_degraded() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("worker never saw the degraded evidence");
}

#[tokio::test]
async fn flagged_windows_are_stored_once() {
    let dir = tempfile::tempdir().unwrap();
    let (state, database) = build_state(&dir, test_settings(60));

    let session = state.registry.create_session("iris", None).await.unwrap();
    let id = session.session_id.clone();
    state
        .registry
        .ingest(&id, Signal::at(secs_after(session.start_time, 10)).with_audio(true, true), None)
        .await
        .unwrap();
    state.registry.end_session(&id).await.unwrap();
    state.registry.end_session(&id).await.unwrap();

    let flagged = settled_flags(database.as_ref(), &id, 1).await;
    assert_eq!(flagged[0].score, 13);

    let all = database
        .flagged_intervals(&Default::default())
        .await
        .unwrap();
    assert_eq!(all.iter().filter(|f| f.session_id == id).count(), 1);
}

async fn next_event(rx: &mut mpsc::Receiver<HubEvent>) -> HubEvent {
    tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("no hub event within 3s")
        .expect("hub channel closed")
}

#[tokio::test]
async fn idle_window_closes_on_the_clock_and_resets_the_interval_score() {
    let dir = tempfile::tempdir().unwrap();
    let settings = EngineSettings {
        rollover_tick_ms: 20,
        ..test_settings(1)
    };
    let (state, _database) = build_state(&dir, settings);

    let session = state.registry.create_session("jules", None).await.unwrap();
    let id = session.session_id.clone();
    let (tx, mut rx) = mpsc::channel(64);
    state.hub.subscribe(&id, tx);

    let receipt = state
        .registry
        .ingest(&id, Signal::at(Utc::now()).with_screen(1, 0), None)
        .await
        .unwrap();
    assert_eq!(receipt.window_index, 0);

    match next_event(&mut rx).await {
        HubEvent::MonitoringUpdate(update) => {
            assert_eq!(update.session_id, id);
            assert_eq!(update.interval_score, 4);
            assert_eq!(update.screen.tab_switches, 1);
        }
        other => panic!("expected monitoring_update, got {}", other.name()),
    }

    // No further signals: only the rollover ticker can close window 0.
    match next_event(&mut rx).await {
        HubEvent::IntervalClosed(closed) => {
            assert_eq!(closed.window_index, 0);
            assert_eq!(closed.score, 4);
            assert_eq!(closed.total_score, 4);
        }
        other => panic!("expected interval_closed, got {}", other.name()),
    }

    let snapshot = state
        .registry
        .active()
        .await
        .into_iter()
        .find(|s| s.session_id == id)
        .unwrap();
    assert_eq!(snapshot.current_interval_score, 0);
    assert_eq!(snapshot.total_score, 4);
    assert!(snapshot.windows_closed >= 1);
}

#[tokio::test]
async fn total_score_is_the_sum_of_closed_windows() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _database) = build_state(&dir, test_settings(1));

    let session = state.registry.create_session("kim", None).await.unwrap();
    let id = session.session_id.clone();
    let start = session.start_time;
    let (tx, mut rx) = mpsc::channel(64);
    state.hub.subscribe(&id, tx);

    let signals = [
        Signal::at(secs_after(start, 100)).with_screen(1, 0),
        Signal::at(secs_after(start, 1_100)).with_screen(0, 1),
        Signal::at(secs_after(start, 2_100)).with_faces(2),
    ];
    let mut closed_sum = 0u64;
    for signal in signals {
        let receipt = state.registry.ingest(&id, signal, None).await.unwrap();
        loop {
            match next_event(&mut rx).await {
                HubEvent::IntervalClosed(closed) => {
                    closed_sum += u64::from(closed.score);
                    assert_eq!(closed.total_score, closed_sum);
                }
                HubEvent::MonitoringUpdate(_) => break,
                other => panic!("unexpected {}", other.name()),
            }
        }
        assert_eq!(receipt.total_score, closed_sum);
    }
    assert_eq!(closed_sum, 9);

    let report = match state.registry.end_session(&id).await.unwrap() {
        EndOutcome::Ended(report) => report,
        other => panic!("expected a fresh end, got {other:?}"),
    };
    loop {
        match next_event(&mut rx).await {
            HubEvent::IntervalClosed(closed) => closed_sum += u64::from(closed.score),
            HubEvent::SessionEnded(ended) => {
                assert_eq!(ended.report.total_score, closed_sum);
                break;
            }
            other => panic!("unexpected {}", other.name()),
        }
    }
    assert_eq!(report.total_score, 19);
    assert_eq!(report.total_score, closed_sum);
    assert_eq!(report.windows_closed, 3);
    assert_eq!(report.num_flagged_intervals, 1);
}

#[tokio::test]
async fn signals_from_the_far_future_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (state, database) = build_state(&dir, test_settings(60));

    let session = state.registry.create_session("lena", None).await.unwrap();
    let id = session.session_id.clone();

    let far = DateTime::<Utc>::MAX_UTC - chrono::Duration::seconds(5);
    let err = state
        .registry
        .ingest(&id, Signal::at(far).with_screen(1, 0), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    let receipt = state
        .registry
        .ingest(&id, Signal::at(Utc::now()).with_screen(1, 0), None)
        .await
        .unwrap();
    assert_eq!(receipt.window_index, 0);
    assert_eq!(receipt.interval_score, 4);

    assert!(matches!(
        state.registry.end_session(&id).await.unwrap(),
        EndOutcome::Ended(_)
    ));
    persisted_status(database.as_ref(), &id, SessionStatus::Ended).await;
}

#[tokio::test]
async fn oversized_screen_deltas_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _database) = build_state(&dir, test_settings(60));

    let session = state.registry.create_session("milo", None).await.unwrap();
    let id = session.session_id.clone();
    let err = state
        .registry
        .ingest(&id, Signal::at(Utc::now()).with_screen(u32::MAX, 0), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    let details = state.registry.details(&id).await.unwrap();
    assert_eq!(details.monitoring_data.interval_score, 0);
    assert!(details.all_violations.is_empty());
}

#[tokio::test]
async fn ending_by_identity_after_eviction_returns_the_stored_report() {
    let dir = tempfile::tempdir().unwrap();
    let (state, database) = build_state(&dir, test_settings(60));

    let session = state.registry.create_session("nora", Some("essay")).await.unwrap();
    let (ended_id, outcome) = state
        .registry
        .end_session_for("nora", Some("essay"))
        .await
        .unwrap();
    assert_eq!(ended_id, session.session_id);
    let report = match outcome {
        EndOutcome::Ended(report) => report,
        other => panic!("expected a fresh end, got {other:?}"),
    };

    persisted_status(database.as_ref(), &ended_id, SessionStatus::Ended).await;
    assert_eq!(state.registry.evict_ended(Duration::ZERO).await, 1);

    let (again_id, outcome) = state
        .registry
        .end_session_for("nora", Some("essay"))
        .await
        .unwrap();
    assert_eq!(again_id, ended_id);
    match outcome {
        EndOutcome::AlreadyEnded(Some(stored)) => assert_eq!(stored, report),
        other => panic!("expected AlreadyEnded, got {other:?}"),
    }

    let err = state
        .registry
        .end_session_for("nobody", Some("essay"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

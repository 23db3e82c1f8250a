pub mod api;
pub mod broadcast;
pub mod db;
pub mod error;
pub mod evidence;
pub mod scoring;
pub mod session;
pub mod settings;
pub mod signal;
mod utils;

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use chrono::Utc;
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use broadcast::BroadcastHub;
use db::{Database, Persistence};
use evidence::{EvidenceRecorder, FileVideoArchive, RetryPolicy, VideoArchive};
use session::SessionRegistry;
use settings::SettingsStore;
use signal::{Detector, PassthroughDetector};

const DEFAULT_PORT: u16 = 5000;
const REAPER_PERIOD: Duration = Duration::from_secs(60);

pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub store: Arc<dyn Persistence>,
    pub archive: Arc<dyn VideoArchive>,
    pub detector: Arc<dyn Detector>,
    pub settings: Arc<SettingsStore>,
    pub hub: Arc<BroadcastHub>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// Wires the engine together. Broadcast timeout and storage retry policy
    /// are read once here; later settings updates do not change them.
    pub fn new(
        store: Arc<dyn Persistence>,
        archive: Arc<dyn VideoArchive>,
        detector: Arc<dyn Detector>,
        settings: Arc<SettingsStore>,
    ) -> SharedState {
        let engine = settings.engine();
        let hub = Arc::new(BroadcastHub::new(engine.broadcast_timeout()));
        let policy = RetryPolicy::new(
            engine.storage_retry_attempts,
            Duration::from_millis(engine.storage_retry_base_ms),
        );
        let recorder = EvidenceRecorder::new(Arc::clone(&store), Arc::clone(&archive), policy);
        let registry = Arc::new(SessionRegistry::new(
            recorder,
            Arc::clone(&hub),
            Arc::clone(&settings),
        ));

        Arc::new(Self {
            registry,
            store,
            archive,
            detector,
            settings,
            hub,
        })
    }

    /// Opens the SQLite database and video archive under `data_dir`.
    pub fn open(data_dir: &Path, settings: SettingsStore) -> anyhow::Result<SharedState> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

        let database = Database::new(data_dir.join("proctorwatch.sqlite3"))?;
        let archive = FileVideoArchive::new(data_dir)?;

        Ok(Self::new(
            Arc::new(database),
            Arc::new(archive),
            Arc::new(PassthroughDetector),
            Arc::new(settings),
        ))
    }
}

pub fn run() {
    // Initialize logging (reads RUST_LOG env var)
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    info!("ProctorWatch starting up...");

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("Failed to start async runtime: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = runtime.block_on(serve()) {
        error!("ProctorWatch stopped with an error: {err:#}");
        std::process::exit(1);
    }
}

async fn serve() -> anyhow::Result<()> {
    let data_dir = std::env::var("PROCTOR_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("data"));
    let port = match std::env::var("PROCTOR_PORT") {
        Ok(raw) => raw
            .trim()
            .parse::<u16>()
            .with_context(|| format!("PROCTOR_PORT is not a port number: {raw}"))?,
        Err(_) => DEFAULT_PORT,
    };

    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;
    let settings = SettingsStore::new(data_dir.join("settings.json"))?;
    let state = AppState::open(&data_dir, settings)?;

    // Sessions left running by a crashed process can never be fed again.
    let orphaned = state.store.end_orphaned_sessions(Utc::now()).await?;
    for session_id in &orphaned {
        warn!("Recovered orphaned session {session_id}; marking as Ended");
    }

    let cancel = CancellationToken::new();
    let reaper = state.registry.spawn_reaper(REAPER_PERIOD, cancel.clone());
    let retention = evidence::spawn_retention_task(
        Arc::clone(&state.store),
        Arc::clone(&state.archive),
        Arc::clone(&state.settings),
        cancel.clone(),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("Listening on {addr} (data in {})", data_dir.display());

    let served = axum::serve(listener, api::router(Arc::clone(&state)))
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {err}");
            }
            info!("Shutdown requested");
        })
        .await;

    cancel.cancel();
    let _ = tokio::join!(reaper, retention);
    state.registry.shutdown().await;

    served.context("HTTP server failed")
}

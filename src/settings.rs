use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::PathBuf,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

/// Tunables applied to every session created after they are set. A session
/// copies these at creation, so an open window keeps the duration it started
/// with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineSettings {
    pub interval_duration_secs: u64,
    pub flag_threshold: u32,
    /// Flagged windows scoring strictly above this count as high risk.
    pub high_risk_score: u32,
    pub broadcast_timeout_ms: u64,
    pub subscriber_buffer: usize,
    pub storage_retry_attempts: u32,
    pub storage_retry_base_ms: u64,
    /// Wall-clock rollover check period for idle sessions; 0 disables it.
    pub rollover_tick_ms: u64,
    /// Echo the submitted frame back in `monitoring_update`.
    pub echo_frames: bool,
    pub ended_retention_secs: u64,
    /// Flagged intervals older than this are purged; 0 keeps them forever.
    pub retention_days: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            interval_duration_secs: 30,
            flag_threshold: 10,
            high_risk_score: 20,
            broadcast_timeout_ms: 50,
            subscriber_buffer: 16,
            storage_retry_attempts: 3,
            storage_retry_base_ms: 200,
            rollover_tick_ms: 1_000,
            echo_frames: true,
            ended_retention_secs: 3_600,
            retention_days: 30,
        }
    }
}

impl EngineSettings {
    pub fn interval_duration(&self) -> Duration {
        Duration::from_secs(self.interval_duration_secs)
    }

    pub fn broadcast_timeout(&self) -> Duration {
        Duration::from_millis(self.broadcast_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval_duration_secs == 0 {
            bail!("interval_duration_secs must be at least 1");
        }
        if self.flag_threshold == 0 {
            bail!("flag_threshold must be at least 1");
        }
        if self.subscriber_buffer == 0 {
            bail!("subscriber_buffer must be at least 1");
        }
        Ok(())
    }

    /// Applies `PROCTOR_*` environment overrides on top of the stored values.
    fn apply_env_overrides(&mut self) {
        if let Some(secs) = env_number::<u64>("PROCTOR_INTERVAL_SECS") {
            self.interval_duration_secs = secs;
        }
        if let Some(threshold) = env_number::<u32>("PROCTOR_FLAG_THRESHOLD") {
            self.flag_threshold = threshold;
        }

        let debug_mode = std::env::var("PROCTOR_DEBUG")
            .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if debug_mode {
            // Short windows make manual testing bearable.
            self.interval_duration_secs = self.interval_duration_secs.min(10);
        }
    }
}

fn env_number<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Ignoring unparsable {key}={raw}");
            None
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct StoredSettings {
    engine: EngineSettings,
}

pub struct SettingsStore {
    path: Option<PathBuf>,
    data: RwLock<StoredSettings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let mut data: StoredSettings = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_else(|err| {
                log::warn!("Settings file {} is malformed ({err}); using defaults", path.display());
                StoredSettings::default()
            })
        } else {
            StoredSettings::default()
        };

        data.engine.apply_env_overrides();
        data.engine
            .validate()
            .with_context(|| format!("invalid settings in {}", path.display()))?;

        Ok(Self {
            path: Some(path),
            data: RwLock::new(data),
        })
    }

    /// Settings that live only in memory; used by tests and embedders.
    pub fn in_memory(engine: EngineSettings) -> Self {
        Self {
            path: None,
            data: RwLock::new(StoredSettings { engine }),
        }
    }

    pub fn engine(&self) -> EngineSettings {
        self.read().engine.clone()
    }

    pub fn update_engine(&self, settings: EngineSettings) -> Result<()> {
        settings.validate()?;
        let mut guard = self.write();
        guard.engine = settings;
        self.persist(&guard)
    }

    fn persist(&self, data: &StoredSettings) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(path, serialized)
            .with_context(|| format!("Failed to write settings to {}", path.display()))
    }

    fn read(&self) -> RwLockReadGuard<'_, StoredSettings> {
        self.data.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoredSettings> {
        self.data.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let settings = EngineSettings::default();
        assert_eq!(settings.interval_duration_secs, 30);
        assert_eq!(settings.flag_threshold, 10);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn rejects_zero_interval_and_threshold() {
        let mut settings = EngineSettings::default();
        settings.interval_duration_secs = 0;
        assert!(settings.validate().is_err());

        let mut settings = EngineSettings::default();
        settings.flag_threshold = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn update_persists_to_disk_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let store = SettingsStore::new(path.clone()).unwrap();
        let mut updated = store.engine();
        updated.flag_threshold = 14;
        updated.interval_duration_secs = 45;
        store.update_engine(updated).unwrap();

        let reloaded = SettingsStore::new(path).unwrap();
        assert_eq!(reloaded.engine().flag_threshold, 14);
        assert_eq!(reloaded.engine().interval_duration_secs, 45);
    }

    #[test]
    fn invalid_update_leaves_previous_values() {
        let store = SettingsStore::in_memory(EngineSettings::default());
        let mut broken = store.engine();
        broken.interval_duration_secs = 0;
        assert!(store.update_engine(broken).is_err());
        assert_eq!(store.engine().interval_duration_secs, 30);
    }

    #[test]
    fn partial_file_falls_back_to_defaults_per_field() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"engine": {"flag_threshold": 12}}"#).unwrap();

        let store = SettingsStore::new(path).unwrap();
        assert_eq!(store.engine().flag_threshold, 12);
        assert_eq!(store.engine().high_risk_score, 20);
    }
}

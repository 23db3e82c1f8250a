use std::{
    future::Future,
    io::ErrorKind,
    path::{Component, Path, PathBuf},
    pin::Pin,
};

use anyhow::{anyhow, Context};
use chrono::Utc;
use serde::Serialize;

use super::model::FlaggedInterval;
use crate::db::StoreFuture;
use crate::error::{EngineError, EngineResult};
use crate::scoring::Violation;

pub type ArchiveFuture<'a, T> = Pin<Box<dyn Future<Output = EngineResult<T>> + Send + 'a>>;

pub const ARCHIVE_DIR_NAME: &str = "flagged_videos";

/// Stored evidence returned to reviewers.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchivedClip {
    pub video_ref: String,
    pub content_type: &'static str,
    pub bytes: Vec<u8>,
}

/// Where evidence for flagged windows is kept. `capture` is scoped to the
/// window bounds of the interval and returns the reference stored with it.
pub trait VideoArchive: Send + Sync {
    fn capture<'a>(&'a self, interval: &'a FlaggedInterval) -> StoreFuture<'a, String>;

    fn fetch<'a>(&'a self, video_ref: &'a str) -> ArchiveFuture<'a, ArchivedClip>;

    /// Looks a clip up by a filesystem path as handed out to clients.
    /// Anything resolving outside the archive root is `Forbidden`.
    fn fetch_path<'a>(&'a self, raw_path: &'a str) -> ArchiveFuture<'a, ArchivedClip>;

    fn remove<'a>(&'a self, video_ref: &'a str) -> StoreFuture<'a, ()>;
}

#[derive(Serialize)]
struct EvidenceManifest<'a> {
    session_id: &'a str,
    user_id: &'a str,
    window_index: u64,
    interval_start: String,
    interval_end: String,
    score: u32,
    violations: &'a [Violation],
    captured_at: String,
}

/// Archive on local disk, one folder per user under `flagged_videos/`.
/// The engine has no media of its own, so each capture writes a JSON
/// manifest describing the window; recorders that do have footage drop
/// their files alongside it.
#[derive(Debug, Clone)]
pub struct FileVideoArchive {
    root: PathBuf,
}

impl FileVideoArchive {
    pub fn new(data_dir: &Path) -> anyhow::Result<Self> {
        let root = data_dir.join(ARCHIVE_DIR_NAME);
        std::fs::create_dir_all(&root)
            .with_context(|| format!("failed to create archive directory {}", root.display()))?;
        let root = root
            .canonicalize()
            .with_context(|| format!("failed to resolve archive directory {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn file_name_for(interval: &FlaggedInterval) -> String {
        format!(
            "flagged_{}_{:06}_score{}.json",
            interval.session_id, interval.window_index, interval.score
        )
    }

    fn path_for_ref(&self, video_ref: &str) -> EngineResult<PathBuf> {
        let candidate = normalize(&self.root.join(video_ref));
        if candidate.starts_with(&self.root) && candidate != self.root {
            Ok(candidate)
        } else {
            Err(EngineError::Forbidden(format!("{video_ref} is outside the archive")))
        }
    }

    fn resolve_raw_path(&self, raw_path: &str) -> EngineResult<PathBuf> {
        let raw = Path::new(raw_path);
        let absolute = if raw.is_absolute() {
            normalize(raw)
        } else {
            // Clients receive paths of the form `flagged_videos/<user>/<file>`.
            let base = self.root.parent().unwrap_or(&self.root);
            normalize(&base.join(raw))
        };

        if absolute.starts_with(&self.root) && absolute != self.root {
            Ok(absolute)
        } else {
            Err(EngineError::Forbidden(
                "Invalid video path - security check failed".into(),
            ))
        }
    }

    /// Follows symlinks and re-checks the real location against the root.
    async fn confine(&self, path: PathBuf) -> EngineResult<PathBuf> {
        let resolved = match tokio::fs::canonicalize(&path).await {
            Ok(resolved) => resolved,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(EngineError::NotFound("Video not found".into()));
            }
            Err(err) => {
                return Err(EngineError::TransientStorage(format!(
                    "failed to resolve {}: {err}",
                    path.display()
                )));
            }
        };

        if resolved.starts_with(&self.root) && resolved != self.root {
            Ok(resolved)
        } else {
            Err(EngineError::Forbidden(format!(
                "{} resolves outside the archive",
                path.display()
            )))
        }
    }

    async fn read_clip(&self, path: PathBuf) -> EngineResult<ArchivedClip> {
        let path = self.confine(path).await?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(EngineError::NotFound("Video not found".into()));
            }
            Err(err) => {
                return Err(EngineError::TransientStorage(format!(
                    "failed to read {}: {err}",
                    path.display()
                )));
            }
        };

        let video_ref = path
            .strip_prefix(&self.root)
            .map(|relative| relative.to_string_lossy().replace('\\', "/"))
            .unwrap_or_default();

        Ok(ArchivedClip {
            video_ref,
            content_type: content_type_for(&path),
            bytes,
        })
    }
}

impl VideoArchive for FileVideoArchive {
    fn capture<'a>(&'a self, interval: &'a FlaggedInterval) -> StoreFuture<'a, String> {
        Box::pin(async move {
            let user_dir = sanitize_segment(&interval.user_id);
            let folder = self.root.join(&user_dir);
            tokio::fs::create_dir_all(&folder)
                .await
                .with_context(|| format!("failed to create {}", folder.display()))?;

            let file_name = Self::file_name_for(interval);
            let manifest = EvidenceManifest {
                session_id: &interval.session_id,
                user_id: &interval.user_id,
                window_index: interval.window_index,
                interval_start: interval.interval_start.to_rfc3339(),
                interval_end: interval.interval_end.to_rfc3339(),
                score: interval.score,
                violations: &interval.violations,
                captured_at: Utc::now().to_rfc3339(),
            };
            let body = serde_json::to_vec_pretty(&manifest)
                .context("failed to serialize evidence manifest")?;

            let path = folder.join(&file_name);
            tokio::fs::write(&path, body)
                .await
                .with_context(|| format!("failed to write {}", path.display()))?;

            Ok::<_, anyhow::Error>(format!("{user_dir}/{file_name}"))
        })
    }

    fn fetch<'a>(&'a self, video_ref: &'a str) -> ArchiveFuture<'a, ArchivedClip> {
        Box::pin(async move {
            let path = self.path_for_ref(video_ref)?;
            self.read_clip(path).await
        })
    }

    fn fetch_path<'a>(&'a self, raw_path: &'a str) -> ArchiveFuture<'a, ArchivedClip> {
        Box::pin(async move {
            if raw_path.trim().is_empty() {
                return Err(EngineError::Validation("video_path is required".into()));
            }
            let path = self.resolve_raw_path(raw_path)?;
            self.read_clip(path).await
        })
    }

    fn remove<'a>(&'a self, video_ref: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let path = self
                .path_for_ref(video_ref)
                .map_err(|err| anyhow!("refusing to remove {video_ref}: {err}"))?;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
                Err(err) => Err(anyhow!(err).context(format!("failed to remove {}", path.display()))),
            }
        })
    }
}

/// Lexically resolves `.` and `..` without touching the filesystem, so a
/// path to a missing file can still be checked against the root.
fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

fn sanitize_segment(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "unknown_user".into()
    } else {
        cleaned
    }
}

fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        Some("json") => "application/json",
        _ => "application/octet-stream",
    }
}

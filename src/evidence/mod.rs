pub mod archive;
pub mod model;
pub mod recorder;
pub mod retention;
pub mod retry;

pub use archive::{ArchiveFuture, ArchivedClip, FileVideoArchive, VideoArchive, ARCHIVE_DIR_NAME};
pub use model::{EvidenceStatus, FlaggedInterval, FlaggedQuery};
pub use recorder::{EvidenceOutcome, EvidenceRecorder};
pub use retention::{purge_expired, spawn_retention_task};
pub use retry::{retry_with_backoff, RetryPolicy};

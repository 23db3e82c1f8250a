pub mod registry;
pub mod report;
pub mod state;
pub mod window;
pub mod worker;

pub use registry::{SessionRegistry, DEFAULT_EXAM_ID};
pub use report::{OverallStatus, SessionReport, SessionStatistics};
pub use state::{MonitoringData, Session, SessionDetails, SessionStats};
pub use window::{ClosedWindow, IntervalAggregator, OpenWindow, Rollover};
pub use worker::{EndOutcome, IngestReceipt, SessionHandle, WorkerConfig};

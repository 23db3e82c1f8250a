pub mod detector;
pub mod model;

pub use detector::{Detector, FrameSubmission, Observation, PassthroughDetector};
pub use model::{
    AudioReading, FacePresence, FaceReading, GazeReading, GazeStatus, ScreenDelta, Signal,
    MAX_CLOCK_SKEW_SECS, MAX_SCREEN_EVENTS_PER_SAMPLE, SIGNAL_VERSION,
};

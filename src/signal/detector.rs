use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::model::{AudioReading, FaceReading, GazeReading, ScreenDelta, Signal, SIGNAL_VERSION};

/// Body of a frame submission. `frame` is opaque to the engine; the optional
/// readings are classifications already produced upstream (in-browser
/// models), which the pass-through detector forwards unchanged.
#[derive(Debug, Clone, Deserialize)]
pub struct FrameSubmission {
    #[serde(default)]
    pub frame: Option<String>,
    #[serde(default, alias = "screenActivity")]
    pub screen_activity: Option<ScreenDelta>,
    #[serde(default)]
    pub gaze: Option<GazeReading>,
    #[serde(default)]
    pub faces: Option<FaceReading>,
    #[serde(default)]
    pub audio: Option<AudioReading>,
}

/// What a detector saw in one frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Observation {
    pub gaze: Option<GazeReading>,
    pub faces: Option<FaceReading>,
    pub audio: Option<AudioReading>,
}

impl Observation {
    pub fn into_signal(self, screen: Option<ScreenDelta>, timestamp: DateTime<Utc>) -> Signal {
        Signal {
            version: SIGNAL_VERSION,
            timestamp,
            gaze: self.gaze,
            faces: self.faces,
            audio: self.audio,
            screen: screen.filter(|delta| !delta.is_empty()),
        }
    }
}

/// Turns a submitted frame into an observation. Implementations may block
/// (model inference); callers run them on the blocking pool.
pub trait Detector: Send + Sync {
    fn observe(&self, submission: &FrameSubmission) -> Result<Observation>;
}

/// Forwards readings classified before submission.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughDetector;

impl Detector for PassthroughDetector {
    fn observe(&self, submission: &FrameSubmission) -> Result<Observation> {
        let Some(frame) = submission.frame.as_deref() else {
            bail!("Missing frame data");
        };
        // Data URLs carry a "data:image/jpeg;base64," header before the payload.
        let payload = frame.split_once(',').map(|(_, body)| body).unwrap_or(frame);
        if payload.trim().is_empty() {
            bail!("Invalid frame data");
        }

        Ok(Observation {
            gaze: submission.gaze,
            faces: submission.faces,
            audio: submission.audio,
        })
    }
}

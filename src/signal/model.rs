use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Wire/schema version of [`Signal`]. Bump when a field changes meaning.
pub const SIGNAL_VERSION: u16 = 1;

/// How far ahead of the server clock a sample may be stamped.
pub const MAX_CLOCK_SKEW_SECS: i64 = 300;

/// Upper bound on tab switches or copy/paste events carried by one sample.
pub const MAX_SCREEN_EVENTS_PER_SAMPLE: u32 = 100;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GazeStatus {
    Focused,
    Distracted,
}

impl Default for GazeStatus {
    fn default() -> Self {
        GazeStatus::Focused
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GazeReading {
    pub status: GazeStatus,
    #[serde(default = "centered")]
    pub horizontal_ratio: f64,
    #[serde(default = "centered")]
    pub vertical_ratio: f64,
}

fn centered() -> f64 {
    0.5
}

impl Default for GazeReading {
    fn default() -> Self {
        Self {
            status: GazeStatus::Focused,
            horizontal_ratio: centered(),
            vertical_ratio: centered(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct FaceReading {
    pub count: u32,
}

/// Classification of a face count. One sample lands in exactly one bucket,
/// so "no face" and "multiple faces" can never both fire for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacePresence {
    Absent,
    Single,
    Multiple,
}

impl FaceReading {
    pub fn presence(&self) -> FacePresence {
        match self.count {
            0 => FacePresence::Absent,
            1 => FacePresence::Single,
            _ => FacePresence::Multiple,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AudioReading {
    #[serde(default)]
    pub speech_detected: bool,
    #[serde(default)]
    pub multiple_speakers: bool,
}

/// Screen activity since the previous sample. Browser clients send
/// camelCase keys, detectors send snake_case; both are accepted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ScreenDelta {
    #[serde(default, alias = "tabSwitches")]
    pub tab_switches: u32,
    #[serde(default, alias = "copyPasteEvents")]
    pub copy_paste_events: u32,
    #[serde(default, alias = "windowBlurred")]
    pub window_blurred: bool,
}

impl ScreenDelta {
    pub fn is_empty(&self) -> bool {
        self.tab_switches == 0 && self.copy_paste_events == 0 && !self.window_blurred
    }
}

/// One timestamped detector observation. Every modality is optional: a
/// sample carries whatever the detectors produced for that instant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Signal {
    #[serde(default = "current_version")]
    pub version: u16,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gaze: Option<GazeReading>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub faces: Option<FaceReading>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<AudioReading>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen: Option<ScreenDelta>,
}

fn current_version() -> u16 {
    SIGNAL_VERSION
}

impl Signal {
    pub fn at(timestamp: DateTime<Utc>) -> Self {
        Self {
            version: SIGNAL_VERSION,
            timestamp,
            gaze: None,
            faces: None,
            audio: None,
            screen: None,
        }
    }

    pub fn with_gaze(mut self, status: GazeStatus) -> Self {
        self.gaze = Some(GazeReading {
            status,
            ..GazeReading::default()
        });
        self
    }

    pub fn with_faces(mut self, count: u32) -> Self {
        self.faces = Some(FaceReading { count });
        self
    }

    pub fn with_audio(mut self, speech_detected: bool, multiple_speakers: bool) -> Self {
        self.audio = Some(AudioReading {
            speech_detected,
            multiple_speakers,
        });
        self
    }

    pub fn with_screen(mut self, tab_switches: u32, copy_paste_events: u32) -> Self {
        self.screen = Some(ScreenDelta {
            tab_switches,
            copy_paste_events,
            window_blurred: false,
        });
        self
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.version != SIGNAL_VERSION {
            return Err(EngineError::Validation(format!(
                "unsupported signal version {} (expected {SIGNAL_VERSION})",
                self.version
            )));
        }
        let latest = Utc::now() + chrono::Duration::seconds(MAX_CLOCK_SKEW_SECS);
        if self.timestamp > latest {
            return Err(EngineError::Validation(format!(
                "signal timestamp {} is ahead of the server clock",
                self.timestamp.to_rfc3339()
            )));
        }
        if let Some(screen) = &self.screen {
            if screen.tab_switches > MAX_SCREEN_EVENTS_PER_SAMPLE
                || screen.copy_paste_events > MAX_SCREEN_EVENTS_PER_SAMPLE
            {
                return Err(EngineError::Validation(format!(
                    "at most {MAX_SCREEN_EVENTS_PER_SAMPLE} screen events per sample"
                )));
            }
        }
        if let Some(gaze) = &self.gaze {
            let in_range = |ratio: f64| ratio.is_finite() && (0.0..=1.0).contains(&ratio);
            if !in_range(gaze.horizontal_ratio) || !in_range(gaze.vertical_ratio) {
                return Err(EngineError::Validation(
                    "gaze ratios must be within [0, 1]".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn is_distracted(&self) -> bool {
        matches!(
            self.gaze,
            Some(GazeReading {
                status: GazeStatus::Distracted,
                ..
            })
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn face_presence_buckets_are_exclusive() {
        assert_eq!(FaceReading { count: 0 }.presence(), FacePresence::Absent);
        assert_eq!(FaceReading { count: 1 }.presence(), FacePresence::Single);
        assert_eq!(FaceReading { count: 4 }.presence(), FacePresence::Multiple);
    }

    #[test]
    fn screen_delta_accepts_browser_keys() {
        let delta: ScreenDelta =
            serde_json::from_str(r#"{"tabSwitches": 2, "copyPasteEvents": 1}"#).unwrap();
        assert_eq!(delta.tab_switches, 2);
        assert_eq!(delta.copy_paste_events, 1);
        assert!(!delta.window_blurred);
    }

    #[test]
    fn missing_version_defaults_to_current() {
        let signal: Signal =
            serde_json::from_str(r#"{"timestamp": "2026-01-05T10:00:00Z", "faces": {"count": 2}}"#)
                .unwrap();
        assert_eq!(signal.version, SIGNAL_VERSION);
        assert!(signal.validate().is_ok());
    }

    #[test]
    fn rejects_unknown_version_and_bad_ratios() {
        let mut signal = Signal::at(Utc::now());
        signal.version = 7;
        assert!(matches!(signal.validate(), Err(EngineError::Validation(_))));

        let mut signal = Signal::at(Utc::now());
        signal.gaze = Some(GazeReading {
            status: GazeStatus::Focused,
            horizontal_ratio: 1.4,
            vertical_ratio: 0.5,
        });
        assert!(signal.validate().is_err());
    }

    #[test]
    fn rejects_timestamps_ahead_of_the_clock() {
        let skewed = Utc::now() + chrono::Duration::seconds(MAX_CLOCK_SKEW_SECS + 60);
        assert!(matches!(
            Signal::at(skewed).validate(),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            Signal::at(DateTime::<Utc>::MAX_UTC).validate(),
            Err(EngineError::Validation(_))
        ));

        let slightly_ahead = Utc::now() + chrono::Duration::seconds(5);
        assert!(Signal::at(slightly_ahead).validate().is_ok());
    }

    #[test]
    fn caps_screen_events_per_sample() {
        let at_cap = Signal::at(Utc::now()).with_screen(MAX_SCREEN_EVENTS_PER_SAMPLE, 0);
        assert!(at_cap.validate().is_ok());

        let tabs = Signal::at(Utc::now()).with_screen(u32::MAX, 0);
        assert!(matches!(tabs.validate(), Err(EngineError::Validation(_))));
        let pastes = Signal::at(Utc::now()).with_screen(0, MAX_SCREEN_EVENTS_PER_SAMPLE + 1);
        assert!(pastes.validate().is_err());
    }
}

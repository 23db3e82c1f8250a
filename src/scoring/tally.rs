use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::signal::{FacePresence, Signal};

use super::rules::ViolationKind;

/// One rule firing inside a window. Screen events arrive as deltas, so a
/// single sample can carry several occurrences of the same trigger.
#[derive(Debug, Clone, PartialEq)]
pub struct Trigger {
    pub kind: ViolationKind,
    pub at: DateTime<Utc>,
    pub occurrences: u32,
    pub details: String,
}

/// Accumulated state of one window: the triggers in arrival order plus the
/// number of samples folded in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowTally {
    pub samples: u32,
    pub triggers: Vec<Trigger>,
}

impl WindowTally {
    pub fn is_empty(&self) -> bool {
        self.samples == 0
    }

    /// Applies the accumulation column of the rule table to one signal.
    pub fn record(&mut self, signal: &Signal) {
        self.samples += 1;
        let at = signal.timestamp;

        if signal.is_distracted() {
            self.push(ViolationKind::GazeDistracted, at, 1, "Looking away from screen".into());
        }

        if let Some(faces) = &signal.faces {
            match faces.presence() {
                FacePresence::Absent => {
                    self.push(ViolationKind::NoFaceDetected, at, 1, "No face detected".into())
                }
                FacePresence::Multiple => self.push(
                    ViolationKind::MultipleFaces,
                    at,
                    1,
                    format!("{} faces detected", faces.count),
                ),
                FacePresence::Single => {}
            }
        }

        if let Some(audio) = &signal.audio {
            if audio.speech_detected {
                self.push(ViolationKind::SpeechDetected, at, 1, "Speech detected".into());
            }
            if audio.multiple_speakers {
                self.push(ViolationKind::MultipleVoices, at, 1, "Multiple speakers detected".into());
            }
        }

        if let Some(screen) = &signal.screen {
            if screen.tab_switches > 0 {
                self.push(
                    ViolationKind::TabSwitch,
                    at,
                    screen.tab_switches,
                    format!("{} tab switches", screen.tab_switches),
                );
            }
            if screen.copy_paste_events > 0 {
                self.push(
                    ViolationKind::CopyPaste,
                    at,
                    screen.copy_paste_events,
                    format!("{} copy/paste events", screen.copy_paste_events),
                );
            }
        }
    }

    /// Occurrences per trigger kind.
    pub fn counts(&self) -> BTreeMap<ViolationKind, u32> {
        let mut counts = BTreeMap::new();
        for trigger in &self.triggers {
            *counts.entry(trigger.kind).or_insert(0) += trigger.occurrences;
        }
        counts
    }

    fn push(&mut self, kind: ViolationKind, at: DateTime<Utc>, occurrences: u32, details: String) {
        self.triggers.push(Trigger {
            kind,
            at,
            occurrences,
            details,
        });
    }
}

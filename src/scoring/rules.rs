use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Closed set of rule triggers. Point values and severities are data on the
/// variant so call sites never re-derive them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    GazeDistracted,
    SpeechDetected,
    MultipleVoices,
    TabSwitch,
    CopyPaste,
    MultipleFaces,
    #[serde(alias = "no_face")]
    NoFaceDetected,
}

impl ViolationKind {
    pub const ALL: [ViolationKind; 7] = [
        ViolationKind::GazeDistracted,
        ViolationKind::SpeechDetected,
        ViolationKind::MultipleVoices,
        ViolationKind::TabSwitch,
        ViolationKind::CopyPaste,
        ViolationKind::MultipleFaces,
        ViolationKind::NoFaceDetected,
    ];

    pub fn points(self) -> u32 {
        match self {
            ViolationKind::GazeDistracted => 2,
            ViolationKind::NoFaceDetected => 9,
            ViolationKind::MultipleFaces => 10,
            ViolationKind::SpeechDetected => 3,
            ViolationKind::MultipleVoices => 10,
            ViolationKind::TabSwitch => 4,
            ViolationKind::CopyPaste => 5,
        }
    }

    pub fn severity(self) -> Severity {
        Severity::from_points(self.points())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ViolationKind::GazeDistracted => "gaze_distracted",
            ViolationKind::SpeechDetected => "speech_detected",
            ViolationKind::MultipleVoices => "multiple_voices",
            ViolationKind::TabSwitch => "tab_switch",
            ViolationKind::CopyPaste => "copy_paste",
            ViolationKind::MultipleFaces => "multiple_faces",
            ViolationKind::NoFaceDetected => "no_face_detected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        if value == "no_face" {
            return Some(ViolationKind::NoFaceDetected);
        }
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    /// low < 5, medium 5..=9, high >= 10
    pub fn from_points(points: u32) -> Self {
        match points {
            0..=4 => Severity::Low,
            5..=9 => Severity::Medium,
            _ => Severity::High,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Violation {
    #[serde(rename = "type")]
    pub kind: ViolationKind,
    #[serde(rename = "score")]
    pub points: u32,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub window_index: u64,
    pub details: String,
}

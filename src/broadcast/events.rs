use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::scoring::Violation;
use crate::session::SessionReport;
use crate::signal::{GazeStatus, Signal};

/// Server-to-observer message, serialized as `{"event": name, "data": payload}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum HubEvent {
    MonitoringUpdate(MonitoringUpdate),
    IntervalClosed(IntervalClosed),
    SessionEnded(SessionEnded),
}

impl HubEvent {
    pub fn name(&self) -> &'static str {
        match self {
            HubEvent::MonitoringUpdate(_) => "monitoring_update",
            HubEvent::IntervalClosed(_) => "interval_closed",
            HubEvent::SessionEnded(_) => "session_ended",
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            HubEvent::MonitoringUpdate(update) => &update.session_id,
            HubEvent::IntervalClosed(closed) => &closed.session_id,
            HubEvent::SessionEnded(ended) => &ended.session_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GazePayload {
    pub status: GazeStatus,
    pub horizontal_ratio: f64,
    pub vertical_ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FacesPayload {
    pub count: u32,
    pub has_multiple: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioPayload {
    pub speech_detected: bool,
    pub multiple_speakers: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScreenPayload {
    pub tab_switches: u32,
    pub copy_paste_events: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WindowStatus {
    Clear,
    Flagged,
}

impl WindowStatus {
    pub fn for_score(score: u32, flag_threshold: u32) -> Self {
        if score >= flag_threshold {
            WindowStatus::Flagged
        } else {
            WindowStatus::Clear
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitoringUpdate {
    pub session_id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame: Option<String>,
    pub gaze: GazePayload,
    pub faces: FacesPayload,
    pub audio: AudioPayload,
    pub screen: ScreenPayload,
    pub interval_score: u32,
    pub total_score: u64,
    pub violations: Vec<Violation>,
    pub status: WindowStatus,
    pub timestamp: DateTime<Utc>,
}

/// Running totals of the session at the moment an update is emitted.
#[derive(Debug, Clone)]
pub struct UpdateContext<'a> {
    pub session_id: &'a str,
    pub user_id: &'a str,
    pub interval_score: u32,
    pub total_score: u64,
    pub flag_threshold: u32,
    pub violations: Vec<Violation>,
}

impl MonitoringUpdate {
    pub fn from_signal(signal: &Signal, frame: Option<String>, context: UpdateContext<'_>) -> Self {
        let gaze = signal.gaze.unwrap_or_default();
        // A sample without a face reading says nothing about presence.
        let face_count = signal.faces.map_or(1, |faces| faces.count);
        let audio = signal.audio.unwrap_or_default();
        let screen = signal.screen.unwrap_or_default();

        Self {
            session_id: context.session_id.to_string(),
            user_id: context.user_id.to_string(),
            frame,
            gaze: GazePayload {
                status: gaze.status,
                horizontal_ratio: gaze.horizontal_ratio,
                vertical_ratio: gaze.vertical_ratio,
            },
            faces: FacesPayload {
                count: face_count,
                has_multiple: face_count > 1,
            },
            audio: AudioPayload {
                speech_detected: audio.speech_detected,
                multiple_speakers: audio.multiple_speakers,
            },
            screen: ScreenPayload {
                tab_switches: screen.tab_switches,
                copy_paste_events: screen.copy_paste_events,
            },
            interval_score: context.interval_score,
            total_score: context.total_score,
            status: WindowStatus::for_score(context.interval_score, context.flag_threshold),
            violations: context.violations,
            timestamp: signal.timestamp,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IntervalClosed {
    pub session_id: String,
    pub user_id: String,
    pub window_index: u64,
    pub interval_start: DateTime<Utc>,
    pub interval_end: DateTime<Utc>,
    pub score: u32,
    pub status: WindowStatus,
    pub violations: Vec<Violation>,
    pub total_score: u64,
    /// Empty windows closed in bulk ahead of this one.
    #[serde(default)]
    pub skipped_windows: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionEnded {
    pub session_id: String,
    pub user_id: String,
    pub report: SessionReport,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::GazeStatus;

    #[test]
    fn monitoring_update_has_wire_shape() {
        let signal = Signal::at(Utc::now())
            .with_gaze(GazeStatus::Distracted)
            .with_faces(2);
        let update = MonitoringUpdate::from_signal(
            &signal,
            None,
            UpdateContext {
                session_id: "s1",
                user_id: "u1",
                interval_score: 12,
                total_score: 30,
                flag_threshold: 10,
                violations: Vec::new(),
            },
        );

        let json = serde_json::to_value(HubEvent::MonitoringUpdate(update)).unwrap();
        assert_eq!(json["event"], "monitoring_update");
        let data = &json["data"];
        assert_eq!(data["gaze"]["status"], "distracted");
        assert_eq!(data["faces"]["has_multiple"], true);
        assert_eq!(data["audio"]["speech_detected"], false);
        assert_eq!(data["screen"]["tab_switches"], 0);
        assert_eq!(data["status"], "flagged");
        assert!(data.get("frame").is_none());
    }

    #[test]
    fn clear_below_threshold() {
        assert_eq!(WindowStatus::for_score(9, 10), WindowStatus::Clear);
        assert_eq!(WindowStatus::for_score(10, 10), WindowStatus::Flagged);
    }
}

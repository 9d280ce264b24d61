//! Event types broadcast by the alarm controller and the detection session.
//!
//! | Event | Publisher | Subscribe with |
//! |-------|-----------|----------------|
//! | `AlarmStatusEvent` | `AlarmController` | `AlarmController::subscribe_status` |
//! | `ClassificationEvent` | classification worker | `DetectionSession::subscribe_classifications` |

use serde::{Deserialize, Serialize};

use crate::alarm::SchedulerPhase;
use crate::detect::EpisodeId;

// ---------------------------------------------------------------------------
// Alarm status
// ---------------------------------------------------------------------------

/// Published whenever the controller's observable state changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmStatusEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    pub phase: SchedulerPhase,
    pub firing: bool,
    pub detection: DetectionStatus,
    /// `HH:MM`, or `None` when no alarm is set.
    pub trigger_time: Option<String>,
    pub detail: Option<String>,
}

/// State of the sound-dismissal chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "state")]
pub enum DetectionStatus {
    /// Not firing, nothing to listen for.
    Inactive,
    /// Ringing; the input is still being opened.
    Starting,
    /// Capture and classification running.
    Listening,
    /// The alarm is ringing but cannot be dismissed by sound.
    Unavailable { reason: String },
}

impl DetectionStatus {
    pub fn is_listening(&self) -> bool {
        matches!(self, Self::Listening)
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// One analysed window's top label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationEvent {
    pub seq: u64,
    pub episode: EpisodeId,
    pub label: String,
    pub confidence: f32,
    /// Whether the result passed the dismissal label/threshold filter.
    pub matched: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_event_serializes_with_camel_case_and_tagged_detection() {
        let event = AlarmStatusEvent {
            seq: 4,
            phase: SchedulerPhase::Fired,
            firing: true,
            detection: DetectionStatus::Unavailable {
                reason: "microphone access was denied".into(),
            },
            trigger_time: Some("08:00".into()),
            detail: None,
        };

        let json = serde_json::to_value(&event).expect("serialize status event");
        assert_eq!(json["seq"], 4);
        assert_eq!(json["phase"], "fired");
        assert_eq!(json["triggerTime"], "08:00");
        assert_eq!(json["detection"]["state"], "unavailable");
        assert_eq!(json["detection"]["reason"], "microphone access was denied");

        let round_trip: AlarmStatusEvent =
            serde_json::from_value(json).expect("deserialize status event");
        assert_eq!(round_trip, event);
    }

    #[test]
    fn unit_detection_states_are_lowercase() {
        let json = serde_json::to_value(DetectionStatus::Listening).expect("serialize");
        assert_eq!(json["state"], "listening");
        assert!(DetectionStatus::Listening.is_listening());
        assert!(!DetectionStatus::Inactive.is_listening());
        let json = serde_json::to_value(DetectionStatus::Starting).expect("serialize");
        assert_eq!(json["state"], "starting");
        assert!(!DetectionStatus::Starting.is_listening());
    }

    #[test]
    fn classification_event_serializes_matched_flag() {
        let event = ClassificationEvent {
            seq: 9,
            episode: 2,
            label: "water".into(),
            confidence: 0.82,
            matched: true,
        };
        let json = serde_json::to_value(&event).expect("serialize classification event");
        assert_eq!(json["episode"], 2);
        assert_eq!(json["matched"], true);
        let conf = json["confidence"].as_f64().expect("number");
        assert!((conf - 0.82).abs() < 1e-5);
    }
}

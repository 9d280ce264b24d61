//! Dismissal detection: turns classifier output into at most one
//! `DismissalEvent` per firing episode.
//!
//! Runs on the classification worker. The detector latches after the first
//! match and stays silent until `reset` is called for the next episode.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::classify::ClassificationResult;

/// Identifies one firing of the alarm. A dismissal carrying an older
/// episode than the one currently firing is ignored.
pub type EpisodeId = u64;

/// "Running water was heard during episode N."
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DismissalEvent {
    pub episode: EpisodeId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DismissalConfig {
    /// Matched case-insensitively.
    pub labels: Vec<String>,
    /// A result must score strictly above this.
    pub threshold: f32,
}

impl Default for DismissalConfig {
    fn default() -> Self {
        Self {
            labels: vec!["water_tap_faucet".into(), "water".into()],
            threshold: 0.75,
        }
    }
}

impl DismissalConfig {
    pub fn matches(&self, result: &ClassificationResult) -> bool {
        result.confidence > self.threshold
            && self
                .labels
                .iter()
                .any(|label| label.eq_ignore_ascii_case(&result.label))
    }
}

#[derive(Debug)]
pub struct DismissalDetector {
    config: DismissalConfig,
    episode: EpisodeId,
    fired: bool,
}

impl DismissalDetector {
    pub fn new(config: DismissalConfig) -> Self {
        Self {
            config,
            episode: 0,
            fired: false,
        }
    }

    pub fn config(&self) -> &DismissalConfig {
        &self.config
    }

    /// Arm for `episode`, clearing the latch.
    pub fn reset(&mut self, episode: EpisodeId) {
        self.episode = episode;
        self.fired = false;
    }

    pub fn has_fired(&self) -> bool {
        self.fired
    }

    /// Whether `result` matches. Returns the event the first time only.
    pub fn observe(&mut self, result: &ClassificationResult) -> Option<DismissalEvent> {
        if self.fired || !self.config.matches(result) {
            return None;
        }
        self.fired = true;
        info!(
            episode = self.episode,
            label = %result.label,
            confidence = result.confidence,
            "dismissal sound detected"
        );
        Some(DismissalEvent {
            episode: self.episode,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(label: &str, confidence: f32) -> ClassificationResult {
        ClassificationResult::new(label, confidence)
    }

    #[test]
    fn confident_water_dismisses() {
        let mut detector = DismissalDetector::new(DismissalConfig::default());
        detector.reset(3);
        assert_eq!(
            detector.observe(&result("water", 0.9)),
            Some(DismissalEvent { episode: 3 })
        );
    }

    #[test]
    fn low_confidence_is_ignored() {
        let mut detector = DismissalDetector::new(DismissalConfig::default());
        assert_eq!(detector.observe(&result("water", 0.5)), None);
        assert!(!detector.has_fired());
    }

    #[test]
    fn threshold_is_strict() {
        let mut detector = DismissalDetector::new(DismissalConfig::default());
        assert_eq!(detector.observe(&result("water", 0.75)), None);
        assert!(detector.observe(&result("water", 0.7501)).is_some());
    }

    #[test]
    fn label_match_ignores_case_and_rejects_others() {
        let mut detector = DismissalDetector::new(DismissalConfig::default());
        assert_eq!(detector.observe(&result("speech", 0.99)), None);
        assert!(detector.observe(&result("Water_Tap_Faucet", 0.8)).is_some());
    }

    #[test]
    fn emits_once_until_reset() {
        let mut detector = DismissalDetector::new(DismissalConfig::default());
        detector.reset(1);
        assert!(detector.observe(&result("water", 0.9)).is_some());
        assert!(detector.observe(&result("water", 0.95)).is_none());
        detector.reset(2);
        assert_eq!(
            detector.observe(&result("water", 0.9)),
            Some(DismissalEvent { episode: 2 })
        );
    }

    #[test]
    fn custom_labels_replace_defaults() {
        let config = DismissalConfig {
            labels: vec!["running_water".into()],
            threshold: 0.8,
        };
        let mut detector = DismissalDetector::new(config);
        assert!(detector.observe(&result("water", 0.99)).is_none());
        assert!(detector.observe(&result("running_water", 0.81)).is_some());
    }
}

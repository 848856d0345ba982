//! Event envelopes: the JSON shapes that trigger the engine.

use anyhow::{Context, Result};
use serde::Deserialize;

/// Detail types the engine reacts to.
const STATE_CHANGE: &str = "EC2 Instance State-change Notification";
const INTERRUPTION_WARNING: &str = "EC2 Spot Instance Interruption Warning";
const REBALANCE_RECOMMENDATION: &str = "EC2 Instance Rebalance Recommendation";

/// Raw event envelope, as delivered by the event bus.
#[derive(Debug, Clone, Deserialize)]
pub struct CloudEvent {
    #[serde(rename = "detail-type", default)]
    pub detail_type: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub detail: EventDetail,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventDetail {
    #[serde(rename = "instance-id")]
    pub instance_id: Option<String>,
    pub state: Option<String>,
}

/// What the engine should do about an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A freshly launched spot instance reports `running`; try to attach.
    SpotRunning { region: String, instance_id: String },
    /// Two-minute reclaim warning.
    InterruptionWarning { region: String, instance_id: String },
    /// Elevated interruption risk, strictly softer than a warning.
    RebalanceRecommendation { region: String, instance_id: String },
    /// Anything else is ignored.
    Ignored,
}

impl CloudEvent {
    pub fn parse(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse event envelope")
    }

    /// Classify the envelope into an engine action.
    pub fn classify(&self) -> EngineEvent {
        let Some(instance_id) = self.detail.instance_id.clone() else {
            return EngineEvent::Ignored;
        };
        let region = self.region.clone();

        match self.detail_type.as_str() {
            STATE_CHANGE if self.detail.state.as_deref() == Some("running") => {
                EngineEvent::SpotRunning {
                    region,
                    instance_id,
                }
            }
            INTERRUPTION_WARNING => EngineEvent::InterruptionWarning {
                region,
                instance_id,
            },
            REBALANCE_RECOMMENDATION => EngineEvent::RebalanceRecommendation {
                region,
                instance_id,
            },
            _ => EngineEvent::Ignored,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_state_change_classifies_as_spot_running() {
        let event = CloudEvent::parse(
            r#"{
                "detail-type": "EC2 Instance State-change Notification",
                "region": "us-east-1",
                "detail": {"instance-id": "i-123", "state": "running"}
            }"#,
        )
        .unwrap();

        assert_eq!(
            event.classify(),
            EngineEvent::SpotRunning {
                region: "us-east-1".to_string(),
                instance_id: "i-123".to_string()
            }
        );
    }

    #[test]
    fn non_running_state_changes_are_ignored() {
        let event = CloudEvent::parse(
            r#"{
                "detail-type": "EC2 Instance State-change Notification",
                "region": "us-east-1",
                "detail": {"instance-id": "i-123", "state": "stopped"}
            }"#,
        )
        .unwrap();
        assert_eq!(event.classify(), EngineEvent::Ignored);
    }

    #[test]
    fn interruption_and_rebalance_classify() {
        let warning = CloudEvent::parse(
            r#"{
                "detail-type": "EC2 Spot Instance Interruption Warning",
                "region": "eu-west-1",
                "detail": {"instance-id": "i-9", "instance-action": "terminate"}
            }"#,
        )
        .unwrap();
        assert_eq!(
            warning.classify(),
            EngineEvent::InterruptionWarning {
                region: "eu-west-1".to_string(),
                instance_id: "i-9".to_string()
            }
        );

        let rebalance = CloudEvent::parse(
            r#"{
                "detail-type": "EC2 Instance Rebalance Recommendation",
                "region": "eu-west-1",
                "detail": {"instance-id": "i-9"}
            }"#,
        )
        .unwrap();
        assert_eq!(
            rebalance.classify(),
            EngineEvent::RebalanceRecommendation {
                region: "eu-west-1".to_string(),
                instance_id: "i-9".to_string()
            }
        );
    }

    #[test]
    fn unknown_detail_types_and_missing_ids_are_ignored() {
        let unknown = CloudEvent::parse(
            r#"{"detail-type": "Scheduled Event", "detail": {"instance-id": "i-1"}}"#,
        )
        .unwrap();
        assert_eq!(unknown.classify(), EngineEvent::Ignored);

        let missing_id = CloudEvent::parse(
            r#"{"detail-type": "EC2 Spot Instance Interruption Warning", "detail": {}}"#,
        )
        .unwrap();
        assert_eq!(missing_id.classify(), EngineEvent::Ignored);
    }
}

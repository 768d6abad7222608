use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Event severity, ordered from least to most severe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Classification of a detected anomaly or zone-rule violation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnomalyKind {
    SpeedViolation,
    LowSignalQuality,
    LowBattery,
    /// Statistical outlier on a named field
    StatisticalAnomaly,
    AccelerationSpike,
    ExcessiveIdle,
    /// Net displacement far below path length: moving in circles or stuck
    CircularMovement,
    ErraticHeading,
    /// Learned-model novelty verdict
    ModelNovelty,
    CollisionRisk,
    UnauthorizedAccess,
    ZoneFull,
}

/// An immutable anomaly event.
///
/// Written once through the sink's event path; acknowledgment and lifecycle
/// belong to the external event store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnomalyEvent {
    /// UUIDv7 identifier (time-ordered)
    pub event_id: String,
    pub kind: AnomalyKind,
    pub severity: Severity,
    pub agv_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zone_id: Option<String>,
    /// Plant-frame position at detection time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<(f64, f64)>,
    pub message: String,
    /// Method-specific detail payload (thresholds, scores, peer ids)
    pub details: Value,
    pub ts: DateTime<Utc>,
}

impl AnomalyEvent {
    pub fn new(
        kind: AnomalyKind,
        severity: Severity,
        agv_id: impl Into<String>,
        message: impl Into<String>,
        details: Value,
    ) -> Self {
        Self {
            event_id: Uuid::now_v7().to_string(),
            kind,
            severity,
            agv_id: agv_id.into(),
            zone_id: None,
            position: None,
            message: message.into(),
            details,
            ts: Utc::now(),
        }
    }

    pub fn with_zone(mut self, zone_id: Option<String>) -> Self {
        self.zone_id = zone_id;
        self
    }

    pub fn with_position(mut self, x: f64, y: f64) -> Self {
        self.position = Some((x, y));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Info < Severity::Warning);
        assert!(Severity::Warning < Severity::Critical);
    }

    #[test]
    fn test_event_serialization_uses_wire_names() {
        let event = AnomalyEvent::new(
            AnomalyKind::SpeedViolation,
            Severity::Warning,
            "agv-1",
            "speed 6.10 m/s exceeds threshold 5.00",
            json!({"value": 6.1, "threshold": 5.0}),
        )
        .with_zone(Some("assembly".to_string()))
        .with_position(10.0, 20.0);

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "SPEED_VIOLATION");
        assert_eq!(value["severity"], "WARNING");
        assert_eq!(value["zone_id"], "assembly");
    }
}

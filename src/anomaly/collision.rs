use super::event::{AnomalyEvent, AnomalyKind, Severity};
use chrono::{DateTime, Utc};
use serde_json::json;

/// Time-to-collision below this is a warning.
const TTC_WARNING_SECS: f64 = 5.0;

/// Time-to-collision below this is critical.
const TTC_CRITICAL_SECS: f64 = 2.0;

/// Latest known kinematic state of one vehicle, for the fleet-wide scan.
#[derive(Clone, Debug)]
pub struct FleetPosition {
    pub agv_id: String,
    pub plant_x: f64,
    pub plant_y: f64,
    /// Missing telemetry defaults to stationary
    pub speed_mps: f64,
    pub heading_deg: f64,
    pub ts: DateTime<Utc>,
}

impl FleetPosition {
    fn velocity(&self) -> (f64, f64) {
        let heading = self.heading_deg.to_radians();
        (self.speed_mps * heading.cos(), self.speed_mps * heading.sin())
    }
}

/// Pairwise collision-risk scan over a fleet snapshot.
///
/// For each pair closer than the distance threshold, time-to-collision is
/// distance over relative speed; under 5 s is a warning, under 2 s critical.
pub fn detect_collision_risk(fleet: &[FleetPosition], distance_threshold: f64) -> Vec<AnomalyEvent> {
    let mut risks = Vec::new();

    for i in 0..fleet.len() {
        for j in (i + 1)..fleet.len() {
            let a = &fleet[i];
            let b = &fleet[j];

            let distance =
                ((a.plant_x - b.plant_x).powi(2) + (a.plant_y - b.plant_y).powi(2)).sqrt();
            if distance >= distance_threshold {
                continue;
            }

            let (avx, avy) = a.velocity();
            let (bvx, bvy) = b.velocity();
            let relative_speed = ((avx - bvx).powi(2) + (avy - bvy).powi(2)).sqrt();
            if relative_speed <= 0.0 {
                continue;
            }

            let ttc = distance / relative_speed;
            if ttc >= TTC_WARNING_SECS {
                continue;
            }

            let severity = if ttc < TTC_CRITICAL_SECS {
                Severity::Critical
            } else {
                Severity::Warning
            };

            risks.push(
                AnomalyEvent::new(
                    AnomalyKind::CollisionRisk,
                    severity,
                    &a.agv_id,
                    format!(
                        "Collision risk between {} and {} ({:.2} m, ttc {:.1}s)",
                        a.agv_id, b.agv_id, distance, ttc
                    ),
                    json!({
                        "agv1": a.agv_id,
                        "agv2": b.agv_id,
                        "distance_m": distance,
                        "time_to_collision_secs": ttc,
                    }),
                )
                .with_position(a.plant_x, a.plant_y),
            );
        }
    }

    risks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(agv_id: &str, x: f64, y: f64, speed: f64, heading: f64) -> FleetPosition {
        FleetPosition {
            agv_id: agv_id.to_string(),
            plant_x: x,
            plant_y: y,
            speed_mps: speed,
            heading_deg: heading,
            ts: Utc::now(),
        }
    }

    #[test]
    fn test_head_on_pair_is_critical() {
        // 1 m apart, approaching at 2 m/s relative → ttc 0.5 s
        let fleet = vec![at("a", 0.0, 0.0, 1.0, 0.0), at("b", 1.0, 0.0, 1.0, 180.0)];
        let risks = detect_collision_risk(&fleet, 2.0);
        assert_eq!(risks.len(), 1);
        assert_eq!(risks[0].severity, Severity::Critical);
        assert_eq!(risks[0].details["agv1"], "a");
        assert_eq!(risks[0].details["agv2"], "b");
    }

    #[test]
    fn test_slow_approach_is_warning() {
        // 1 m apart, 0.3 m/s relative closing speed → ttc ≈ 3.3 s
        let fleet = vec![
            at("a", 0.0, 0.0, 0.15, 0.0),
            at("b", 1.0, 0.0, 0.15, 180.0),
        ];
        let risks = detect_collision_risk(&fleet, 2.0);
        assert_eq!(risks.len(), 1);
        assert_eq!(risks[0].severity, Severity::Warning);
    }

    #[test]
    fn test_distant_pair_ignored() {
        let fleet = vec![at("a", 0.0, 0.0, 1.0, 0.0), at("b", 50.0, 0.0, 1.0, 180.0)];
        assert!(detect_collision_risk(&fleet, 2.0).is_empty());
    }

    #[test]
    fn test_both_stationary_ignored() {
        let fleet = vec![at("a", 0.0, 0.0, 0.0, 0.0), at("b", 1.0, 0.0, 0.0, 180.0)];
        assert!(detect_collision_risk(&fleet, 2.0).is_empty());
    }

    #[test]
    fn test_three_vehicles_only_close_pair_flagged() {
        let fleet = vec![
            at("a", 0.0, 0.0, 1.0, 0.0),
            at("b", 1.0, 0.0, 1.0, 180.0),
            at("c", 30.0, 30.0, 1.0, 90.0),
        ];
        let risks = detect_collision_risk(&fleet, 2.0);
        assert_eq!(risks.len(), 1);
        assert_eq!(risks[0].details["agv1"], "a");
    }
}

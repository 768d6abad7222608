use super::{Zone, ZoneType};
use crate::anomaly::Severity;
use crate::sink::{EntityRegistry, EntityStatus};
use chrono::{DateTime, Utc};
use dashmap::DashMap;

/// Window for "live" occupancy: entities seen in a zone within this many
/// seconds count toward its capacity.
pub const OCCUPANCY_WINDOW_SECS: i64 = 10;

/// A zone-rule violation for one sighting.
#[derive(Clone, Debug, PartialEq)]
pub struct Violation {
    pub kind: ViolationKind,
    pub severity: Severity,
    pub zone_id: String,
    pub agv_id: String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ViolationKind {
    Speed { current: f64, limit: f64 },
    UnauthorizedAccess,
    ZoneFull { occupancy: usize, capacity: usize },
}

/// Tracks which zone each entity was last seen in, for live occupancy counts.
pub struct OccupancyTracker {
    last_seen: DashMap<String, (String, DateTime<Utc>)>,
}

impl OccupancyTracker {
    pub fn new() -> Self {
        Self {
            last_seen: DashMap::new(),
        }
    }

    /// Record a sighting of an entity inside a zone.
    pub fn record(&self, agv_id: &str, zone_id: &str, ts: DateTime<Utc>) {
        self.last_seen
            .insert(agv_id.to_string(), (zone_id.to_string(), ts));
    }

    /// Count entities seen in the zone within the occupancy window.
    pub fn occupancy(&self, zone_id: &str, now: DateTime<Utc>) -> usize {
        self.last_seen
            .iter()
            .filter(|entry| {
                let (zone, ts) = entry.value();
                zone == zone_id && (now - *ts).num_seconds() <= OCCUPANCY_WINDOW_SECS
            })
            .count()
    }
}

impl Default for OccupancyTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Evaluate the zone's rules for one sighting.
///
/// Authorization for restricted and maintenance zones is delegated to the
/// registry: only status MAINTENANCE (service vehicles) is admitted.
pub(super) fn check(
    zone: &Zone,
    agv_id: &str,
    speed: Option<f64>,
    registry: &dyn EntityRegistry,
    occupancy: &OccupancyTracker,
    now: DateTime<Utc>,
) -> Vec<Violation> {
    let mut violations = Vec::new();

    if let (Some(current), Some(limit)) = (speed, zone.max_speed_mps) {
        if current > limit {
            violations.push(Violation {
                kind: ViolationKind::Speed { current, limit },
                severity: Severity::Warning,
                zone_id: zone.zone_id.clone(),
                agv_id: agv_id.to_string(),
            });
        }
    }

    if matches!(zone.zone_type, ZoneType::Restricted | ZoneType::Maintenance)
        && registry.status_of(agv_id) != EntityStatus::Maintenance
    {
        violations.push(Violation {
            kind: ViolationKind::UnauthorizedAccess,
            severity: Severity::Critical,
            zone_id: zone.zone_id.clone(),
            agv_id: agv_id.to_string(),
        });
    }

    let current_occupancy = occupancy.occupancy(&zone.zone_id, now);
    if current_occupancy >= zone.max_agvs {
        violations.push(Violation {
            kind: ViolationKind::ZoneFull {
                occupancy: current_occupancy,
                capacity: zone.max_agvs,
            },
            severity: Severity::Warning,
            zone_id: zone.zone_id.clone(),
            agv_id: agv_id.to_string(),
        });
    }

    violations
}

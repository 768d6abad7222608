use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::info;

mod geometry;
mod rules;

pub use geometry::{centroid, point_in_polygon, polygons_touch};
pub use rules::{OccupancyTracker, Violation, ViolationKind, OCCUPANCY_WINDOW_SECS};

/// Zone definition source configuration
#[derive(Clone, Debug, Deserialize)]
pub struct ZonesConfig {
    /// JSON file refreshed periodically from the external definition store
    #[serde(default = "default_definitions_path")]
    pub definitions_path: String,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
}

fn default_definitions_path() -> String {
    "config/zones.json".to_string()
}

fn default_refresh_interval() -> u64 {
    300
}

impl Default for ZonesConfig {
    fn default() -> Self {
        Self {
            definitions_path: default_definitions_path(),
            refresh_interval_secs: default_refresh_interval(),
        }
    }
}

/// Operational classification of a zone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ZoneType {
    Operational,
    Restricted,
    Maintenance,
    Charging,
    Transit,
}

fn default_zone_type() -> ZoneType {
    ZoneType::Operational
}

fn default_max_speed() -> Option<f64> {
    Some(2.0)
}

fn default_max_agvs() -> usize {
    5
}

fn default_priority() -> i32 {
    5
}

fn default_active() -> bool {
    true
}

/// A named polygonal region of the plant with operational rules.
///
/// The vertex ring is open (no repeated closing vertex) and must be simple;
/// the index does not validate this.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Zone {
    pub zone_id: String,
    pub name: String,
    #[serde(default)]
    pub category: String,
    #[serde(default = "default_zone_type")]
    pub zone_type: ZoneType,
    #[serde(default = "default_max_speed")]
    pub max_speed_mps: Option<f64>,
    #[serde(default = "default_max_agvs")]
    pub max_agvs: usize,
    #[serde(default = "default_priority")]
    pub priority: i32,
    pub vertices: Vec<[f64; 2]>,
    /// Soft-delete flag; inactive zones are invisible to lookups
    #[serde(default = "default_active")]
    pub active: bool,
}

/// Immutable snapshot of the active zone set.
///
/// Zones keep their definition order: containment is a linear first-match
/// scan, and the tie-break for overlapping zones is deliberately left as
/// "first match, undefined order".
struct ZoneSet {
    zones: Vec<Zone>,
    by_id: HashMap<String, usize>,
}

impl ZoneSet {
    fn build(zones: Vec<Zone>) -> Self {
        let active: Vec<Zone> = zones.into_iter().filter(|z| z.active).collect();
        let by_id = active
            .iter()
            .enumerate()
            .map(|(i, z)| (z.zone_id.clone(), i))
            .collect();
        Self { zones: active, by_id }
    }

    fn get(&self, zone_id: &str) -> Option<&Zone> {
        self.by_id.get(zone_id).map(|&i| &self.zones[i])
    }
}

/// Holds the active zone polygons and their rule attributes.
///
/// Mutations rebuild the whole snapshot and swap it in; in-flight readers
/// keep a consistent view and the next lookup observes the new state.
pub struct ZoneIndex {
    inner: RwLock<Arc<ZoneSet>>,
}

impl ZoneIndex {
    pub fn new(zones: Vec<Zone>) -> Self {
        Self {
            inner: RwLock::new(Arc::new(ZoneSet::build(zones))),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Load zone definitions from a JSON file (array of Zone records).
    pub fn load_file(path: &Path) -> Result<Vec<Zone>> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read zone file {}", path.display()))?;
        let zones: Vec<Zone> = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse zone file {}", path.display()))?;
        Ok(zones)
    }

    /// Replace the whole zone set (periodic refresh from the definition store).
    pub fn reload(&self, zones: Vec<Zone>) {
        let set = Arc::new(ZoneSet::build(zones));
        let count = set.zones.len();
        *self.inner.write().unwrap() = set;
        info!(zones = count, "Zone index reloaded");
    }

    fn snapshot(&self) -> Arc<ZoneSet> {
        self.inner.read().unwrap().clone()
    }

    /// Zone containing the point, if any. First match in definition order wins.
    pub fn containing(&self, x: f64, y: f64) -> Option<String> {
        let set = self.snapshot();
        set.zones
            .iter()
            .find(|z| point_in_polygon(x, y, &z.vertices))
            .map(|z| z.zone_id.clone())
    }

    /// Rule attributes for a zone.
    pub fn rules_for(&self, zone_id: &str) -> Option<Zone> {
        self.snapshot().get(zone_id).cloned()
    }

    /// Zones whose boundaries touch the given zone.
    pub fn adjacent_to(&self, zone_id: &str) -> HashSet<String> {
        let set = self.snapshot();
        let Some(zone) = set.get(zone_id) else {
            return HashSet::new();
        };
        set.zones
            .iter()
            .filter(|other| other.zone_id != zone_id)
            .filter(|other| polygons_touch(&zone.vertices, &other.vertices))
            .map(|other| other.zone_id.clone())
            .collect()
    }

    /// Distance between two zone centroids, if both zones exist.
    pub fn centroid_distance(&self, a: &str, b: &str) -> Option<f64> {
        let set = self.snapshot();
        let (ax, ay) = centroid(&set.get(a)?.vertices)?;
        let (bx, by) = centroid(&set.get(b)?.vertices)?;
        Some(((ax - bx).powi(2) + (ay - by).powi(2)).sqrt())
    }

    /// Shortest zone sequence from start to end over the adjacency relation
    /// (breadth-first). Empty when no path exists.
    pub fn path_between(&self, start: &str, end: &str) -> Vec<String> {
        if start == end {
            return vec![start.to_string()];
        }

        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<Vec<String>> = VecDeque::new();
        queue.push_back(vec![start.to_string()]);

        while let Some(path) = queue.pop_front() {
            let current = path.last().unwrap().clone();
            if current == end {
                return path;
            }
            if !visited.insert(current.clone()) {
                continue;
            }
            for adjacent in self.adjacent_to(&current) {
                if !visited.contains(&adjacent) {
                    let mut next = path.clone();
                    next.push(adjacent);
                    queue.push_back(next);
                }
            }
        }

        Vec::new()
    }

    /// Evaluate zone rules for a sighting. See `rules` module.
    pub fn check_violations(
        &self,
        agv_id: &str,
        zone_id: &str,
        speed: Option<f64>,
        registry: &dyn crate::sink::EntityRegistry,
        occupancy: &OccupancyTracker,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Vec<Violation> {
        let set = self.snapshot();
        match set.get(zone_id) {
            Some(zone) => rules::check(zone, agv_id, speed, registry, occupancy, now),
            None => Vec::new(),
        }
    }

    /// Register a new zone. Fails if the id already exists.
    pub fn create(&self, zone: Zone) -> bool {
        let mut guard = self.inner.write().unwrap();
        if guard.by_id.contains_key(&zone.zone_id) {
            return false;
        }
        let mut zones = guard.zones.clone();
        let zone_id = zone.zone_id.clone();
        zones.push(zone);
        *guard = Arc::new(ZoneSet::build(zones));
        info!(zone_id = %zone_id, "Zone created");
        true
    }

    /// Replace an existing zone's definition.
    pub fn update(&self, zone: Zone) -> bool {
        let mut guard = self.inner.write().unwrap();
        let Some(&idx) = guard.by_id.get(&zone.zone_id) else {
            return false;
        };
        let mut zones = guard.zones.clone();
        let zone_id = zone.zone_id.clone();
        zones[idx] = zone;
        *guard = Arc::new(ZoneSet::build(zones));
        info!(zone_id = %zone_id, "Zone updated");
        true
    }

    /// Soft-delete a zone; the next lookup no longer sees it.
    pub fn soft_delete(&self, zone_id: &str) -> bool {
        let mut guard = self.inner.write().unwrap();
        if !guard.by_id.contains_key(zone_id) {
            return false;
        }
        let zones: Vec<Zone> = guard
            .zones
            .iter()
            .filter(|z| z.zone_id != zone_id)
            .cloned()
            .collect();
        *guard = Arc::new(ZoneSet::build(zones));
        info!(zone_id = %zone_id, "Zone deleted");
        true
    }

    pub fn len(&self) -> usize {
        self.snapshot().zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn square_zone(zone_id: &str, x0: f64, y0: f64, size: f64) -> Zone {
        Zone {
            zone_id: zone_id.to_string(),
            name: zone_id.to_string(),
            category: "production".to_string(),
            zone_type: ZoneType::Operational,
            max_speed_mps: Some(2.0),
            max_agvs: 5,
            priority: 5,
            vertices: vec![
                [x0, y0],
                [x0 + size, y0],
                [x0 + size, y0 + size],
                [x0, y0 + size],
            ],
            active: true,
        }
    }

    #[test]
    fn test_containing_inside_and_outside() {
        let index = ZoneIndex::new(vec![square_zone("assembly", 0.0, 0.0, 10.0)]);
        assert_eq!(index.containing(5.0, 5.0), Some("assembly".to_string()));
        assert_eq!(index.containing(15.0, 15.0), None);
    }

    #[test]
    fn test_overlap_first_match_wins() {
        let index = ZoneIndex::new(vec![
            square_zone("first", 0.0, 0.0, 10.0),
            square_zone("second", 5.0, 5.0, 10.0),
        ]);
        // (7, 7) lies in both; definition order decides
        assert_eq!(index.containing(7.0, 7.0), Some("first".to_string()));
    }

    #[test]
    fn test_inactive_zone_invisible() {
        let mut zone = square_zone("assembly", 0.0, 0.0, 10.0);
        zone.active = false;
        let index = ZoneIndex::new(vec![zone]);
        assert_eq!(index.containing(5.0, 5.0), None);
        assert!(index.is_empty());
    }

    #[test]
    fn test_adjacency() {
        let index = ZoneIndex::new(vec![
            square_zone("a", 0.0, 0.0, 10.0),
            square_zone("b", 10.0, 0.0, 10.0),
            square_zone("c", 50.0, 50.0, 10.0),
        ]);
        let adjacent = index.adjacent_to("a");
        assert!(adjacent.contains("b"));
        assert!(!adjacent.contains("c"));
    }

    #[test]
    fn test_path_between_chained_zones() {
        let index = ZoneIndex::new(vec![
            square_zone("a", 0.0, 0.0, 10.0),
            square_zone("b", 10.0, 0.0, 10.0),
            square_zone("c", 20.0, 0.0, 10.0),
        ]);
        assert_eq!(index.path_between("a", "c"), vec!["a", "b", "c"]);
        assert_eq!(index.path_between("a", "a"), vec!["a"]);
    }

    #[test]
    fn test_path_between_disconnected_is_empty() {
        let index = ZoneIndex::new(vec![
            square_zone("a", 0.0, 0.0, 10.0),
            square_zone("c", 50.0, 50.0, 10.0),
        ]);
        assert!(index.path_between("a", "c").is_empty());
    }

    #[test]
    fn test_centroid_distance() {
        let index = ZoneIndex::new(vec![
            square_zone("a", 0.0, 0.0, 10.0),
            square_zone("b", 30.0, 0.0, 10.0),
        ]);
        let d = index.centroid_distance("a", "b").unwrap();
        assert!((d - 30.0).abs() < 1e-9);
        assert!(index.centroid_distance("a", "missing").is_none());
    }

    #[test]
    fn test_mutations_visible_to_next_lookup() {
        let index = ZoneIndex::empty();

        assert!(index.create(square_zone("assembly", 0.0, 0.0, 10.0)));
        assert_eq!(index.containing(5.0, 5.0), Some("assembly".to_string()));

        // Duplicate create rejected
        assert!(!index.create(square_zone("assembly", 0.0, 0.0, 10.0)));

        // Update shrinks the polygon; the old extent no longer matches
        let mut smaller = square_zone("assembly", 0.0, 0.0, 4.0);
        smaller.max_speed_mps = Some(1.0);
        assert!(index.update(smaller));
        assert_eq!(index.containing(5.0, 5.0), None);
        assert_eq!(index.containing(2.0, 2.0), Some("assembly".to_string()));
        assert_eq!(index.rules_for("assembly").unwrap().max_speed_mps, Some(1.0));

        assert!(index.soft_delete("assembly"));
        assert_eq!(index.containing(2.0, 2.0), None);
        assert!(!index.soft_delete("assembly"));
    }

    #[test]
    fn test_load_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zones.json");
        std::fs::write(
            &path,
            r#"[
                {
                    "zone_id": "charging-1",
                    "name": "Charging Bay 1",
                    "zone_type": "CHARGING",
                    "max_speed_mps": 0.5,
                    "max_agvs": 2,
                    "vertices": [[0, 0], [5, 0], [5, 5], [0, 5]]
                }
            ]"#,
        )
        .unwrap();

        let zones = ZoneIndex::load_file(&path).unwrap();
        assert_eq!(zones.len(), 1);
        assert_eq!(zones[0].zone_type, ZoneType::Charging);
        assert!(zones[0].active);
        assert_eq!(zones[0].priority, 5);
    }
}

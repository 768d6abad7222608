use crate::reading::EnrichedReading;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::debug;

mod collision;
mod detectors;
mod event;
mod model;

pub use collision::{detect_collision_risk, FleetPosition};
pub use event::{AnomalyEvent, AnomalyKind, Severity};
pub use model::{features, NoveltyModel, TrainingError, NOVELTY_THRESHOLD};

use detectors::{MIN_PATTERN_HISTORY, MIN_STATISTICAL_HISTORY};
use model::MIN_TRAINING_ROWS;

/// Fleet positions older than this are excluded from the collision scan.
const FLEET_SNAPSHOT_WINDOW_SECS: i64 = 10;

/// Anomaly detection configuration
#[derive(Clone, Debug, Deserialize)]
pub struct AnomalyConfig {
    /// Behavioral speed ceiling, distinct from the validator's hard-reject limit
    #[serde(default = "default_speed_threshold")]
    pub speed_threshold_mps: f64,
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f64,
    #[serde(default = "default_battery_threshold")]
    pub battery_threshold_percent: f64,
    #[serde(default = "default_acceleration_threshold")]
    pub acceleration_threshold_mps2: f64,
    #[serde(default = "default_idle_threshold")]
    pub idle_threshold_secs: f64,
    #[serde(default = "default_collision_distance")]
    pub collision_distance_m: f64,
    /// Telemetry sample rate, used to convert sample counts to wall time
    #[serde(default = "default_sample_rate")]
    pub sample_rate_hz: f64,
    /// Ring-buffer capacity per entity
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    /// New samples required before a model is refit
    #[serde(default = "default_retrain_interval")]
    pub retrain_interval_samples: usize,
    /// Per-detector enable flags
    #[serde(default = "default_true")]
    pub threshold_enabled: bool,
    #[serde(default = "default_true")]
    pub statistical_enabled: bool,
    #[serde(default = "default_true")]
    pub model_enabled: bool,
    #[serde(default = "default_true")]
    pub pattern_enabled: bool,
    #[serde(default = "default_true")]
    pub collision_enabled: bool,
}

fn default_speed_threshold() -> f64 {
    5.0
}

fn default_quality_threshold() -> f64 {
    0.3
}

fn default_battery_threshold() -> f64 {
    15.0
}

fn default_acceleration_threshold() -> f64 {
    3.0
}

fn default_idle_threshold() -> f64 {
    300.0
}

fn default_collision_distance() -> f64 {
    2.0
}

fn default_sample_rate() -> f64 {
    3.0
}

fn default_history_window() -> usize {
    100
}

fn default_retrain_interval() -> usize {
    50
}

fn default_true() -> bool {
    true
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            speed_threshold_mps: default_speed_threshold(),
            quality_threshold: default_quality_threshold(),
            battery_threshold_percent: default_battery_threshold(),
            acceleration_threshold_mps2: default_acceleration_threshold(),
            idle_threshold_secs: default_idle_threshold(),
            collision_distance_m: default_collision_distance(),
            sample_rate_hz: default_sample_rate(),
            history_window: default_history_window(),
            retrain_interval_samples: default_retrain_interval(),
            threshold_enabled: true,
            statistical_enabled: true,
            model_enabled: true,
            pattern_enabled: true,
            collision_enabled: true,
        }
    }
}

/// Detection eligibility of an entity, driven purely by accumulated history.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntityPhase {
    /// Never sighted
    Unseen,
    /// Sighted, but below the largest per-method history minimum
    Warming,
    /// Eligible for every detection method
    Active,
}

/// Per-entity detection state: ring-buffer history plus the trained model.
struct EntityTrack {
    history: VecDeque<EnrichedReading>,
    model: Option<NoveltyModel>,
    samples_since_train: usize,
}

impl EntityTrack {
    fn new(capacity: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(capacity),
            model: None,
            samples_since_train: 0,
        }
    }

    fn push(&mut self, reading: EnrichedReading, capacity: usize) {
        if self.history.len() >= capacity {
            self.history.pop_front();
        }
        self.history.push_back(reading);
        self.samples_since_train += 1;
    }

    /// Refit the novelty model, replacing it atomically under the track lock.
    /// A failed fit keeps whatever model was there before.
    ///
    /// Training excludes the newest sample: the model scores the present
    /// against the past, so the observation under test must not shape the
    /// distribution it is scored against.
    fn refit(&mut self, agv_id: &str) {
        let prior = self.history.len().saturating_sub(1);
        let rows: Vec<_> = self.history.iter().take(prior).map(model::features).collect();
        match NoveltyModel::fit(&rows) {
            Ok(fitted) => {
                debug!(agv_id = %agv_id, rows = fitted.trained_on(), "Novelty model trained");
                self.model = Some(fitted);
                self.samples_since_train = 0;
            }
            Err(e) => {
                debug!(agv_id = %agv_id, error = %e, "Novelty model training skipped");
            }
        }
    }
}

/// Multi-method anomaly detector over an unbounded entity stream.
///
/// Owns all per-entity state: histories are created lazily on first sighting
/// and bounded by eviction, never explicitly destroyed. History mutation is
/// serialized per entity; distinct entities are checked in parallel.
pub struct AnomalyEngine {
    config: AnomalyConfig,
    tracks: DashMap<String, Mutex<EntityTrack>>,
    /// Latest kinematic state per entity, for the cross-entity scan
    fleet: DashMap<String, FleetPosition>,
}

impl AnomalyEngine {
    pub fn new(config: AnomalyConfig) -> Self {
        Self {
            config,
            tracks: DashMap::new(),
            fleet: DashMap::new(),
        }
    }

    /// Run the per-entity detection methods on one enriched reading.
    ///
    /// Methods run in a fixed order (threshold, statistical, learned-model,
    /// pattern) and their results are concatenated; one reading can carry
    /// several anomalies at once.
    pub fn check(&self, reading: &EnrichedReading) -> Vec<AnomalyEvent> {
        if !self.tracks.contains_key(&reading.agv_id) {
            self.tracks
                .entry(reading.agv_id.clone())
                .or_insert_with(|| Mutex::new(EntityTrack::new(self.config.history_window)));
        }
        let track_ref = self.tracks.get(&reading.agv_id).unwrap();
        let mut track = track_ref.lock().unwrap();

        track.push(reading.clone(), self.config.history_window);

        let mut events = Vec::new();

        if self.config.threshold_enabled {
            events.extend(detectors::threshold(reading, &self.config));
        }

        if self.config.statistical_enabled && track.history.len() >= MIN_STATISTICAL_HISTORY {
            events.extend(detectors::statistical(reading, &track.history, &self.config));
        }

        if self.config.model_enabled && track.history.len() >= MIN_TRAINING_ROWS {
            if track.model.is_none()
                || track.samples_since_train >= self.config.retrain_interval_samples
            {
                track.refit(&reading.agv_id);
            }
            if let Some(model) = &track.model {
                let v = model::features(reading);
                if model.is_novel(&v) {
                    let score = model.score(&v);
                    events.push(
                        AnomalyEvent::new(
                            AnomalyKind::ModelNovelty,
                            Severity::Info,
                            &reading.agv_id,
                            format!("Novelty model flagged unusual pattern (score: {:.3})", score),
                            serde_json::json!({"score": score}),
                        )
                        .with_zone(reading.zone_id.clone())
                        .with_position(reading.plant_x, reading.plant_y),
                    );
                }
            }
        }

        if self.config.pattern_enabled && track.history.len() >= MIN_PATTERN_HISTORY {
            events.extend(detectors::pattern(reading, &track.history, &self.config));
        }

        drop(track);

        self.fleet.insert(
            reading.agv_id.clone(),
            FleetPosition {
                agv_id: reading.agv_id.clone(),
                plant_x: reading.plant_x,
                plant_y: reading.plant_y,
                speed_mps: reading.speed_mps.unwrap_or(0.0),
                heading_deg: reading.heading_deg.unwrap_or(0.0),
                ts: reading.ts,
            },
        );

        events
    }

    /// Detection eligibility of an entity.
    pub fn phase(&self, agv_id: &str) -> EntityPhase {
        match self.tracks.get(agv_id) {
            None => EntityPhase::Unseen,
            Some(track) => {
                if track.lock().unwrap().history.len() >= MIN_PATTERN_HISTORY {
                    EntityPhase::Active
                } else {
                    EntityPhase::Warming
                }
            }
        }
    }

    /// Latest positions of entities sighted within the snapshot window.
    pub fn fleet_snapshot(&self, now: DateTime<Utc>) -> Vec<FleetPosition> {
        self.fleet
            .iter()
            .filter(|entry| (now - entry.value().ts).num_seconds() <= FLEET_SNAPSHOT_WINDOW_SECS)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Cross-entity collision-risk scan over the current fleet snapshot.
    pub fn scan_collisions(&self, now: DateTime<Utc>) -> Vec<AnomalyEvent> {
        if !self.config.collision_enabled {
            return Vec::new();
        }
        let snapshot = self.fleet_snapshot(now);
        detect_collision_risk(&snapshot, self.config.collision_distance_m)
    }

    /// Refit models for entities that accrued enough new history.
    /// Returns the number of models retrained.
    pub fn retrain_stale_models(&self) -> usize {
        let mut retrained = 0;
        for entry in self.tracks.iter() {
            let mut track = entry.value().lock().unwrap();
            if track.history.len() > MIN_TRAINING_ROWS
                && track.samples_since_train >= self.config.retrain_interval_samples
            {
                track.refit(entry.key());
                if track.samples_since_train == 0 {
                    retrained += 1;
                }
            }
        }
        retrained
    }

    pub fn tracked_entities(&self) -> usize {
        self.tracks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(agv_id: &str, speed: f64, heading: f64, x: f64, y: f64) -> EnrichedReading {
        EnrichedReading {
            agv_id: agv_id.to_string(),
            ts: Utc::now(),
            lat: None,
            lon: None,
            plant_x: x,
            plant_y: y,
            zone_id: None,
            heading_deg: Some(heading),
            speed_mps: Some(speed),
            quality: Some(0.9),
            battery_percent: Some(80.0),
            status: "ACTIVE".to_string(),
        }
    }

    #[test]
    fn test_phase_progression() {
        let engine = AnomalyEngine::new(AnomalyConfig::default());
        assert_eq!(engine.phase("a"), EntityPhase::Unseen);

        engine.check(&reading("a", 1.0, 90.0, 0.0, 0.0));
        assert_eq!(engine.phase("a"), EntityPhase::Warming);

        for i in 1..MIN_PATTERN_HISTORY {
            engine.check(&reading("a", 1.0, 90.0, i as f64, 0.0));
        }
        assert_eq!(engine.phase("a"), EntityPhase::Active);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut config = AnomalyConfig::default();
        config.history_window = 10;
        let engine = AnomalyEngine::new(config);
        for i in 0..50 {
            engine.check(&reading("a", 1.0, 90.0, i as f64, 0.0));
        }
        let track = engine.tracks.get("a").unwrap();
        assert_eq!(track.lock().unwrap().history.len(), 10);
    }

    #[test]
    fn test_determinism_single_speed_violation() {
        // 30 identical-speed, identical-heading readings followed by one
        // reading over the behavioral speed ceiling must yield exactly one
        // SPEED_VIOLATION warning with no other method firing
        let engine = AnomalyEngine::new(AnomalyConfig::default());
        for _ in 0..30 {
            engine.check(&reading("a", 7.5, 90.0, 10.0, 10.0));
        }

        let events = engine.check(&reading("a", 8.0, 90.0, 10.0, 10.0));
        assert_eq!(events.len(), 1, "unexpected events: {:?}", events);
        assert_eq!(events[0].kind, AnomalyKind::SpeedViolation);
        assert_eq!(events[0].severity, Severity::Warning);
    }

    #[test]
    fn test_detectors_can_be_disabled() {
        let config = AnomalyConfig {
            threshold_enabled: false,
            ..AnomalyConfig::default()
        };
        let engine = AnomalyEngine::new(config);
        let events = engine.check(&reading("a", 9.0, 90.0, 0.0, 0.0));
        assert!(events.iter().all(|e| e.kind != AnomalyKind::SpeedViolation));
    }

    #[test]
    fn test_fleet_snapshot_window() {
        let engine = AnomalyEngine::new(AnomalyConfig::default());
        let now = Utc::now();

        let mut fresh = reading("a", 1.0, 0.0, 0.0, 0.0);
        fresh.ts = now;
        engine.check(&fresh);

        let mut stale = reading("b", 1.0, 180.0, 1.0, 0.0);
        stale.ts = now - chrono::Duration::seconds(60);
        engine.check(&stale);

        let snapshot = engine.fleet_snapshot(now);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].agv_id, "a");
    }

    #[test]
    fn test_scan_collisions_head_on() {
        let engine = AnomalyEngine::new(AnomalyConfig::default());
        let now = Utc::now();

        let mut a = reading("a", 1.0, 0.0, 0.0, 0.0);
        a.ts = now;
        engine.check(&a);
        let mut b = reading("b", 1.0, 180.0, 1.0, 0.0);
        b.ts = now;
        engine.check(&b);

        let risks = engine.scan_collisions(now);
        assert_eq!(risks.len(), 1);
        assert_eq!(risks[0].kind, AnomalyKind::CollisionRisk);
        assert_eq!(risks[0].severity, Severity::Critical);
    }

    #[test]
    fn test_collision_scan_disabled() {
        let config = AnomalyConfig {
            collision_enabled: false,
            ..AnomalyConfig::default()
        };
        let engine = AnomalyEngine::new(config);
        let now = Utc::now();
        let mut a = reading("a", 1.0, 0.0, 0.0, 0.0);
        a.ts = now;
        engine.check(&a);
        let mut b = reading("b", 1.0, 180.0, 1.0, 0.0);
        b.ts = now;
        engine.check(&b);
        assert!(engine.scan_collisions(now).is_empty());
    }

    #[test]
    fn test_lazy_model_training_and_novelty() {
        let mut config = AnomalyConfig::default();
        // Keep statistical/pattern out of the way for a focused assertion
        config.statistical_enabled = false;
        config.pattern_enabled = false;
        let engine = AnomalyEngine::new(config);

        // Varied-but-normal warmup so the fit is not degenerate
        for i in 0..40 {
            let wobble = ((i % 5) as f64 - 2.0) * 0.05;
            engine.check(&reading("a", 1.0 + wobble, 90.0, 10.0 + wobble, 10.0 - wobble));
        }

        // A wildly different observation scores as novel
        let events = engine.check(&reading("a", 9.5, 90.0, 150.0, 120.0));
        assert!(
            events.iter().any(|e| e.kind == AnomalyKind::ModelNovelty),
            "expected novelty event, got {:?}",
            events
        );
    }

    #[test]
    fn test_retrain_stale_models() {
        let mut config = AnomalyConfig::default();
        config.retrain_interval_samples = 10;
        config.model_enabled = false; // no lazy refit during checks
        let engine = AnomalyEngine::new(config);

        for i in 0..25 {
            let wobble = ((i % 5) as f64 - 2.0) * 0.05;
            engine.check(&reading("a", 1.0 + wobble, 90.0, f64::from(i), 0.0));
        }

        assert_eq!(engine.retrain_stale_models(), 1);
        // Immediately after a retrain nothing is stale
        assert_eq!(engine.retrain_stale_models(), 0);
    }
}

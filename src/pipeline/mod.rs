use crate::anomaly::{AnomalyEngine, AnomalyEvent, AnomalyKind};
use crate::buffer::{IngestBuffer, RetryItem};
use crate::config::IngestConfig;
use crate::reading::{EnrichedReading, RawReading, Validator};
use crate::sink::{EntityRegistry, PersistenceSink};
use crate::transform::Transformer;
use crate::transport::entity_from_subject;
use crate::zone::{OccupancyTracker, Violation, ViolationKind, ZoneIndex};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Background task cadences
#[derive(Clone, Debug, Deserialize)]
pub struct TasksConfig {
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
    #[serde(default = "default_retrain_interval")]
    pub retrain_interval_secs: u64,
    #[serde(default = "default_collision_interval")]
    pub collision_scan_interval_secs: u64,
}

fn default_stats_interval() -> u64 {
    60
}

fn default_retrain_interval() -> u64 {
    60
}

fn default_collision_interval() -> u64 {
    2
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            stats_interval_secs: default_stats_interval(),
            retrain_interval_secs: default_retrain_interval(),
            collision_scan_interval_secs: default_collision_interval(),
        }
    }
}

/// Pipeline counters, the operator's only failure surface besides logs.
#[derive(Debug)]
pub struct PipelineStats {
    received: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    started_at: DateTime<Utc>,
}

impl PipelineStats {
    fn new() -> Self {
        Self {
            received: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            started_at: Utc::now(),
        }
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Messages per second since startup.
    pub fn rate(&self, now: DateTime<Utc>) -> f64 {
        let uptime = (now - self.started_at).num_milliseconds() as f64 / 1000.0;
        if uptime > 0.0 {
            self.received() as f64 / uptime
        } else {
            0.0
        }
    }
}

/// The ingest pipeline: validate → transform → detect → buffer.
///
/// `handle_message` runs synchronously within the delivery callback's
/// execution context; per-entity ordering from the transport layer is
/// preserved through to the buffer. All slow I/O (batch writes, event
/// writes) happens on flush paths or fire-and-forget tasks.
pub struct Pipeline {
    pub validator: Validator,
    pub transformer: Transformer,
    pub zones: Arc<ZoneIndex>,
    pub engine: AnomalyEngine,
    pub buffer: IngestBuffer,
    pub occupancy: OccupancyTracker,
    registry: Arc<dyn EntityRegistry>,
    sink: Arc<dyn PersistenceSink>,
    pub stats: PipelineStats,
}

impl Pipeline {
    pub fn new(
        transformer: Transformer,
        zones: Arc<ZoneIndex>,
        engine: AnomalyEngine,
        buffer: IngestBuffer,
        registry: Arc<dyn EntityRegistry>,
        sink: Arc<dyn PersistenceSink>,
    ) -> Self {
        Self {
            validator: Validator::new(),
            transformer,
            zones,
            engine,
            buffer,
            occupancy: OccupancyTracker::new(),
            registry,
            sink,
            stats: PipelineStats::new(),
        }
    }

    /// Process one raw transport message end to end.
    ///
    /// Never blocks on persistence: the reading lands in the buffer and the
    /// occupancy-triggered flush is the only write this path can await.
    pub async fn handle_message(&self, subject: &str, payload: &[u8]) {
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        let raw: RawReading = match serde_json::from_slice(payload) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, subject = %subject, "Malformed message payload, skipping");
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let now = Utc::now();
        let validated = match self.validator.validate(raw, entity_from_subject(subject), now) {
            Ok(validated) => validated,
            Err(reason) => {
                debug!(reason = %reason, subject = %subject, "Reading rejected");
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let (plant_x, plant_y) = self.transformer.to_plant_coords(&validated);
        let zone_id = self.zones.containing(plant_x, plant_y);
        let enriched = EnrichedReading::new(validated, plant_x, plant_y, zone_id);

        if let Some(zone_id) = enriched.zone_id.clone() {
            let violations = self.zones.check_violations(
                &enriched.agv_id,
                &zone_id,
                enriched.speed_mps,
                self.registry.as_ref(),
                &self.occupancy,
                now,
            );
            for violation in violations {
                self.emit_event(violation_event(violation, &enriched));
            }
            self.occupancy.record(&enriched.agv_id, &zone_id, enriched.ts);
        }

        for event in self.engine.check(&enriched) {
            self.emit_event(event);
        }

        if !self.buffer.add(enriched) {
            debug!("Ingest buffer full, reading shed");
        }

        if self.buffer.should_flush() {
            self.flush_once().await;
        }

        self.stats.processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Drain the buffer and hand the batch to the sink as one write.
    ///
    /// On failure every item of the batch moves to the retry buffer with
    /// attempt count 1. Returns the number of records written.
    pub async fn flush_once(&self) -> usize {
        let batch = self.buffer.flush(None);
        if batch.is_empty() {
            return 0;
        }

        match self.sink.write_batch(&batch).await {
            Ok(written) => {
                debug!(records = written, "Flushed batch to sink");
                written
            }
            Err(e) => {
                warn!(
                    error = %e,
                    records = batch.len(),
                    "Batch write failed, queueing for retry"
                );
                let now = Utc::now();
                for reading in batch {
                    self.buffer.add_retry(RetryItem {
                        reading,
                        enqueued_at: now,
                        attempts: 1,
                    });
                }
                0
            }
        }
    }

    /// Retry previously failed writes through the same write path.
    /// Returns the number of records written.
    pub async fn drain_retries_once(&self) -> usize {
        let items = self.buffer.drain_retries(Utc::now());
        if items.is_empty() {
            return 0;
        }

        let batch: Vec<EnrichedReading> = items.iter().map(|i| i.reading.clone()).collect();
        match self.sink.write_batch(&batch).await {
            Ok(written) => {
                info!(records = written, "Retry batch persisted");
                written
            }
            Err(e) => {
                warn!(error = %e, records = items.len(), "Retry write failed");
                for item in items {
                    self.buffer.add_retry(item);
                }
                0
            }
        }
    }

    /// Write an anomaly event, fire-and-forget. Event loss on write failure
    /// is acceptable; position-data loss is not.
    pub fn emit_event(&self, event: AnomalyEvent) {
        info!(
            agv_id = %event.agv_id,
            kind = ?event.kind,
            severity = ?event.severity,
            "{}", event.message
        );
        let sink = self.sink.clone();
        tokio::spawn(async move {
            if let Err(e) = sink.write_event(&event).await {
                warn!(error = %e, event_id = %event.event_id, "Event write failed, not retried");
            }
        });
    }

    /// Log the operator-facing counters.
    pub fn log_stats(&self) {
        let now = Utc::now();
        info!(
            received = self.stats.received(),
            processed = self.stats.processed(),
            failed = self.stats.failed(),
            rejected = self.validator.stats.rejected(),
            dropped = self.buffer.stats.dropped(),
            rate = format!("{:.2}", self.stats.rate(now)),
            buffer = self.buffer.len(),
            retry = self.buffer.retry_len(),
            entities = self.engine.tracked_entities(),
            "Pipeline statistics"
        );
    }

    /// One final synchronous flush at shutdown; no buffered reading is
    /// silently lost on a clean exit.
    pub async fn shutdown_flush(&self) {
        let written = self.flush_once().await;
        let remaining = self.buffer.len() + self.buffer.retry_len();
        info!(written, remaining, "Shutdown flush complete");
    }
}

fn violation_event(violation: Violation, reading: &EnrichedReading) -> AnomalyEvent {
    let Violation {
        kind,
        severity,
        zone_id,
        agv_id,
    } = violation;

    let (anomaly_kind, message, details) = match kind {
        ViolationKind::Speed { current, limit } => (
            AnomalyKind::SpeedViolation,
            format!("Speed {:.2} m/s exceeds zone limit {:.2} m/s", current, limit),
            json!({"value": current, "limit": limit}),
        ),
        ViolationKind::UnauthorizedAccess => (
            AnomalyKind::UnauthorizedAccess,
            format!("AGV {} not authorized for zone {}", agv_id, zone_id),
            json!({}),
        ),
        ViolationKind::ZoneFull { occupancy, capacity } => (
            AnomalyKind::ZoneFull,
            format!("Zone {} at capacity ({}/{})", zone_id, occupancy, capacity),
            json!({"occupancy": occupancy, "capacity": capacity}),
        ),
    };

    AnomalyEvent::new(anomaly_kind, severity, agv_id, message, details)
        .with_zone(Some(zone_id))
        .with_position(reading.plant_x, reading.plant_y)
}

/// Spawn the supervised periodic tasks: flush, retry drain, stats, model
/// retrain, collision scan, zone refresh. Each loop exits on the shutdown
/// signal.
pub fn spawn_background_tasks(
    pipeline: Arc<Pipeline>,
    config: &IngestConfig,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    // Periodic flush bounds staleness regardless of buffer occupancy
    {
        let pipeline = pipeline.clone();
        let mut shutdown = shutdown.clone();
        let period = Duration::from_secs(config.buffer.flush_interval_secs.max(1));
        handles.push(tokio::spawn(async move {
            let mut timer = interval(period);
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        if !pipeline.buffer.is_empty() {
                            pipeline.flush_once().await;
                        }
                    }
                    _ = shutdown.changed() => if *shutdown.borrow() { break },
                }
            }
        }));
    }

    // Retry drain
    {
        let pipeline = pipeline.clone();
        let mut shutdown = shutdown.clone();
        let period = Duration::from_secs(config.buffer.retry_interval_secs.max(1));
        handles.push(tokio::spawn(async move {
            let mut timer = interval(period);
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        if pipeline.buffer.retry_len() > 0 {
                            pipeline.drain_retries_once().await;
                        }
                    }
                    _ = shutdown.changed() => if *shutdown.borrow() { break },
                }
            }
        }));
    }

    // Statistics log
    {
        let pipeline = pipeline.clone();
        let mut shutdown = shutdown.clone();
        let period = Duration::from_secs(config.tasks.stats_interval_secs.max(1));
        handles.push(tokio::spawn(async move {
            let mut timer = interval(period);
            timer.tick().await; // skip the immediate tick, nothing to report yet
            loop {
                tokio::select! {
                    _ = timer.tick() => pipeline.log_stats(),
                    _ = shutdown.changed() => if *shutdown.borrow() { break },
                }
            }
        }));
    }

    // Per-entity model retraining
    {
        let pipeline = pipeline.clone();
        let mut shutdown = shutdown.clone();
        let period = Duration::from_secs(config.tasks.retrain_interval_secs.max(1));
        handles.push(tokio::spawn(async move {
            let mut timer = interval(period);
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        let retrained = pipeline.engine.retrain_stale_models();
                        if retrained > 0 {
                            debug!(models = retrained, "Novelty models retrained");
                        }
                    }
                    _ = shutdown.changed() => if *shutdown.borrow() { break },
                }
            }
        }));
    }

    // Cross-entity collision scan over the fleet snapshot
    {
        let pipeline = pipeline.clone();
        let mut shutdown = shutdown.clone();
        let period = Duration::from_secs(config.tasks.collision_scan_interval_secs.max(1));
        handles.push(tokio::spawn(async move {
            let mut timer = interval(period);
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        for event in pipeline.engine.scan_collisions(Utc::now()) {
                            pipeline.emit_event(event);
                        }
                    }
                    _ = shutdown.changed() => if *shutdown.borrow() { break },
                }
            }
        }));
    }

    // Zone definition refresh
    {
        let pipeline = pipeline.clone();
        let mut shutdown = shutdown.clone();
        let path = std::path::PathBuf::from(config.zones.definitions_path.clone());
        let period = Duration::from_secs(config.zones.refresh_interval_secs.max(1));
        handles.push(tokio::spawn(async move {
            let mut timer = interval(period);
            timer.tick().await; // initial load happened at startup
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        match ZoneIndex::load_file(&path) {
                            Ok(zones) => pipeline.zones.reload(zones),
                            Err(e) => warn!(error = %e, "Zone refresh failed, keeping current set"),
                        }
                    }
                    _ = shutdown.changed() => if *shutdown.borrow() { break },
                }
            }
        }));
    }

    handles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::Severity;

    fn enriched(agv_id: &str) -> EnrichedReading {
        EnrichedReading {
            agv_id: agv_id.to_string(),
            ts: Utc::now(),
            lat: None,
            lon: None,
            plant_x: 5.0,
            plant_y: 5.0,
            zone_id: Some("z1".to_string()),
            heading_deg: None,
            speed_mps: Some(3.0),
            quality: None,
            battery_percent: None,
            status: "ACTIVE".to_string(),
        }
    }

    #[test]
    fn test_speed_violation_maps_to_event() {
        let event = violation_event(
            Violation {
                kind: ViolationKind::Speed {
                    current: 3.0,
                    limit: 2.0,
                },
                severity: Severity::Warning,
                zone_id: "z1".to_string(),
                agv_id: "agv-1".to_string(),
            },
            &enriched("agv-1"),
        );
        assert_eq!(event.kind, AnomalyKind::SpeedViolation);
        assert_eq!(event.zone_id.as_deref(), Some("z1"));
        assert_eq!(event.position, Some((5.0, 5.0)));
    }

    #[test]
    fn test_zone_full_maps_to_event() {
        let event = violation_event(
            Violation {
                kind: ViolationKind::ZoneFull {
                    occupancy: 5,
                    capacity: 5,
                },
                severity: Severity::Warning,
                zone_id: "z1".to_string(),
                agv_id: "agv-1".to_string(),
            },
            &enriched("agv-1"),
        );
        assert_eq!(event.kind, AnomalyKind::ZoneFull);
        assert_eq!(event.details["occupancy"], 5);
    }

    #[test]
    fn test_unauthorized_access_maps_to_event() {
        let event = violation_event(
            Violation {
                kind: ViolationKind::UnauthorizedAccess,
                severity: Severity::Critical,
                zone_id: "maint".to_string(),
                agv_id: "agv-1".to_string(),
            },
            &enriched("agv-1"),
        );
        assert_eq!(event.kind, AnomalyKind::UnauthorizedAccess);
        assert_eq!(event.severity, Severity::Critical);
    }
}

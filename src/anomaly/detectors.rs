use super::event::{AnomalyEvent, AnomalyKind, Severity};
use super::AnomalyConfig;
use crate::reading::EnrichedReading;
use serde_json::json;
use std::collections::VecDeque;

/// History points required before the statistical method runs.
pub const MIN_STATISTICAL_HISTORY: usize = 10;

/// History points required before the pattern method runs.
pub const MIN_PATTERN_HISTORY: usize = 30;

/// |z| above this is a statistical outlier.
const Z_SCORE_CUTOFF: f64 = 3.0;

/// Speeds below this count as idle.
const IDLE_SPEED_MPS: f64 = 0.1;

/// Positions considered for the circular-movement check.
const CIRCULAR_WINDOW: usize = 20;

/// Net-displacement / path-length ratio below this means circling.
const CIRCULAR_RATIO: f64 = 0.2;

/// Headings considered for the erratic-heading check.
const HEADING_WINDOW: usize = 10;

/// Mean wrap-corrected heading delta above this is erratic.
const ERRATIC_HEADING_DEG: f64 = 45.0;

const STD_EPSILON: f64 = 1e-9;

/// Fixed-threshold checks on the latest reading alone.
pub(super) fn threshold(reading: &EnrichedReading, config: &AnomalyConfig) -> Vec<AnomalyEvent> {
    let mut events = Vec::new();

    if let Some(speed) = reading.speed_mps {
        if speed > config.speed_threshold_mps {
            events.push(
                AnomalyEvent::new(
                    AnomalyKind::SpeedViolation,
                    Severity::Warning,
                    &reading.agv_id,
                    format!("Speed {:.2} m/s exceeds threshold", speed),
                    json!({"value": speed, "threshold": config.speed_threshold_mps}),
                )
                .with_zone(reading.zone_id.clone())
                .with_position(reading.plant_x, reading.plant_y),
            );
        }
    }

    if let Some(quality) = reading.quality {
        if quality < config.quality_threshold {
            events.push(
                AnomalyEvent::new(
                    AnomalyKind::LowSignalQuality,
                    Severity::Warning,
                    &reading.agv_id,
                    format!("Signal quality {:.2} below threshold", quality),
                    json!({"value": quality, "threshold": config.quality_threshold}),
                )
                .with_zone(reading.zone_id.clone())
                .with_position(reading.plant_x, reading.plant_y),
            );
        }
    }

    if let Some(battery) = reading.battery_percent {
        if battery < config.battery_threshold_percent {
            let severity = if battery > 10.0 {
                Severity::Warning
            } else {
                Severity::Critical
            };
            events.push(
                AnomalyEvent::new(
                    AnomalyKind::LowBattery,
                    severity,
                    &reading.agv_id,
                    format!("Battery level {:.0}% is low", battery),
                    json!({"value": battery, "threshold": config.battery_threshold_percent}),
                )
                .with_zone(reading.zone_id.clone())
                .with_position(reading.plant_x, reading.plant_y),
            );
        }
    }

    events
}

/// Z-score outliers and acceleration spikes against the entity's own history.
///
/// The latest reading is the last history element; the distribution it is
/// scored against excludes it. A zero-variance prior distribution is
/// unscoreable and skipped.
pub(super) fn statistical(
    reading: &EnrichedReading,
    history: &VecDeque<EnrichedReading>,
    config: &AnomalyConfig,
) -> Vec<AnomalyEvent> {
    let mut events = Vec::new();

    let fields: [(&str, fn(&EnrichedReading) -> Option<f64>); 3] = [
        ("speed_mps", |r| r.speed_mps),
        ("heading_deg", |r| r.heading_deg),
        ("quality", |r| r.quality),
    ];

    for (name, get) in fields {
        let Some(current) = get(reading) else { continue };

        let prior: Vec<f64> = history
            .iter()
            .take(history.len().saturating_sub(1))
            .filter_map(get)
            .collect();
        if prior.len() < 3 {
            continue;
        }

        let mean = prior.iter().sum::<f64>() / prior.len() as f64;
        let std =
            (prior.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / prior.len() as f64).sqrt();
        if std <= STD_EPSILON {
            continue;
        }

        let z = ((current - mean) / std).abs();
        if z > Z_SCORE_CUTOFF {
            events.push(
                AnomalyEvent::new(
                    AnomalyKind::StatisticalAnomaly,
                    Severity::Info,
                    &reading.agv_id,
                    format!("Unusual {} value detected (z-score: {:.2})", name, z),
                    json!({"field": name, "z_score": z, "value": current}),
                )
                .with_zone(reading.zone_id.clone())
                .with_position(reading.plant_x, reading.plant_y),
            );
        }
    }

    // Discrete acceleration between the two latest samples
    let speeds: Vec<f64> = history.iter().filter_map(|r| r.speed_mps).collect();
    if speeds.len() >= 2 {
        let accel = (speeds[speeds.len() - 1] - speeds[speeds.len() - 2]) * config.sample_rate_hz;
        if accel.abs() > config.acceleration_threshold_mps2 {
            events.push(
                AnomalyEvent::new(
                    AnomalyKind::AccelerationSpike,
                    Severity::Warning,
                    &reading.agv_id,
                    format!("High acceleration detected: {:.2} m/s²", accel),
                    json!({"value": accel, "threshold": config.acceleration_threshold_mps2}),
                )
                .with_zone(reading.zone_id.clone())
                .with_position(reading.plant_x, reading.plant_y),
            );
        }
    }

    events
}

/// Movement-pattern checks over the recent history window.
pub(super) fn pattern(
    reading: &EnrichedReading,
    history: &VecDeque<EnrichedReading>,
    config: &AnomalyConfig,
) -> Vec<AnomalyEvent> {
    let mut events = Vec::new();

    // Excessive idle: fraction of the last 30 samples below idle speed,
    // converted to wall time via the sample rate
    let recent_speeds: Vec<f64> = history
        .iter()
        .rev()
        .take(MIN_PATTERN_HISTORY)
        .filter_map(|r| r.speed_mps)
        .collect();
    if !recent_speeds.is_empty() && config.sample_rate_hz > 0.0 {
        let idle_count = recent_speeds.iter().filter(|s| **s < IDLE_SPEED_MPS).count();
        let idle_secs = idle_count as f64 / config.sample_rate_hz;
        if idle_secs > config.idle_threshold_secs {
            events.push(
                AnomalyEvent::new(
                    AnomalyKind::ExcessiveIdle,
                    Severity::Warning,
                    &reading.agv_id,
                    format!("AGV idle for {:.0} seconds", idle_secs),
                    json!({"idle_secs": idle_secs, "threshold": config.idle_threshold_secs}),
                )
                .with_zone(reading.zone_id.clone())
                .with_position(reading.plant_x, reading.plant_y),
            );
        }
    }

    // Circular / stuck movement: net displacement a small fraction of the
    // path actually travelled
    let positions: Vec<(f64, f64)> = history
        .iter()
        .rev()
        .take(CIRCULAR_WINDOW)
        .map(|r| (r.plant_x, r.plant_y))
        .collect();
    if positions.len() > 10 {
        let total: f64 = positions
            .windows(2)
            .map(|w| ((w[1].0 - w[0].0).powi(2) + (w[1].1 - w[0].1).powi(2)).sqrt())
            .sum();
        let (first, last) = (positions[positions.len() - 1], positions[0]);
        let displacement = ((last.0 - first.0).powi(2) + (last.1 - first.1).powi(2)).sqrt();
        if total > 0.0 && displacement / total < CIRCULAR_RATIO {
            events.push(
                AnomalyEvent::new(
                    AnomalyKind::CircularMovement,
                    Severity::Warning,
                    &reading.agv_id,
                    "AGV appears to be moving in circles",
                    json!({"total_distance": total, "displacement": displacement}),
                )
                .with_zone(reading.zone_id.clone())
                .with_position(reading.plant_x, reading.plant_y),
            );
        }
    }

    // Erratic heading: mean wrap-corrected delta over the last samples
    let headings: Vec<f64> = history
        .iter()
        .rev()
        .take(HEADING_WINDOW)
        .filter_map(|r| r.heading_deg)
        .collect();
    if headings.len() >= 2 {
        let deltas: Vec<f64> = headings
            .windows(2)
            .map(|w| {
                let d = (w[0] - w[1]).abs();
                d.min(360.0 - d)
            })
            .collect();
        let mean_delta = deltas.iter().sum::<f64>() / deltas.len() as f64;
        if mean_delta > ERRATIC_HEADING_DEG {
            events.push(
                AnomalyEvent::new(
                    AnomalyKind::ErraticHeading,
                    Severity::Info,
                    &reading.agv_id,
                    "Erratic heading changes detected",
                    json!({"mean_delta_deg": mean_delta}),
                )
                .with_zone(reading.zone_id.clone())
                .with_position(reading.plant_x, reading.plant_y),
            );
        }
    }

    events
}

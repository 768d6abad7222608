use super::{RawReading, ValidatedReading};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Hard sanity ceiling for reported speed. Anything above this is treated as
/// bad data and rejected outright, not flagged as anomalous behavior.
pub const MAX_PLAUSIBLE_SPEED_MPS: f64 = 10.0;

/// Maximum accepted age of a reading relative to validator-observed now.
/// Older readings are stale; backfill goes through a separate import path.
pub const MAX_READING_AGE_SECS: i64 = 3600;

/// Rejection reasons for a raw reading
#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    MissingAgvId,
    LatOutOfRange(f64),
    LonOutOfRange(f64),
    HeadingOutOfRange(f64),
    SpeedImplausible(f64),
    QualityOutOfRange(f64),
    BatteryOutOfRange(f64),
    Stale { age_secs: i64 },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::MissingAgvId => write!(f, "agv_id is required"),
            RejectReason::LatOutOfRange(v) => {
                write!(f, "lat {} outside [-90, 90]", v)
            }
            RejectReason::LonOutOfRange(v) => {
                write!(f, "lon {} outside [-180, 180]", v)
            }
            RejectReason::HeadingOutOfRange(v) => {
                write!(f, "heading_deg {} outside [0, 360]", v)
            }
            RejectReason::SpeedImplausible(v) => {
                write!(f, "speed_mps {} outside [0, {}]", v, MAX_PLAUSIBLE_SPEED_MPS)
            }
            RejectReason::QualityOutOfRange(v) => {
                write!(f, "quality {} outside [0, 1]", v)
            }
            RejectReason::BatteryOutOfRange(v) => {
                write!(f, "battery_percent {} outside [0, 100]", v)
            }
            RejectReason::Stale { age_secs } => {
                write!(f, "reading is {}s old, limit {}s", age_secs, MAX_READING_AGE_SECS)
            }
        }
    }
}

impl std::error::Error for RejectReason {}

/// Accept/reject counters, shared across execution contexts.
#[derive(Debug, Default)]
pub struct ValidatorStats {
    accepted: AtomicU64,
    rejected: AtomicU64,
}

impl ValidatorStats {
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

/// Structural + business-rule acceptance filter for raw readings.
///
/// `validate` has no side effects beyond the accept/reject counters.
#[derive(Debug, Default)]
pub struct Validator {
    pub stats: ValidatorStats,
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate one raw reading against schema ranges and business rules.
    ///
    /// `entity_hint` is the id derived from the routing subject, used only
    /// when the payload carries no `agv_id` of its own.
    pub fn validate(
        &self,
        raw: RawReading,
        entity_hint: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ValidatedReading, RejectReason> {
        let result = check(raw, entity_hint, now);
        match result {
            Ok(_) => self.stats.accepted.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.stats.rejected.fetch_add(1, Ordering::Relaxed),
        };
        result
    }
}

fn check(
    raw: RawReading,
    entity_hint: Option<&str>,
    now: DateTime<Utc>,
) -> Result<ValidatedReading, RejectReason> {
    // Payload id wins over the subject-derived hint
    let agv_id = raw
        .agv_id
        .filter(|id| !id.is_empty())
        .or_else(|| entity_hint.map(|s| s.to_string()))
        .filter(|id| !id.is_empty())
        .ok_or(RejectReason::MissingAgvId)?;

    if let Some(lat) = raw.lat {
        if !(-90.0..=90.0).contains(&lat) {
            return Err(RejectReason::LatOutOfRange(lat));
        }
    }
    if let Some(lon) = raw.lon {
        if !(-180.0..=180.0).contains(&lon) {
            return Err(RejectReason::LonOutOfRange(lon));
        }
    }
    if let Some(heading) = raw.heading_deg {
        if !(0.0..=360.0).contains(&heading) {
            return Err(RejectReason::HeadingOutOfRange(heading));
        }
    }
    if let Some(speed) = raw.speed_mps {
        if !(0.0..=MAX_PLAUSIBLE_SPEED_MPS).contains(&speed) {
            return Err(RejectReason::SpeedImplausible(speed));
        }
    }
    if let Some(quality) = raw.quality {
        if !(0.0..=1.0).contains(&quality) {
            return Err(RejectReason::QualityOutOfRange(quality));
        }
    }
    if let Some(battery) = raw.battery_percent {
        if !(0.0..=100.0).contains(&battery) {
            return Err(RejectReason::BatteryOutOfRange(battery));
        }
    }

    // Freshness applies only to a present, parseable timestamp. An
    // unparseable timestamp falls back to receive time rather than
    // rejecting; position data retains value even with a broken clock.
    let ts = match raw.ts.as_deref().map(parse_timestamp) {
        Some(Some(ts)) => {
            let age_secs = (now - ts).num_seconds();
            if age_secs > MAX_READING_AGE_SECS {
                return Err(RejectReason::Stale { age_secs });
            }
            ts
        }
        _ => now,
    };

    Ok(ValidatedReading {
        agv_id,
        ts,
        lat: raw.lat,
        lon: raw.lon,
        plant_x: raw.plant_x,
        plant_y: raw.plant_y,
        heading_deg: raw.heading_deg,
        speed_mps: raw.speed_mps,
        quality: raw.quality,
        battery_percent: raw.battery_percent,
        status: raw.status.unwrap_or_else(|| "ACTIVE".to_string()),
    })
}

/// Parse an RFC 3339 timestamp, tolerating a trailing `Z`.
fn parse_timestamp(ts: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn raw(agv_id: &str) -> RawReading {
        RawReading {
            agv_id: Some(agv_id.to_string()),
            ts: None,
            lat: Some(48.1),
            lon: Some(11.5),
            plant_x: None,
            plant_y: None,
            heading_deg: Some(90.0),
            speed_mps: Some(1.2),
            quality: Some(0.95),
            battery_percent: Some(80.0),
            status: None,
        }
    }

    #[test]
    fn test_valid_reading_accepted() {
        let v = Validator::new();
        let result = v.validate(raw("agv-7"), None, Utc::now());
        assert!(result.is_ok());
        let reading = result.unwrap();
        assert_eq!(reading.agv_id, "agv-7");
        assert_eq!(reading.status, "ACTIVE");
        assert_eq!(v.stats.accepted(), 1);
        assert_eq!(v.stats.rejected(), 0);
    }

    #[test]
    fn test_missing_agv_id_rejected() {
        let v = Validator::new();
        let mut r = raw("x");
        r.agv_id = None;
        assert_eq!(
            v.validate(r, None, Utc::now()),
            Err(RejectReason::MissingAgvId)
        );
        assert_eq!(v.stats.rejected(), 1);
    }

    #[test]
    fn test_subject_hint_used_when_payload_id_missing() {
        let v = Validator::new();
        let mut r = raw("x");
        r.agv_id = None;
        let reading = v.validate(r, Some("agv-3"), Utc::now()).unwrap();
        assert_eq!(reading.agv_id, "agv-3");
    }

    #[test]
    fn test_payload_id_wins_over_subject_hint() {
        let v = Validator::new();
        let reading = v.validate(raw("agv-7"), Some("agv-3"), Utc::now()).unwrap();
        assert_eq!(reading.agv_id, "agv-7");
    }

    #[test]
    fn test_range_violations_rejected() {
        let v = Validator::new();
        let now = Utc::now();

        let mut r = raw("a");
        r.lat = Some(91.0);
        assert_eq!(v.validate(r, None, now), Err(RejectReason::LatOutOfRange(91.0)));

        let mut r = raw("a");
        r.lon = Some(-180.5);
        assert_eq!(v.validate(r, None, now), Err(RejectReason::LonOutOfRange(-180.5)));

        let mut r = raw("a");
        r.heading_deg = Some(361.0);
        assert_eq!(
            v.validate(r, None, now),
            Err(RejectReason::HeadingOutOfRange(361.0))
        );

        let mut r = raw("a");
        r.quality = Some(1.5);
        assert_eq!(v.validate(r, None, now), Err(RejectReason::QualityOutOfRange(1.5)));

        let mut r = raw("a");
        r.battery_percent = Some(-1.0);
        assert_eq!(
            v.validate(r, None, now),
            Err(RejectReason::BatteryOutOfRange(-1.0))
        );

        assert_eq!(v.stats.rejected(), 5);
    }

    #[test]
    fn test_implausible_speed_rejected_not_flagged() {
        let v = Validator::new();
        let mut r = raw("a");
        r.speed_mps = Some(12.0);
        assert_eq!(
            v.validate(r, None, Utc::now()),
            Err(RejectReason::SpeedImplausible(12.0))
        );
    }

    #[test]
    fn test_boundary_values_accepted() {
        let v = Validator::new();
        let now = Utc::now();
        let mut r = raw("a");
        r.lat = Some(90.0);
        r.lon = Some(-180.0);
        r.heading_deg = Some(360.0);
        r.speed_mps = Some(MAX_PLAUSIBLE_SPEED_MPS);
        r.quality = Some(0.0);
        r.battery_percent = Some(100.0);
        assert!(v.validate(r, None, now).is_ok());
    }

    #[test]
    fn test_stale_reading_rejected() {
        let v = Validator::new();
        let now = Utc::now();
        let mut r = raw("a");
        r.ts = Some((now - Duration::seconds(3601)).to_rfc3339());
        assert!(matches!(
            v.validate(r, None, now),
            Err(RejectReason::Stale { .. })
        ));
    }

    #[test]
    fn test_fresh_timestamp_parsed() {
        let v = Validator::new();
        let now = Utc::now();
        let ts = now - Duration::seconds(30);
        let mut r = raw("a");
        r.ts = Some(ts.to_rfc3339());
        let reading = v.validate(r, None, now).unwrap();
        assert_eq!(reading.ts.timestamp(), ts.timestamp());
    }

    #[test]
    fn test_unparseable_timestamp_falls_back_to_now() {
        let v = Validator::new();
        let now = Utc::now();
        let mut r = raw("a");
        r.ts = Some("not-a-timestamp".to_string());
        let reading = v.validate(r, None, now).unwrap();
        assert_eq!(reading.ts, now);
    }
}

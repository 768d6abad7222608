use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod validation;

pub use validation::{RejectReason, Validator, ValidatorStats};

/// A raw position message as received from the transport boundary.
///
/// Field names match the wire payload produced by the tag hardware. The
/// vehicle id may be absent here and supplied by the routing subject instead;
/// when both are present the payload field takes precedence.
#[derive(Clone, Debug, Deserialize)]
pub struct RawReading {
    /// Vehicle identifier (may be derived from the subject)
    #[serde(default)]
    pub agv_id: Option<String>,

    /// Producer timestamp, RFC 3339 (e.g. "2026-08-07T09:15:00Z")
    #[serde(default)]
    pub ts: Option<String>,

    /// Geodetic position (WGS84)
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lon: Option<f64>,

    /// Already-local plant coordinates, if the tag is plant-referenced
    #[serde(default)]
    pub plant_x: Option<f64>,
    #[serde(default)]
    pub plant_y: Option<f64>,

    /// Heading in degrees [0, 360]
    #[serde(default)]
    pub heading_deg: Option<f64>,

    /// Ground speed in m/s
    #[serde(default)]
    pub speed_mps: Option<f64>,

    /// Positioning signal quality [0, 1]
    #[serde(default)]
    pub quality: Option<f64>,

    /// Battery level in percent [0, 100]
    #[serde(default)]
    pub battery_percent: Option<f64>,

    /// Status tag reported by the vehicle controller
    #[serde(default)]
    pub status: Option<String>,
}

/// A reading that passed schema and business-rule validation.
///
/// The timestamp is resolved: a parseable `ts` is used as-is, anything else
/// falls back to the validator-observed receive time.
#[derive(Clone, Debug, PartialEq)]
pub struct ValidatedReading {
    pub agv_id: String,
    pub ts: DateTime<Utc>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub plant_x: Option<f64>,
    pub plant_y: Option<f64>,
    pub heading_deg: Option<f64>,
    pub speed_mps: Option<f64>,
    pub quality: Option<f64>,
    pub battery_percent: Option<f64>,
    pub status: String,
}

/// A validated reading enriched with plant-frame coordinates and zone.
///
/// This is the unit handed to the persistence sink.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnrichedReading {
    pub agv_id: String,
    pub ts: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lon: Option<f64>,
    pub plant_x: f64,
    pub plant_y: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zone_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heading_deg: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed_mps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_percent: Option<f64>,
    pub status: String,
}

impl EnrichedReading {
    /// Build an enriched reading from its validated parent plus derived context.
    pub fn new(reading: ValidatedReading, plant_x: f64, plant_y: f64, zone_id: Option<String>) -> Self {
        Self {
            agv_id: reading.agv_id,
            ts: reading.ts,
            lat: reading.lat,
            lon: reading.lon,
            plant_x,
            plant_y,
            zone_id,
            heading_deg: reading.heading_deg,
            speed_mps: reading.speed_mps,
            quality: reading.quality,
            battery_percent: reading.battery_percent,
            status: reading.status,
        }
    }
}

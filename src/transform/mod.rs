use crate::reading::ValidatedReading;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{info, warn};

mod projection;

pub use projection::LocalProjection;

/// Transformer configuration
#[derive(Clone, Debug, Deserialize)]
pub struct TransformConfig {
    /// Path to the calibration model file (JSON); missing file means identity
    #[serde(default = "default_calibration_path")]
    pub calibration_path: String,
    /// Tangent-plane projection origin (geodetic)
    #[serde(default)]
    pub origin_lat: f64,
    #[serde(default)]
    pub origin_lon: f64,
    /// Plant bounds; out-of-bounds results are advisory, never dropped
    #[serde(default)]
    pub plant_bounds: PlantBounds,
    /// Maximum memoized (lat, lon) pairs before the cache is cleared
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

fn default_calibration_path() -> String {
    "config/calibration.json".to_string()
}

fn default_cache_capacity() -> usize {
    10_000
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            calibration_path: default_calibration_path(),
            origin_lat: 0.0,
            origin_lon: 0.0,
            plant_bounds: PlantBounds::default(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

/// Rectangular plant extent in plant-frame meters
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct PlantBounds {
    pub xmin: f64,
    pub xmax: f64,
    pub ymin: f64,
    pub ymax: f64,
}

impl Default for PlantBounds {
    fn default() -> Self {
        Self {
            xmin: 0.0,
            xmax: 200.0,
            ymin: 0.0,
            ymax: 150.0,
        }
    }
}

impl PlantBounds {
    pub fn contains(&self, x: f64, y: f64) -> bool {
        (self.xmin..=self.xmax).contains(&x) && (self.ymin..=self.ymax).contains(&y)
    }
}

/// Calibrated affine map from the projected metric frame to the plant frame.
///
/// Homogeneous 3×3, row-major: `[x, y, 1]ᵗ = M · [proj_x, proj_y, 1]ᵗ`.
/// Produced by the external calibration tool from paired control points.
#[derive(Clone, Debug, Deserialize)]
pub struct CalibrationModel {
    pub matrix: [[f64; 3]; 3],
    #[serde(default = "default_source_frame")]
    pub source_frame: String,
    #[serde(default = "default_target_frame")]
    pub target_frame: String,
}

fn default_source_frame() -> String {
    "metric-local".to_string()
}

fn default_target_frame() -> String {
    "plant".to_string()
}

impl CalibrationModel {
    /// Identity calibration, used when no model file is present.
    pub fn identity() -> Self {
        Self {
            matrix: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            source_frame: default_source_frame(),
            target_frame: default_target_frame(),
        }
    }

    /// Load a calibration model from a JSON file.
    ///
    /// A missing file is accepted (`Ok(None)`, caller falls back to
    /// identity). A file that exists but does not parse is a configuration
    /// error and fails startup.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read calibration file {}", path.display()))?;
        let model: Self = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse calibration file {}", path.display()))?;
        Ok(Some(model))
    }

    /// Apply the affine map to a metric point.
    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        let m = &self.matrix;
        (
            m[0][0] * x + m[0][1] * y + m[0][2],
            m[1][0] * x + m[1][1] * y + m[1][2],
        )
    }

    /// Invert the affine map. Returns None for a singular matrix.
    pub fn inverse(&self) -> Option<Self> {
        let m = &self.matrix;
        let det = m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
            - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
            + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0]);
        if det.abs() < 1e-12 {
            return None;
        }
        let inv_det = 1.0 / det;
        let mut inv = [[0.0; 3]; 3];
        inv[0][0] = (m[1][1] * m[2][2] - m[1][2] * m[2][1]) * inv_det;
        inv[0][1] = (m[0][2] * m[2][1] - m[0][1] * m[2][2]) * inv_det;
        inv[0][2] = (m[0][1] * m[1][2] - m[0][2] * m[1][1]) * inv_det;
        inv[1][0] = (m[1][2] * m[2][0] - m[1][0] * m[2][2]) * inv_det;
        inv[1][1] = (m[0][0] * m[2][2] - m[0][2] * m[2][0]) * inv_det;
        inv[1][2] = (m[0][2] * m[1][0] - m[0][0] * m[1][2]) * inv_det;
        inv[2][0] = (m[1][0] * m[2][1] - m[1][1] * m[2][0]) * inv_det;
        inv[2][1] = (m[0][1] * m[2][0] - m[0][0] * m[2][1]) * inv_det;
        inv[2][2] = (m[0][0] * m[1][1] - m[0][1] * m[1][0]) * inv_det;
        Some(Self {
            matrix: inv,
            source_frame: self.target_frame.clone(),
            target_frame: self.source_frame.clone(),
        })
    }
}

/// Converts validated readings into plant-frame coordinates.
///
/// Readings that already carry local (plant_x, plant_y) pass through
/// unchanged regardless of calibration. Geodetic readings go through the
/// fixed projection and the calibrated affine. Repeated (lat, lon) pairs are
/// memoized in a bounded cache.
pub struct Transformer {
    projection: LocalProjection,
    calibration: RwLock<Arc<CalibrationModel>>,
    bounds: PlantBounds,
    cache: Mutex<HashMap<(u64, u64), (f64, f64)>>,
    cache_capacity: usize,
}

impl Transformer {
    /// Build a transformer from config, loading the calibration model.
    ///
    /// A missing calibration file falls back to identity with a warning; an
    /// unparseable one is fatal.
    pub fn from_config(config: &TransformConfig) -> Result<Self> {
        let calibration = match CalibrationModel::load(Path::new(&config.calibration_path))? {
            Some(model) => {
                info!(
                    path = %config.calibration_path,
                    source = %model.source_frame,
                    target = %model.target_frame,
                    "Loaded calibration model"
                );
                model
            }
            None => {
                warn!(
                    path = %config.calibration_path,
                    "No calibration model found, using identity transform"
                );
                CalibrationModel::identity()
            }
        };

        Ok(Self::new(
            LocalProjection::new(config.origin_lat, config.origin_lon),
            calibration,
            config.plant_bounds,
            config.cache_capacity,
        ))
    }

    pub fn new(
        projection: LocalProjection,
        calibration: CalibrationModel,
        bounds: PlantBounds,
        cache_capacity: usize,
    ) -> Self {
        Self {
            projection,
            calibration: RwLock::new(Arc::new(calibration)),
            bounds,
            cache: Mutex::new(HashMap::new()),
            cache_capacity,
        }
    }

    /// Hot-reload the calibration model from a file, swapping it atomically.
    pub fn reload_calibration(&self, path: &Path) -> Result<()> {
        let model = CalibrationModel::load(path)?.unwrap_or_else(CalibrationModel::identity);
        *self.calibration.write().unwrap() = Arc::new(model);
        self.cache.lock().unwrap().clear();
        info!(path = %path.display(), "Calibration model reloaded");
        Ok(())
    }

    /// Convert a validated reading to plant-frame (x, y).
    ///
    /// Already-local readings are returned unchanged; the pipeline must not
    /// re-transform plant-referenced data.
    pub fn to_plant_coords(&self, reading: &ValidatedReading) -> (f64, f64) {
        if let (Some(x), Some(y)) = (reading.plant_x, reading.plant_y) {
            return (x, y);
        }

        // Best-effort on missing geodetic input: project the zero default
        // rather than dropping the reading.
        if reading.lat.is_none() || reading.lon.is_none() {
            warn!(agv_id = %reading.agv_id, "Reading carries no usable coordinates");
        }
        let lat = reading.lat.unwrap_or(0.0);
        let lon = reading.lon.unwrap_or(0.0);

        let key = (lat.to_bits(), lon.to_bits());
        if let Some(&cached) = self.cache.lock().unwrap().get(&key) {
            return cached;
        }

        let (metric_x, metric_y) = self.projection.project(lat, lon);
        let calibration = self.calibration.read().unwrap().clone();
        let (plant_x, plant_y) = calibration.apply(metric_x, metric_y);

        if !self.bounds.contains(plant_x, plant_y) {
            warn!(
                agv_id = %reading.agv_id,
                plant_x,
                plant_y,
                "Transformed position outside plant bounds"
            );
        }

        let mut cache = self.cache.lock().unwrap();
        if cache.len() >= self.cache_capacity {
            cache.clear();
        }
        cache.insert(key, (plant_x, plant_y));

        (plant_x, plant_y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn validated(lat: Option<f64>, lon: Option<f64>, local: Option<(f64, f64)>) -> ValidatedReading {
        ValidatedReading {
            agv_id: "agv-1".to_string(),
            ts: Utc::now(),
            lat,
            lon,
            plant_x: local.map(|(x, _)| x),
            plant_y: local.map(|(_, y)| y),
            heading_deg: None,
            speed_mps: None,
            quality: None,
            battery_percent: None,
            status: "ACTIVE".to_string(),
        }
    }

    fn transformer_with(calibration: CalibrationModel) -> Transformer {
        Transformer::new(
            LocalProjection::new(48.1, 11.5),
            calibration,
            PlantBounds::default(),
            16,
        )
    }

    #[test]
    fn test_local_coordinates_pass_through_unchanged() {
        // Deliberately non-identity calibration: pass-through must ignore it
        let scaled = CalibrationModel {
            matrix: [[2.0, 0.0, 5.0], [0.0, 2.0, 5.0], [0.0, 0.0, 1.0]],
            source_frame: "metric-local".to_string(),
            target_frame: "plant".to_string(),
        };
        let t = transformer_with(scaled);
        let (x, y) = t.to_plant_coords(&validated(Some(48.1), Some(11.5), Some((12.5, 42.0))));
        assert_eq!((x, y), (12.5, 42.0));
    }

    #[test]
    fn test_affine_roundtrip_recovers_metric_coords() {
        let model = CalibrationModel {
            matrix: [[0.9, -0.1, 12.0], [0.1, 1.1, -3.0], [0.0, 0.0, 1.0]],
            source_frame: "metric-local".to_string(),
            target_frame: "plant".to_string(),
        };
        let inverse = model.inverse().expect("matrix must be invertible");

        let (x, y) = model.apply(17.25, -4.5);
        let (rx, ry) = inverse.apply(x, y);
        assert!((rx - 17.25).abs() < 1e-9);
        assert!((ry - -4.5).abs() < 1e-9);
    }

    #[test]
    fn test_singular_matrix_has_no_inverse() {
        let model = CalibrationModel {
            matrix: [[1.0, 2.0, 0.0], [2.0, 4.0, 0.0], [0.0, 0.0, 1.0]],
            source_frame: "metric-local".to_string(),
            target_frame: "plant".to_string(),
        };
        assert!(model.inverse().is_none());
    }

    #[test]
    fn test_identity_calibration_projects_only() {
        let t = transformer_with(CalibrationModel::identity());
        let (x, y) = t.to_plant_coords(&validated(Some(48.101), Some(11.5), None));
        assert!(x.abs() < 1e-6);
        assert!((y - 111.3).abs() < 1.0);
    }

    #[test]
    fn test_out_of_bounds_still_returns_value() {
        let t = transformer_with(CalibrationModel::identity());
        // Far north of the origin, way outside the default 200x150 bounds
        let (_, y) = t.to_plant_coords(&validated(Some(49.0), Some(11.5), None));
        assert!(y > 10_000.0);
    }

    #[test]
    fn test_cache_is_bounded() {
        let t = transformer_with(CalibrationModel::identity());
        for i in 0..100 {
            let lat = 48.1 + f64::from(i) * 1e-5;
            t.to_plant_coords(&validated(Some(lat), Some(11.5), None));
        }
        assert!(t.cache.lock().unwrap().len() <= 16);
    }

    #[test]
    fn test_repeated_pair_memoized() {
        let t = transformer_with(CalibrationModel::identity());
        let r = validated(Some(48.1005), Some(11.5005), None);
        let first = t.to_plant_coords(&r);
        let second = t.to_plant_coords(&r);
        assert_eq!(first, second);
        assert_eq!(t.cache.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_missing_calibration_file_is_none() {
        let loaded = CalibrationModel::load(Path::new("/nonexistent/calibration.json")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_malformed_calibration_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calibration.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(CalibrationModel::load(&path).is_err());
    }

    #[test]
    fn test_calibration_file_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calibration.json");
        std::fs::write(
            &path,
            r#"{
                "matrix": [[1.0, 0.0, 10.0], [0.0, 1.0, 20.0], [0.0, 0.0, 1.0]],
                "source_frame": "utm-local",
                "target_frame": "plant"
            }"#,
        )
        .unwrap();
        let model = CalibrationModel::load(&path).unwrap().unwrap();
        assert_eq!(model.apply(1.0, 2.0), (11.0, 22.0));
        assert_eq!(model.source_frame, "utm-local");
    }
}

/// WGS84 semi-major axis in meters.
const EARTH_RADIUS_M: f64 = 6_378_137.0;

/// Fixed geodetic→metric projection: a local tangent plane anchored at a
/// configured origin. The origin is set once at startup; the projection pair
/// is never re-derived per call.
///
/// Accurate to well under plant scale (a few hundred meters) anywhere away
/// from the poles, which is the only regime a plant frame operates in.
#[derive(Clone, Debug)]
pub struct LocalProjection {
    origin_lat: f64,
    origin_lon: f64,
    /// cos(origin_lat), precomputed
    lat_scale: f64,
}

impl LocalProjection {
    pub fn new(origin_lat: f64, origin_lon: f64) -> Self {
        Self {
            origin_lat,
            origin_lon,
            lat_scale: origin_lat.to_radians().cos(),
        }
    }

    /// Project geodetic (lat, lon) to metric (east, north) relative to the origin.
    pub fn project(&self, lat: f64, lon: f64) -> (f64, f64) {
        let east = (lon - self.origin_lon).to_radians() * EARTH_RADIUS_M * self.lat_scale;
        let north = (lat - self.origin_lat).to_radians() * EARTH_RADIUS_M;
        (east, north)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_projects_to_zero() {
        let proj = LocalProjection::new(48.1, 11.5);
        let (x, y) = proj.project(48.1, 11.5);
        assert!(x.abs() < 1e-9);
        assert!(y.abs() < 1e-9);
    }

    #[test]
    fn test_north_displacement_positive_y() {
        let proj = LocalProjection::new(48.1, 11.5);
        // ~0.001 degrees latitude ≈ 111 meters
        let (x, y) = proj.project(48.101, 11.5);
        assert!(x.abs() < 1e-6);
        assert!((y - 111.3).abs() < 1.0);
    }

    #[test]
    fn test_east_displacement_scaled_by_latitude() {
        let proj = LocalProjection::new(60.0, 0.0);
        let (x, _) = proj.project(60.0, 0.001);
        // At 60°N a degree of longitude is half a degree of latitude
        assert!((x - 111.3 / 2.0).abs() < 1.0);
    }
}

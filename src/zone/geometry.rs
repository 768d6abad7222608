//! Planar geometry for zone polygons.
//!
//! Polygons are open rings (last vertex implicitly connects to the first) and
//! are assumed simple; malformed rings are a caller error.

/// Tolerance for boundary adjacency tests, in plant-frame meters.
const TOUCH_EPSILON: f64 = 1e-6;

/// Ray-casting point-in-polygon test.
///
/// A point exactly on an edge may land on either side; zones are not expected
/// to rely on boundary-exact containment.
pub fn point_in_polygon(x: f64, y: f64, vertices: &[[f64; 2]]) -> bool {
    if vertices.len() < 3 {
        return false;
    }

    let mut inside = false;
    let mut j = vertices.len() - 1;
    for i in 0..vertices.len() {
        let (xi, yi) = (vertices[i][0], vertices[i][1]);
        let (xj, yj) = (vertices[j][0], vertices[j][1]);

        if ((yi > y) != (yj > y)) && (x < (xj - xi) * (y - yi) / (yj - yi) + xi) {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// Whether two polygon boundaries touch (any pair of edges within tolerance).
pub fn polygons_touch(a: &[[f64; 2]], b: &[[f64; 2]]) -> bool {
    if a.len() < 2 || b.len() < 2 {
        return false;
    }
    for (a1, a2) in edges(a) {
        for (b1, b2) in edges(b) {
            if segment_distance(a1, a2, b1, b2) <= TOUCH_EPSILON {
                return true;
            }
        }
    }
    false
}

/// Arithmetic-mean centroid of the vertex ring.
pub fn centroid(vertices: &[[f64; 2]]) -> Option<(f64, f64)> {
    if vertices.is_empty() {
        return None;
    }
    let n = vertices.len() as f64;
    let (sx, sy) = vertices
        .iter()
        .fold((0.0, 0.0), |(sx, sy), v| (sx + v[0], sy + v[1]));
    Some((sx / n, sy / n))
}

fn edges(vertices: &[[f64; 2]]) -> impl Iterator<Item = ((f64, f64), (f64, f64))> + '_ {
    (0..vertices.len()).map(move |i| {
        let j = (i + 1) % vertices.len();
        (
            (vertices[i][0], vertices[i][1]),
            (vertices[j][0], vertices[j][1]),
        )
    })
}

/// Minimum distance between two line segments.
fn segment_distance(a1: (f64, f64), a2: (f64, f64), b1: (f64, f64), b2: (f64, f64)) -> f64 {
    if segments_intersect(a1, a2, b1, b2) {
        return 0.0;
    }
    point_segment_distance(a1, b1, b2)
        .min(point_segment_distance(a2, b1, b2))
        .min(point_segment_distance(b1, a1, a2))
        .min(point_segment_distance(b2, a1, a2))
}

fn point_segment_distance(p: (f64, f64), s1: (f64, f64), s2: (f64, f64)) -> f64 {
    let (dx, dy) = (s2.0 - s1.0, s2.1 - s1.1);
    let len_sq = dx * dx + dy * dy;
    let t = if len_sq > 0.0 {
        (((p.0 - s1.0) * dx + (p.1 - s1.1) * dy) / len_sq).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let (cx, cy) = (s1.0 + t * dx, s1.1 + t * dy);
    ((p.0 - cx).powi(2) + (p.1 - cy).powi(2)).sqrt()
}

fn segments_intersect(a1: (f64, f64), a2: (f64, f64), b1: (f64, f64), b2: (f64, f64)) -> bool {
    let d1 = cross(b1, b2, a1);
    let d2 = cross(b1, b2, a2);
    let d3 = cross(a1, a2, b1);
    let d4 = cross(a1, a2, b2);
    ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
        && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
}

fn cross(o: (f64, f64), a: (f64, f64), b: (f64, f64)) -> f64 {
    (a.0 - o.0) * (b.1 - o.1) - (a.1 - o.1) * (b.0 - o.0)
}

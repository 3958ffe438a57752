//! Distance-indexed polylines.
//!
//! A [`Polyline`] precomputes cumulative great-circle distances so that
//! "where is the point 1234 m along this path" is a binary search plus a
//! linear interpolation.

use super::LngLat;

/// An ordered path with cumulative distances.
#[derive(Debug, Clone, PartialEq)]
pub struct Polyline {
    points: Vec<LngLat>,
    /// `cumulative[i]` is the path distance from `points[0]` to `points[i]`.
    cumulative: Vec<f64>,
}

impl Polyline {
    /// Build a polyline from at least two valid points.
    ///
    /// Returns `None` if fewer than two points are given or any point is invalid.
    pub fn new(points: Vec<LngLat>) -> Option<Self> {
        if points.len() < 2 || points.iter().any(|p| !p.is_valid()) {
            return None;
        }

        let mut cumulative = Vec::with_capacity(points.len());
        let mut total = 0.0;
        cumulative.push(0.0);
        for pair in points.windows(2) {
            total += pair[0].distance_m(&pair[1]);
            cumulative.push(total);
        }

        Some(Self { points, cumulative })
    }

    /// Total path length in meters.
    pub fn length_m(&self) -> f64 {
        self.cumulative.last().copied().unwrap_or(0.0)
    }

    /// The vertices of this path.
    pub fn points(&self) -> &[LngLat] {
        &self.points
    }

    /// Path distance of the vertex at `index`.
    pub fn distance_at_vertex(&self, index: usize) -> Option<f64> {
        self.cumulative.get(index).copied()
    }

    /// Position and bearing at a path distance.
    ///
    /// Distances are clamped to `0..=length`.
    pub fn locate(&self, distance_m: f64) -> (LngLat, f64) {
        let d = distance_m.clamp(0.0, self.length_m());

        // Index of the first vertex strictly beyond `d`, so the segment is [i-1, i].
        let upper = self
            .cumulative
            .partition_point(|&c| c <= d)
            .clamp(1, self.points.len() - 1);
        let lower = upper - 1;

        let start = &self.points[lower];
        let end = &self.points[upper];
        let seg_len = self.cumulative[upper] - self.cumulative[lower];
        let t = if seg_len > 0.0 {
            (d - self.cumulative[lower]) / seg_len
        } else {
            0.0
        };

        (start.lerp(end, t), start.bearing_to(end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn straight_line() -> Polyline {
        Polyline::new(vec![
            LngLat::new(0.0, 0.0),
            LngLat::new(0.0, 0.01),
            LngLat::new(0.0, 0.02),
        ])
        .unwrap()
    }

    #[test]
    fn test_rejects_short_or_invalid_paths() {
        assert!(Polyline::new(vec![LngLat::new(0.0, 0.0)]).is_none());
        assert!(Polyline::new(vec![LngLat::new(0.0, 0.0), LngLat::new(f64::NAN, 0.0)]).is_none());
    }

    #[test]
    fn test_cumulative_distances() {
        let line = straight_line();
        let seg = line.distance_at_vertex(1).unwrap();
        assert!((line.length_m() - 2.0 * seg).abs() < 1e-6);
        assert_eq!(line.distance_at_vertex(0), Some(0.0));
        assert_eq!(line.distance_at_vertex(3), None);
    }

    #[test]
    fn test_locate_midpoint() {
        let line = straight_line();
        let (pos, bearing) = line.locate(line.length_m() / 4.0);
        assert!((pos.lat - 0.005).abs() < 1e-6);
        assert!(bearing.abs() < 1e-6);
    }

    #[test]
    fn test_locate_clamps_to_ends() {
        let line = straight_line();
        assert_eq!(line.locate(-5.0).0, LngLat::new(0.0, 0.0));
        let (end, _) = line.locate(line.length_m() + 100.0);
        assert!((end.lat - 0.02).abs() < 1e-9);
    }

    #[test]
    fn test_locate_exact_vertex() {
        let line = straight_line();
        let d = line.distance_at_vertex(1).unwrap();
        let (pos, _) = line.locate(d);
        assert!((pos.lat - 0.01).abs() < 1e-9);
    }
}

//! Static flow geometry.
//!
//! Each curve is a centripetal Catmull-Rom spline through its control points,
//! resampled once to evenly spaced points by arclength. Anchors and particles
//! evaluate the resampled spline so that equal steps in the curve parameter
//! cover roughly equal distances.

use crate::error::{PulseError, Result};
use glam::Vec3;
use serde::Deserialize;
use std::path::Path;

/// Divisions used to tabulate arclength when resampling.
const ARC_LENGTH_DIVISIONS: usize = 200;

/// Below this the centripetal knot spacing is treated as degenerate.
const KNOT_EPSILON: f32 = 1e-4;

/// Open centripetal Catmull-Rom spline.
#[derive(Debug, Clone)]
pub struct CatmullRom {
    points: Vec<Vec3>,
}

impl CatmullRom {
    /// Callers guarantee at least two points.
    pub fn new(points: Vec<Vec3>) -> Self {
        debug_assert!(points.len() >= 2);
        Self { points }
    }

    pub fn points(&self) -> &[Vec3] {
        &self.points
    }

    /// Evaluate at `t` in [0, 1]; values outside are clamped.
    pub fn point(&self, t: f32) -> Vec3 {
        let n = self.points.len();
        let p = (n - 1) as f32 * t.clamp(0.0, 1.0);
        let mut segment = p.floor() as usize;
        let mut weight = p - segment as f32;
        if segment >= n - 1 {
            segment = n - 2;
            weight = 1.0;
        }

        let p1 = self.points[segment];
        let p2 = self.points[segment + 1];
        // Missing neighbours at the ends are mirrored.
        let p0 = if segment > 0 {
            self.points[segment - 1]
        } else {
            p1 * 2.0 - p2
        };
        let p3 = if segment + 2 < n {
            self.points[segment + 2]
        } else {
            p2 * 2.0 - p1
        };

        let mut dt0 = p0.distance_squared(p1).powf(0.25);
        let mut dt1 = p1.distance_squared(p2).powf(0.25);
        let mut dt2 = p2.distance_squared(p3).powf(0.25);
        if dt1 < KNOT_EPSILON {
            dt1 = 1.0;
        }
        if dt0 < KNOT_EPSILON {
            dt0 = dt1;
        }
        if dt2 < KNOT_EPSILON {
            dt2 = dt1;
        }

        let m1 = ((p1 - p0) / dt0 - (p2 - p0) / (dt0 + dt1) + (p2 - p1) / dt1) * dt1;
        let m2 = ((p2 - p1) / dt1 - (p3 - p1) / (dt1 + dt2) + (p3 - p2) / dt2) * dt1;

        hermite(p1, p2, m1, m2, weight)
    }

    /// Cumulative arclength at `divisions + 1` evenly spaced parameters.
    fn arc_lengths(&self, divisions: usize) -> Vec<f32> {
        let mut lengths = Vec::with_capacity(divisions + 1);
        let mut last = self.point(0.0);
        let mut total = 0.0;
        lengths.push(0.0);
        for i in 1..=divisions {
            let current = self.point(i as f32 / divisions as f32);
            total += current.distance(last);
            lengths.push(total);
            last = current;
        }
        lengths
    }

    /// Total arclength, approximated by a dense polyline.
    pub fn length(&self) -> f32 {
        self.arc_lengths(ARC_LENGTH_DIVISIONS)
            .last()
            .copied()
            .unwrap_or(0.0)
    }

    /// `count` points spaced evenly by arclength, endpoints included.
    pub fn spaced_points(&self, count: usize) -> Vec<Vec3> {
        let count = count.max(2);
        let lengths = self.arc_lengths(ARC_LENGTH_DIVISIONS);
        let total = lengths[ARC_LENGTH_DIVISIONS];

        (0..count)
            .map(|i| {
                let target = total * i as f32 / (count - 1) as f32;
                self.point(self.arc_to_param(&lengths, target))
            })
            .collect()
    }

    fn arc_to_param(&self, lengths: &[f32], target: f32) -> f32 {
        let divisions = lengths.len() - 1;
        if target <= 0.0 {
            return 0.0;
        }
        if target >= lengths[divisions] {
            return 1.0;
        }
        // First index whose cumulative length exceeds the target.
        let upper = lengths.partition_point(|&l| l <= target).min(divisions);
        let lower = upper - 1;
        let span = lengths[upper] - lengths[lower];
        let frac = if span > 0.0 {
            (target - lengths[lower]) / span
        } else {
            0.0
        };
        (lower as f32 + frac) / divisions as f32
    }
}

fn hermite(p1: Vec3, p2: Vec3, m1: Vec3, m2: Vec3, w: f32) -> Vec3 {
    let c0 = p1;
    let c1 = m1;
    let c2 = p1 * -3.0 + p2 * 3.0 - m1 * 2.0 - m2;
    let c3 = p1 * 2.0 - p2 * 2.0 + m1 + m2;
    c0 + c1 * w + c2 * (w * w) + c3 * (w * w * w)
}

/// One flow path: its input control points and the resampled spline used at
/// runtime.
#[derive(Debug, Clone)]
pub struct Curve {
    control: Vec<Vec3>,
    path: CatmullRom,
    length: f32,
}

impl Curve {
    pub fn new(control: Vec<Vec3>, resample_points: usize) -> Self {
        let source = CatmullRom::new(control.clone());
        let path = CatmullRom::new(source.spaced_points(resample_points));
        let length = path.length();
        Self {
            control,
            path,
            length,
        }
    }

    pub fn control_points(&self) -> &[Vec3] {
        &self.control
    }

    pub fn resampled(&self) -> &[Vec3] {
        self.path.points()
    }

    pub fn length(&self) -> f32 {
        self.length
    }

    pub fn point_at(&self, t: f32) -> Vec3 {
        self.path.point(t)
    }
}

#[derive(Debug, Deserialize)]
struct PathsFile {
    paths: Vec<Vec<[f32; 3]>>,
}

/// The full, index-stable set of curves.
#[derive(Debug, Clone)]
pub struct CurveSet {
    curves: Vec<Curve>,
}

impl CurveSet {
    pub fn from_paths(paths: &[Vec<[f32; 3]>], resample_points: usize) -> Result<Self> {
        if paths.is_empty() {
            return Err(PulseError::EmptyCurveSet);
        }

        let mut curves = Vec::with_capacity(paths.len());
        for (index, path) in paths.iter().enumerate() {
            if path.len() < 2 {
                return Err(PulseError::DegenerateCurve {
                    index,
                    points: path.len(),
                });
            }
            if path.iter().flatten().any(|c| !c.is_finite()) {
                return Err(PulseError::NonFiniteCurve { index });
            }
            let control = path.iter().map(|&p| Vec3::from_array(p)).collect();
            curves.push(Curve::new(control, resample_points));
        }

        Ok(Self { curves })
    }

    /// Parse `{ "paths": [[[x, y, z], ...], ...] }`.
    pub fn from_json(json: &str, resample_points: usize) -> Result<Self> {
        let file: PathsFile = serde_json::from_str(json)?;
        Self::from_paths(&file.paths, resample_points)
    }

    pub fn load(path: &Path, resample_points: usize) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|source| PulseError::GeometryIo {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&json, resample_points)
    }

    pub fn len(&self) -> usize {
        self.curves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.curves.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Curve> {
        self.curves.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Curve> {
        self.curves.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: Vec3, b: Vec3) -> bool {
        a.distance(b) < 1e-4
    }

    #[test]
    fn spline_passes_through_control_points() {
        let points = vec![
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.5, 0.0),
            Vec3::new(2.0, 0.0, 1.0),
            Vec3::new(3.0, 1.0, 1.0),
        ];
        let spline = CatmullRom::new(points.clone());
        assert!(approx(spline.point(0.0), points[0]));
        assert!(approx(spline.point(1.0 / 3.0), points[1]));
        assert!(approx(spline.point(2.0 / 3.0), points[2]));
        assert!(approx(spline.point(1.0), points[3]));
    }

    #[test]
    fn straight_line_resamples_evenly() {
        // Uneven control spacing on a straight line.
        let spline = CatmullRom::new(vec![
            Vec3::ZERO,
            Vec3::new(0.1, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
        ]);
        let points = spline.spaced_points(11);
        assert_eq!(points.len(), 11);
        for pair in points.windows(2) {
            let step = pair[0].distance(pair[1]);
            assert!((step - 0.1).abs() < 0.01, "uneven step {step}");
        }
        assert!((spline.length() - 1.0).abs() < 1e-3);
    }

    #[test]
    fn parameter_is_clamped() {
        let spline = CatmullRom::new(vec![Vec3::ZERO, Vec3::X]);
        assert!(approx(spline.point(-0.5), Vec3::ZERO));
        assert!(approx(spline.point(2.0), Vec3::X));
    }

    #[test]
    fn curve_keeps_resample_count() {
        let curve = Curve::new(vec![Vec3::ZERO, Vec3::Y, Vec3::new(1.0, 1.0, 0.0)], 64);
        assert_eq!(curve.resampled().len(), 64);
        assert_eq!(curve.control_points().len(), 3);
        assert!((1.5..2.5).contains(&curve.length()));
    }

    #[test]
    fn empty_set_is_fatal() {
        assert!(matches!(
            CurveSet::from_paths(&[], 64),
            Err(PulseError::EmptyCurveSet)
        ));
    }

    #[test]
    fn single_point_curve_is_fatal() {
        let paths = vec![vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0]], vec![[0.0, 0.0, 0.0]]];
        assert!(matches!(
            CurveSet::from_paths(&paths, 64),
            Err(PulseError::DegenerateCurve { index: 1, points: 1 })
        ));
    }

    #[test]
    fn malformed_json_is_fatal() {
        assert!(matches!(
            CurveSet::from_json("{\"paths\": 3}", 64),
            Err(PulseError::GeometryFormat(_))
        ));
    }

    #[test]
    fn json_round_trips_indices() {
        let json = r#"{"paths": [[[0,0,0],[1,0,0]], [[0,1,0],[0,2,0],[0,3,0]]]}"#;
        let set = CurveSet::from_json(json, 16).unwrap();
        assert_eq!(set.len(), 2);
        let second = set.get(1).unwrap();
        assert!(approx(second.point_at(0.0), Vec3::new(0.0, 1.0, 0.0)));
        assert!(approx(second.point_at(1.0), Vec3::new(0.0, 3.0, 0.0)));
    }
}

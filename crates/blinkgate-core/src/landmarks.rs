//! Facial landmark geometry and the eye aspect ratio (EAR).
//!
//! The EAR of an eye is the mean of its two vertical eyelid separations
//! divided by its horizontal corner-to-corner width. An open eye sits around
//! 0.25–0.35; a closed eye collapses towards zero while the width stays put,
//! which makes the ratio insensitive to how far the subject is from the
//! camera.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A 2D landmark position in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance(self, other: Point) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }
}

/// Six-point eye contour.
///
/// Index layout: `0` outer corner, `1`/`2` upper lid, `3` inner corner,
/// `4`/`5` lower lid. Point `1` pairs vertically with `5`, `2` with `4`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EyeLandmarks {
    pub points: [Point; 6],
}

impl EyeLandmarks {
    pub const fn new(points: [Point; 6]) -> Self {
        Self { points }
    }

    /// Build an eye contour of the given `width` whose aspect ratio is `ear`,
    /// with its outer corner at `origin`.
    pub fn with_aspect_ratio(origin: Point, width: f32, ear: f32) -> Self {
        let half_open = ear * width / 2.0;
        let Point { x, y } = origin;
        Self::new([
            Point::new(x, y),
            Point::new(x + width / 3.0, y - half_open),
            Point::new(x + 2.0 * width / 3.0, y - half_open),
            Point::new(x + width, y),
            Point::new(x + 2.0 * width / 3.0, y + half_open),
            Point::new(x + width / 3.0, y + half_open),
        ])
    }

    /// Eye aspect ratio, or `None` when the corners coincide.
    pub fn aspect_ratio(&self) -> Option<f32> {
        eye_aspect_ratio(self)
    }
}

/// One detected face in one frame. Produced per detection call, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceLandmarks {
    pub left_eye: EyeLandmarks,
    pub right_eye: EyeLandmarks,
    /// Detector confidence in `[0, 1]`.
    pub confidence: f32,
    /// Capture time of the frame the landmarks were detected in.
    pub timestamp: Duration,
}

/// First index of the left eye in the 68-point iBUG layout.
const IBUG68_LEFT_EYE: usize = 36;
/// First index of the right eye in the 68-point iBUG layout.
const IBUG68_RIGHT_EYE: usize = 42;

impl FaceLandmarks {
    pub fn new(left_eye: EyeLandmarks, right_eye: EyeLandmarks) -> Self {
        Self {
            left_eye,
            right_eye,
            confidence: 1.0,
            timestamp: Duration::ZERO,
        }
    }

    /// Extract both eyes from a 68-point landmark set.
    ///
    /// Returns `None` unless exactly 68 points are given.
    pub fn from_ibug68(points: &[Point], confidence: f32, timestamp: Duration) -> Option<Self> {
        if points.len() != 68 {
            return None;
        }
        let eye = |start: usize| {
            let mut contour = [Point::default(); 6];
            contour.copy_from_slice(&points[start..start + 6]);
            EyeLandmarks::new(contour)
        };
        Some(Self {
            left_eye: eye(IBUG68_LEFT_EYE),
            right_eye: eye(IBUG68_RIGHT_EYE),
            confidence,
            timestamp,
        })
    }

    /// Mean EAR of both eyes. `None` if either eye is degenerate.
    pub fn mean_aspect_ratio(&self) -> Option<f32> {
        let left = eye_aspect_ratio(&self.left_eye)?;
        let right = eye_aspect_ratio(&self.right_eye)?;
        Some((left + right) / 2.0)
    }
}

/// `(|p1-p5| + |p2-p4|) / (2 * |p0-p3|)` over the zero-based contour.
pub fn eye_aspect_ratio(eye: &EyeLandmarks) -> Option<f32> {
    let p = &eye.points;
    let vertical_a = p[1].distance(p[5]);
    let vertical_b = p[2].distance(p[4]);
    let horizontal = p[0].distance(p[3]);

    if horizontal <= f32::EPSILON {
        return None;
    }

    let ear = (vertical_a + vertical_b) / (2.0 * horizontal);
    ear.is_finite().then_some(ear)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_geometry() {
        // width 10, verticals 3 and 5 -> (3 + 5) / 20 = 0.4
        let eye = EyeLandmarks::new([
            Point::new(0.0, 0.0),
            Point::new(3.0, -1.5),
            Point::new(7.0, -2.5),
            Point::new(10.0, 0.0),
            Point::new(7.0, 2.5),
            Point::new(3.0, 1.5),
        ]);
        let ear = eye_aspect_ratio(&eye).unwrap();
        assert!((ear - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_synthetic_eye_roundtrips_ratio() {
        for ear in [0.05f32, 0.12, 0.2, 0.25, 0.31] {
            let eye = EyeLandmarks::with_aspect_ratio(Point::new(120.0, 80.0), 30.0, ear);
            let measured = eye.aspect_ratio().unwrap();
            assert!((measured - ear).abs() < 1e-5, "{ear} vs {measured}");
        }
    }

    #[test]
    fn test_degenerate_eye_has_no_ratio() {
        let eye = EyeLandmarks::new([Point::new(5.0, 5.0); 6]);
        assert_eq!(eye_aspect_ratio(&eye), None);
    }

    #[test]
    fn test_mean_of_both_eyes() {
        let face = FaceLandmarks::new(
            EyeLandmarks::with_aspect_ratio(Point::new(0.0, 0.0), 20.0, 0.2),
            EyeLandmarks::with_aspect_ratio(Point::new(40.0, 0.0), 20.0, 0.3),
        );
        let mean = face.mean_aspect_ratio().unwrap();
        assert!((mean - 0.25).abs() < 1e-5);
    }

    #[test]
    fn test_mean_none_if_one_eye_degenerate() {
        let face = FaceLandmarks::new(
            EyeLandmarks::with_aspect_ratio(Point::new(0.0, 0.0), 20.0, 0.2),
            EyeLandmarks::new([Point::default(); 6]),
        );
        assert_eq!(face.mean_aspect_ratio(), None);
    }

    #[test]
    fn test_from_ibug68_picks_eye_ranges() {
        let mut points = vec![Point::default(); 68];
        let left = EyeLandmarks::with_aspect_ratio(Point::new(10.0, 10.0), 12.0, 0.3);
        let right = EyeLandmarks::with_aspect_ratio(Point::new(40.0, 10.0), 12.0, 0.1);
        points[36..42].copy_from_slice(&left.points);
        points[42..48].copy_from_slice(&right.points);

        let face = FaceLandmarks::from_ibug68(&points, 0.9, Duration::from_millis(33)).unwrap();
        assert_eq!(face.left_eye, left);
        assert_eq!(face.right_eye, right);
        assert_eq!(face.timestamp, Duration::from_millis(33));
        assert!((face.mean_aspect_ratio().unwrap() - 0.2).abs() < 1e-5);
    }

    #[test]
    fn test_from_ibug68_rejects_other_topologies() {
        assert!(FaceLandmarks::from_ibug68(&[Point::default(); 5], 1.0, Duration::ZERO).is_none());
        assert!(FaceLandmarks::from_ibug68(&[Point::default(); 98], 1.0, Duration::ZERO).is_none());
    }
}

// THEORY:
// The `landmarks` module is the geometric vocabulary of the face. A landmark model
// returns 68 image-space points in the standard iBUG layout; this module knows which
// of those points bound each eye, which ones anchor the head-pose fit, and how to
// turn an eye's six points into an Eye Aspect Ratio (EAR).
//
// EAR for one eye, with p1..p6 its six landmarks in layout order:
//
//     EAR = (|p2 - p6| + |p3 - p5|) / (2 * |p1 - p4|)
//
// An open eye sits around 0.3; a closed eye approaches zero. The two eyes are
// averaged.

use serde::Serialize;

use crate::error::DetectorError;

/// Number of points in the iBUG 68-point facial layout.
pub const LANDMARK_COUNT: usize = 68;

/// Layout indices used by the engine.
pub mod layout {
    use std::ops::Range;

    /// Six points around the subject's right eye (left in the image).
    pub const LEFT_EYE: Range<usize> = 36..42;
    /// Six points around the subject's left eye (right in the image).
    pub const RIGHT_EYE: Range<usize> = 42..48;

    pub const NOSE_TIP: usize = 30;
    pub const CHIN: usize = 8;
    pub const LEFT_EYE_OUTER_CORNER: usize = 36;
    pub const RIGHT_EYE_OUTER_CORNER: usize = 45;
    pub const LEFT_MOUTH_CORNER: usize = 48;
    pub const RIGHT_MOUTH_CORNER: usize = 54;

    /// The six points matched against the canonical 3-D face model, in model order.
    pub const POSE_POINTS: [usize; 6] = [
        NOSE_TIP,
        CHIN,
        LEFT_EYE_OUTER_CORNER,
        RIGHT_EYE_OUTER_CORNER,
        LEFT_MOUTH_CORNER,
        RIGHT_MOUTH_CORNER,
    ];
}

/// A point in image space, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Point2 {
    pub x: f64,
    pub y: f64,
}

impl Point2 {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point2) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// An axis-aligned face or eye region reported by a detector, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FaceBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl FaceBox {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// The largest box by area. Earlier boxes win ties.
    pub fn largest(boxes: &[FaceBox]) -> Option<FaceBox> {
        boxes
            .iter()
            .copied()
            .reduce(|best, candidate| if candidate.area() > best.area() { candidate } else { best })
    }

    /// This box clipped to an image of the given size, or `None` when nothing is left.
    pub fn clamp_to(&self, image_width: u32, image_height: u32) -> Option<FaceBox> {
        if self.x >= image_width || self.y >= image_height {
            return None;
        }
        let width = self.width.min(image_width - self.x);
        let height = self.height.min(image_height - self.y);
        (width > 0 && height > 0).then_some(FaceBox::new(self.x, self.y, width, height))
    }
}

/// A full set of 68 facial landmarks for one face.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceLandmarks {
    points: Vec<Point2>,
}

impl FaceLandmarks {
    pub fn new(points: Vec<Point2>) -> Result<Self, DetectorError> {
        if points.len() != LANDMARK_COUNT {
            return Err(DetectorError::MissingLandmarks {
                expected: LANDMARK_COUNT,
                found: points.len(),
            });
        }
        if points.iter().any(|p| !p.x.is_finite() || !p.y.is_finite()) {
            return Err(DetectorError::DegenerateGeometry("non-finite landmark coordinate"));
        }
        Ok(Self { points })
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn left_eye(&self) -> [Point2; 6] {
        self.eye(layout::LEFT_EYE.start)
    }

    pub fn right_eye(&self) -> [Point2; 6] {
        self.eye(layout::RIGHT_EYE.start)
    }

    fn eye(&self, start: usize) -> [Point2; 6] {
        std::array::from_fn(|i| self.points[start + i])
    }

    /// Image points matching the canonical head model, in model order.
    pub fn pose_points(&self) -> [Point2; 6] {
        layout::POSE_POINTS.map(|index| self.points[index])
    }

    /// Average EAR of both eyes.
    pub fn eye_aspect_ratio(&self) -> Result<f64, DetectorError> {
        let left = eye_aspect_ratio(&self.left_eye())?;
        let right = eye_aspect_ratio(&self.right_eye())?;
        Ok((left + right) / 2.0)
    }
}

/// EAR of a single eye given its six landmarks in layout order.
pub fn eye_aspect_ratio(eye: &[Point2; 6]) -> Result<f64, DetectorError> {
    let vertical_a = eye[1].distance(&eye[5]);
    let vertical_b = eye[2].distance(&eye[4]);
    let horizontal = eye[0].distance(&eye[3]);

    if horizontal < 1e-6 {
        return Err(DetectorError::DegenerateGeometry("eye corners coincide"));
    }

    Ok((vertical_a + vertical_b) / (2.0 * horizontal))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// An eye 30px wide whose lids are `gap` px apart, starting at (x, y).
    fn synthetic_eye(x: f64, y: f64, gap: f64) -> [Point2; 6] {
        let half = gap / 2.0;
        [
            Point2::new(x, y),
            Point2::new(x + 10.0, y - half),
            Point2::new(x + 20.0, y - half),
            Point2::new(x + 30.0, y),
            Point2::new(x + 20.0, y + half),
            Point2::new(x + 10.0, y + half),
        ]
    }

    #[test]
    fn near_closed_eye_reads_below_sleep_threshold() {
        let eye = synthetic_eye(100.0, 100.0, 2.0);
        let ear = eye_aspect_ratio(&eye).unwrap();
        assert!(ear < 0.20, "ear was {ear}");
        assert!((ear - 2.0 / 30.0).abs() < 1e-9);
    }

    #[test]
    fn open_eye_reads_above_drowsy_threshold() {
        let eye = synthetic_eye(0.0, 0.0, 10.0);
        let ear = eye_aspect_ratio(&eye).unwrap();
        assert!((ear - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn coincident_corners_are_degenerate() {
        let eye = [Point2::new(5.0, 5.0); 6];
        assert!(matches!(
            eye_aspect_ratio(&eye),
            Err(DetectorError::DegenerateGeometry(_))
        ));
    }

    #[test]
    fn landmark_set_requires_all_points() {
        let err = FaceLandmarks::new(vec![Point2::default(); 5]).unwrap_err();
        assert!(matches!(
            err,
            DetectorError::MissingLandmarks { expected: 68, found: 5 }
        ));
    }

    #[test]
    fn face_ear_averages_both_eyes() {
        let mut points = vec![Point2::default(); LANDMARK_COUNT];
        points[layout::LEFT_EYE].copy_from_slice(&synthetic_eye(0.0, 0.0, 6.0));
        points[layout::RIGHT_EYE].copy_from_slice(&synthetic_eye(60.0, 0.0, 12.0));
        let face = FaceLandmarks::new(points).unwrap();
        let ear = face.eye_aspect_ratio().unwrap();
        assert!((ear - (0.2 + 0.4) / 2.0).abs() < 1e-9);
    }

    #[test]
    fn largest_box_wins_and_ties_keep_first() {
        let boxes = [
            FaceBox::new(0, 0, 10, 10),
            FaceBox::new(5, 5, 20, 5),
            FaceBox::new(9, 9, 12, 12),
        ];
        assert_eq!(FaceBox::largest(&boxes), Some(FaceBox::new(9, 9, 12, 12)));
        assert_eq!(FaceBox::largest(&[]), None);
        let tied = [FaceBox::new(0, 0, 4, 4), FaceBox::new(1, 1, 2, 8)];
        assert_eq!(FaceBox::largest(&tied), Some(FaceBox::new(0, 0, 4, 4)));
    }

    #[test]
    fn clamp_trims_box_to_image() {
        let face = FaceBox::new(90, 90, 30, 30);
        assert_eq!(face.clamp_to(100, 100), Some(FaceBox::new(90, 90, 10, 10)));
        assert_eq!(face.clamp_to(50, 50), None);
    }
}

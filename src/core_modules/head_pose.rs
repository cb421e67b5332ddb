// THEORY:
// Head pose is recovered with a perspective-n-point fit: six points of a canonical
// 3-D face model are matched against their 2-D landmark positions, and the rigid
// motion (rotation + translation) that best reprojects the model onto the image is
// found by Levenberg-Marquardt over a 6-vector (axis-angle rotation, translation).
//
// Key architectural principles:
// 1.  **Pinhole Camera, No Calibration**: The focal length is the working image width,
//     the principal point is the image center, and there is no lens distortion. Good
//     enough for relative angles on a single photo.
// 2.  **Frontal Reference**: The model is stored in camera convention (x right, y down,
//     z away from the camera), so a face squarely facing the lens has the identity
//     rotation and reads as pitch = yaw = roll = 0.
// 3.  **Small and Fixed-Size**: Everything lives in `nalgebra` stack matrices. Twelve
//     residuals, six unknowns, a numeric Jacobian. No allocation in the solver loop.

use nalgebra::{Rotation3, SMatrix, SVector, Vector3};

use crate::core_modules::landmarks::Point2;
use crate::core_modules::verdict::HeadPose;
use crate::error::DetectorError;

type Params = SVector<f64, 6>;
type Residuals = SVector<f64, 12>;
type Jacobian = SMatrix<f64, 12, 6>;

/// Canonical face model (nose tip, chin, outer eye corners, mouth corners) in
/// anthropometric units, already flipped into camera convention.
const REFERENCE_FACE: [[f64; 3]; 6] = [
    [0.0, 0.0, 0.0],
    [0.0, 330.0, 65.0],
    [-225.0, -170.0, 135.0],
    [225.0, -170.0, 135.0],
    [-150.0, 150.0, 125.0],
    [150.0, 150.0, 125.0],
];

const MAX_ITERATIONS: usize = 200;
const JACOBIAN_STEP: f64 = 1e-6;
const CONVERGENCE_STEP: f64 = 1e-10;
/// An RMS reprojection error above this many pixels means the landmarks do not look like a face.
const MAX_REPROJECTION_ERROR_PX: f64 = 50.0;

/// Pinhole intrinsics of the virtual camera.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraIntrinsics {
    pub focal_length: f64,
    pub cx: f64,
    pub cy: f64,
}

impl CameraIntrinsics {
    pub fn for_image(width: u32, height: u32) -> Self {
        Self {
            focal_length: width as f64,
            cx: width as f64 / 2.0,
            cy: height as f64 / 2.0,
        }
    }

    fn project(&self, point: &Vector3<f64>) -> Option<Point2> {
        if point.z <= f64::EPSILON {
            return None;
        }
        Some(Point2::new(
            self.focal_length * point.x / point.z + self.cx,
            self.focal_length * point.y / point.z + self.cy,
        ))
    }
}

/// Renders the reference face under a pose. The inverse of `estimate_head_pose`.
pub fn project_reference_face(
    rotation: &Rotation3<f64>,
    translation: &Vector3<f64>,
    camera: &CameraIntrinsics,
) -> Option<[Point2; 6]> {
    let mut projected = [Point2::default(); 6];
    for (slot, model) in projected.iter_mut().zip(REFERENCE_FACE.iter()) {
        let world = rotation * Vector3::from(*model) + translation;
        *slot = camera.project(&world)?;
    }
    Some(projected)
}

/// Fits the reference face to six image points (nose, chin, eye corners, mouth corners,
/// in that order) and returns the head orientation in degrees.
pub fn estimate_head_pose(
    image_points: &[Point2; 6],
    camera: &CameraIntrinsics,
) -> Result<HeadPose, DetectorError> {
    let mut params = initial_guess(image_points, camera)?;
    let mut current = residuals(&params, image_points, camera)
        .ok_or(DetectorError::DegenerateGeometry("initial pose places face behind camera"))?;
    let mut cost = current.norm_squared();
    let mut damping = 1e-3;

    for _ in 0..MAX_ITERATIONS {
        let jacobian = numeric_jacobian(&params, &current, image_points, camera)
            .ok_or(DetectorError::DegenerateGeometry("pose jacobian left the image plane"))?;
        let jt = jacobian.transpose();
        let normal = jt * jacobian;
        let gradient = jt * current;

        let mut augmented = normal;
        for i in 0..6 {
            augmented[(i, i)] += damping * normal[(i, i)].max(1e-12);
        }
        let Some(step) = augmented.cholesky().map(|c| c.solve(&(-gradient))) else {
            damping *= 10.0;
            continue;
        };

        let candidate = params + step;
        match residuals_if_better(&candidate, image_points, camera, cost) {
            Some((next_residuals, next_cost)) => {
                params = candidate;
                current = next_residuals;
                cost = next_cost;
                damping = (damping / 10.0).max(1e-12);
            }
            None => damping *= 10.0,
        }

        if step.norm() < CONVERGENCE_STEP || damping > 1e12 {
            break;
        }
    }

    let rms = (cost / image_points.len() as f64).sqrt();
    if !rms.is_finite() || rms > MAX_REPROJECTION_ERROR_PX {
        return Err(DetectorError::PoseDidNotConverge(rms));
    }

    let rotation = Rotation3::new(Vector3::new(params[0], params[1], params[2]));
    let (about_x, about_y, about_z) = rotation.euler_angles();
    Ok(HeadPose {
        pitch: about_x.to_degrees(),
        yaw: about_y.to_degrees(),
        roll: about_z.to_degrees(),
    })
}

/// Identity rotation, with depth taken from the ratio of model spread to image spread.
fn initial_guess(image_points: &[Point2; 6], camera: &CameraIntrinsics) -> Result<Params, DetectorError> {
    let image_centroid = image_points.iter().fold(Point2::default(), |acc, p| {
        Point2::new(acc.x + p.x / 6.0, acc.y + p.y / 6.0)
    });
    let model_centroid = REFERENCE_FACE
        .iter()
        .map(|p| Vector3::from(*p))
        .sum::<Vector3<f64>>()
        / 6.0;

    let image_spread: f64 = image_points
        .iter()
        .map(|p| p.distance(&image_centroid))
        .sum();
    let model_spread: f64 = REFERENCE_FACE
        .iter()
        .map(|p| (p[0] - model_centroid.x).hypot(p[1] - model_centroid.y))
        .sum();

    if image_spread < 1e-6 {
        return Err(DetectorError::DegenerateGeometry("pose landmarks coincide"));
    }

    let depth = camera.focal_length * model_spread / image_spread;
    let tx = (image_centroid.x - camera.cx) * depth / camera.focal_length - model_centroid.x;
    let ty = (image_centroid.y - camera.cy) * depth / camera.focal_length - model_centroid.y;
    let tz = depth - model_centroid.z;

    Ok(Params::from([0.0, 0.0, 0.0, tx, ty, tz]))
}

fn residuals(params: &Params, image_points: &[Point2; 6], camera: &CameraIntrinsics) -> Option<Residuals> {
    let rotation = Rotation3::new(Vector3::new(params[0], params[1], params[2]));
    let translation = Vector3::new(params[3], params[4], params[5]);
    let projected = project_reference_face(&rotation, &translation, camera)?;

    let mut out = Residuals::zeros();
    for (i, (p, observed)) in projected.iter().zip(image_points.iter()).enumerate() {
        out[2 * i] = p.x - observed.x;
        out[2 * i + 1] = p.y - observed.y;
    }
    Some(out)
}

fn residuals_if_better(
    candidate: &Params,
    image_points: &[Point2; 6],
    camera: &CameraIntrinsics,
    current_cost: f64,
) -> Option<(Residuals, f64)> {
    let next = residuals(candidate, image_points, camera)?;
    let cost = next.norm_squared();
    (cost.is_finite() && cost < current_cost).then_some((next, cost))
}

fn numeric_jacobian(
    params: &Params,
    base: &Residuals,
    image_points: &[Point2; 6],
    camera: &CameraIntrinsics,
) -> Option<Jacobian> {
    let mut jacobian = Jacobian::zeros();
    for j in 0..6 {
        let mut shifted = *params;
        shifted[j] += JACOBIAN_STEP;
        let moved = residuals(&shifted, image_points, camera)?;
        jacobian.set_column(j, &((moved - base) / JACOBIAN_STEP));
    }
    Some(jacobian)
}

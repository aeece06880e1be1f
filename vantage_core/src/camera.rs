//! Camera pose, projection and the camera snapshot.

use crate::bias::Bias;
use crate::config::Viewport;
use crate::math::Vec3;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Camera location, rotation and field of view.
///
/// Rotation is `(pitch, yaw, roll)` in degrees with X forward, Y right and
/// Z up, which is how the source stores it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraPose {
    pub location: Vec3,
    pub rotation: Vec3,
    pub fov_deg: f32,
}

/// A projected point in pixels, with view depth.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScreenPoint {
    pub x: f32,
    pub y: f32,
    pub depth: f32,
}

impl ScreenPoint {
    /// Pixel distance to another point.
    pub fn distance(&self, other: &ScreenPoint) -> f32 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }

    /// Returns true if the point lies inside the viewport.
    pub fn on_screen(&self, viewport: &Viewport) -> bool {
        self.x >= 0.0 && self.y >= 0.0 && self.x <= viewport.width && self.y <= viewport.height
    }
}

impl Default for CameraPose {
    fn default() -> Self {
        Self {
            location: Vec3::zeros(),
            rotation: Vec3::zeros(),
            fov_deg: 90.0,
        }
    }
}

impl CameraPose {
    /// Points closer than this to the camera plane are not projected.
    const NEAR_PLANE: f32 = 1.0;

    /// Returns the `(forward, right, up)` basis.
    pub fn axes(&self) -> (Vec3, Vec3, Vec3) {
        let (sp, cp) = self.rotation.x.to_radians().sin_cos();
        let (sy, cy) = self.rotation.y.to_radians().sin_cos();
        let (sr, cr) = self.rotation.z.to_radians().sin_cos();

        let forward = Vec3::new(cp * cy, cp * sy, sp);
        let right = Vec3::new(sr * sp * cy - cr * sy, sr * sp * sy + cr * cy, -sr * cp);
        let up = Vec3::new(-(cr * sp * cy + sr * sy), cy * sr - cr * sp * sy, cr * cp);
        (forward, right, up)
    }

    /// Projects a world point to pixels; `None` when behind the camera.
    pub fn project(&self, world: &Vec3, viewport: &Viewport) -> Option<ScreenPoint> {
        let (forward, right, up) = self.axes();
        let delta = world - self.location;

        let depth = delta.dot(&forward);
        if depth < Self::NEAR_PLANE {
            return None;
        }

        let half_w = viewport.width / 2.0;
        let half_h = viewport.height / 2.0;
        let fov = self.fov_deg.clamp(1.0, 170.0).to_radians();
        let focal = half_w / (fov / 2.0).tan();

        Some(ScreenPoint {
            x: half_w + delta.dot(&right) * focal / depth,
            y: half_h - delta.dot(&up) * focal / depth,
            depth,
        })
    }

    /// Straight-line distance from the camera.
    pub fn distance_to(&self, world: &Vec3) -> f32 {
        (world - self.location).norm()
    }
}

/// Latest camera state, published by the camera worker.
///
/// `pose.location` and `local_view` already include `bias` and stay valid
/// across later rebases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraSnapshot {
    pub pose: CameraPose,
    pub local_view: Option<Vec3>,
    pub bias: Bias,
    pub captured_at: Duration,

    /// Zero until the first successful camera read
    pub sequence: u64,
}

impl CameraSnapshot {
    /// The placeholder published before the first camera read.
    pub fn empty() -> Self {
        Self {
            pose: CameraPose::default(),
            local_view: None,
            bias: Bias::zero(),
            captured_at: Duration::ZERO,
            sequence: 0,
        }
    }

    /// Returns true once a real camera read has landed.
    pub fn is_ready(&self) -> bool {
        self.sequence > 0
    }
}

impl Default for CameraSnapshot {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn forward_camera() -> CameraPose {
        CameraPose {
            location: Vec3::zeros(),
            rotation: Vec3::zeros(),
            fov_deg: 90.0,
        }
    }

    #[test]
    fn test_point_ahead_projects_to_center() {
        let viewport = Viewport::default();
        let p = forward_camera()
            .project(&Vec3::new(1000.0, 0.0, 0.0), &viewport)
            .unwrap();

        assert_relative_eq!(p.x, 960.0, epsilon = 1e-3);
        assert_relative_eq!(p.y, 540.0, epsilon = 1e-3);
        assert_relative_eq!(p.depth, 1000.0, epsilon = 1e-3);
        assert!(p.on_screen(&viewport));
    }

    #[test]
    fn test_right_and_up_offsets() {
        let viewport = Viewport::default();
        let cam = forward_camera();
        let right = cam.project(&Vec3::new(1000.0, 100.0, 0.0), &viewport).unwrap();
        let up = cam.project(&Vec3::new(1000.0, 0.0, 100.0), &viewport).unwrap();

        assert!(right.x > 960.0);
        assert!(up.y < 540.0);
        // 90° fov: focal = half width
        assert_relative_eq!(right.x, 960.0 + 96.0, epsilon = 1e-2);
    }

    #[test]
    fn test_point_behind_is_not_projected() {
        let viewport = Viewport::default();
        assert!(forward_camera()
            .project(&Vec3::new(-10.0, 0.0, 0.0), &viewport)
            .is_none());
    }

    #[test]
    fn test_yaw_rotates_forward_axis() {
        let cam = CameraPose {
            rotation: Vec3::new(0.0, 90.0, 0.0),
            ..forward_camera()
        };
        let (forward, _, _) = cam.axes();
        assert_relative_eq!(forward, Vec3::new(0.0, 1.0, 0.0), epsilon = 1e-5);
    }
}

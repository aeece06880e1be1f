//! Small math layer over nalgebra for source transforms.

use nalgebra::{Quaternion, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use vantage_env::RawTransform;

/// World-space vector type used throughout the engine.
pub type Vec3 = Vector3<f32>;

/// Converts a packed `[x, y, z]` into a [`Vec3`].
#[inline]
pub fn vec3(v: [f32; 3]) -> Vec3 {
    Vec3::new(v[0], v[1], v[2])
}

/// A rotation + translation + non-uniform scale transform.
///
/// Matches the source's component-to-world layout: points are scaled,
/// then rotated, then translated.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorldTransform {
    pub rotation: UnitQuaternion<f32>,
    pub translation: Vec3,
    pub scale: Vec3,
}

impl WorldTransform {
    /// The identity transform.
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vec3::zeros(),
            scale: Vec3::new(1.0, 1.0, 1.0),
        }
    }

    /// A pure translation.
    pub fn from_translation(translation: Vec3) -> Self {
        Self {
            translation,
            ..Self::identity()
        }
    }

    /// Decodes a raw source transform.
    ///
    /// Returns `None` for degenerate quaternions or non-finite components,
    /// which the source produces while a component is being torn down.
    pub fn from_raw(raw: &RawTransform) -> Option<Self> {
        let all_finite = raw
            .rotation
            .iter()
            .chain(raw.translation.iter())
            .chain(raw.scale.iter())
            .all(|c| c.is_finite());
        if !all_finite {
            return None;
        }

        let [x, y, z, w] = raw.rotation;
        let q = Quaternion::new(w, x, y, z);
        if q.norm() < 1e-6 {
            return None;
        }

        Some(Self {
            rotation: UnitQuaternion::from_quaternion(q),
            translation: vec3(raw.translation),
            scale: vec3(raw.scale),
        })
    }

    /// Transforms a component-space point into world space.
    #[inline]
    pub fn transform_point(&self, local: &Vec3) -> Vec3 {
        self.rotation * local.component_mul(&self.scale) + self.translation
    }

    /// Returns this transform shifted by `delta`.
    #[inline]
    pub fn translated(&self, delta: &Vec3) -> Self {
        Self {
            translation: self.translation + delta,
            ..*self
        }
    }
}

impl Default for WorldTransform {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_transform_point_scale_rotate_translate() {
        // 90° about Z: +X -> +Y
        let half = std::f32::consts::FRAC_PI_4;
        let raw = RawTransform {
            rotation: [0.0, 0.0, half.sin(), half.cos()],
            translation: [10.0, 0.0, 0.0],
            scale: [2.0, 2.0, 2.0],
        };
        let t = WorldTransform::from_raw(&raw).unwrap();
        let p = t.transform_point(&Vec3::new(1.0, 0.0, 0.0));

        assert_relative_eq!(p.x, 10.0, epsilon = 1e-4);
        assert_relative_eq!(p.y, 2.0, epsilon = 1e-4);
        assert_relative_eq!(p.z, 0.0, epsilon = 1e-4);
    }

    #[test]
    fn test_degenerate_transform_rejected() {
        let zero_rot = RawTransform {
            rotation: [0.0; 4],
            ..RawTransform::IDENTITY
        };
        assert!(WorldTransform::from_raw(&zero_rot).is_none());

        let nan = RawTransform {
            translation: [f32::NAN, 0.0, 0.0],
            ..RawTransform::IDENTITY
        };
        assert!(WorldTransform::from_raw(&nan).is_none());
    }
}

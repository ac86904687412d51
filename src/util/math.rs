//! Math type re-exports and the row-major 3x4 transform used on the device.
//!
//! Host-side math goes through `glam`. Device buffers store transforms as
//! [`Mat3x4f`], a plain 48-byte row-major matrix with the translation in the
//! last column, so the same bytes can be handed to kernels unchanged.

// Re-export glam types
pub use glam::{Affine3A, Mat3, Mat3A, Quat, Vec2, Vec3, Vec3A, Vec4};

use bytemuck::{Pod, Zeroable};
use std::fmt;
use std::ops::Mul;

/// Row-major 3x4 affine transform (rotation/scale in the first three
/// columns, translation in the fourth).
///
/// A ray is encoded as a `Mat3x4f`: its origin is the translation and its
/// direction is the transformed +Z axis.
#[derive(Clone, Copy, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct Mat3x4f {
    pub rc: [[f32; 4]; 3],
}

impl Mat3x4f {
    pub const IDENTITY: Self = Self {
        rc: [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
        ],
    };

    /// Build from a glam affine transform.
    pub fn from_affine(a: &Affine3A) -> Self {
        let m = a.matrix3;
        let t = a.translation;
        Self {
            rc: [
                [m.x_axis.x, m.y_axis.x, m.z_axis.x, t.x],
                [m.x_axis.y, m.y_axis.y, m.z_axis.y, t.y],
                [m.x_axis.z, m.y_axis.z, m.z_axis.z, t.z],
            ],
        }
    }

    /// Convert to a glam affine transform.
    pub fn to_affine(&self) -> Affine3A {
        let r = &self.rc;
        Affine3A::from_cols(
            Vec3A::new(r[0][0], r[1][0], r[2][0]),
            Vec3A::new(r[0][1], r[1][1], r[2][1]),
            Vec3A::new(r[0][2], r[1][2], r[2][2]),
            Vec3A::new(r[0][3], r[1][3], r[2][3]),
        )
    }

    /// Pure translation.
    pub fn from_translation(t: Vec3) -> Self {
        Self::from_affine(&Affine3A::from_translation(t))
    }

    /// Rotation of `angle` radians around `axis` (need not be normalized).
    pub fn from_axis_angle(axis: Vec3, angle: f32) -> Self {
        Self::from_affine(&Affine3A::from_axis_angle(axis.normalize(), angle))
    }

    /// Rotation from Euler angles in radians, applied X then Y then Z.
    pub fn from_rotation_xyz(x: f32, y: f32, z: f32) -> Self {
        Self::from_affine(&Affine3A::from_quat(Quat::from_euler(
            glam::EulerRot::ZYX,
            z,
            y,
            x,
        )))
    }

    /// Build from a flat row-major array of 12 floats.
    pub fn from_rows(values: [f32; 12]) -> Self {
        let mut rc = [[0.0; 4]; 3];
        for (i, v) in values.iter().enumerate() {
            rc[i / 4][i % 4] = *v;
        }
        Self { rc }
    }

    /// Flat row-major copy of the matrix.
    pub fn to_rows(&self) -> [f32; 12] {
        let mut out = [0.0; 12];
        for (i, v) in out.iter_mut().enumerate() {
            *v = self.rc[i / 4][i % 4];
        }
        out
    }

    /// Translation column.
    #[inline]
    pub fn translation(&self) -> Vec3 {
        Vec3::new(self.rc[0][3], self.rc[1][3], self.rc[2][3])
    }

    /// Image of the +Z axis (ray direction when used as a ray).
    #[inline]
    pub fn z_axis(&self) -> Vec3 {
        Vec3::new(self.rc[0][2], self.rc[1][2], self.rc[2][2])
    }

    /// Apply to a point (rotation + translation).
    #[inline]
    pub fn transform_point(&self, p: Vec3) -> Vec3 {
        self.transform_vector(p) + self.translation()
    }

    /// Apply to a direction (rotation only).
    #[inline]
    pub fn transform_vector(&self, v: Vec3) -> Vec3 {
        let r = &self.rc;
        Vec3::new(
            r[0][0] * v.x + r[0][1] * v.y + r[0][2] * v.z,
            r[1][0] * v.x + r[1][1] * v.y + r[1][2] * v.z,
            r[2][0] * v.x + r[2][1] * v.y + r[2][2] * v.z,
        )
    }

    /// Inverse transform. Singular matrices produce non-finite values.
    pub fn inverse(&self) -> Self {
        Self::from_affine(&self.to_affine().inverse())
    }

    /// Compare element-wise within `eps`.
    pub fn abs_diff_eq(&self, other: &Self, eps: f32) -> bool {
        self.to_rows()
            .iter()
            .zip(other.to_rows().iter())
            .all(|(a, b)| (a - b).abs() <= eps)
    }
}

impl Default for Mat3x4f {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Mul for Mat3x4f {
    type Output = Mat3x4f;

    /// `self * rhs` applies `rhs` first.
    fn mul(self, rhs: Mat3x4f) -> Mat3x4f {
        let (a, b) = (&self.rc, &rhs.rc);
        let mut rc = [[0.0; 4]; 3];
        for (i, row) in rc.iter_mut().enumerate() {
            for (j, out) in row.iter_mut().enumerate() {
                let mut v = a[i][0] * b[0][j] + a[i][1] * b[1][j] + a[i][2] * b[2][j];
                if j == 3 {
                    v += a[i][3];
                }
                *out = v;
            }
        }
        Mat3x4f { rc }
    }
}

impl From<Affine3A> for Mat3x4f {
    fn from(a: Affine3A) -> Self {
        Self::from_affine(&a)
    }
}

impl fmt::Debug for Mat3x4f {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mat3x4f({:?}, {:?}, {:?})", self.rc[0], self.rc[1], self.rc[2])
    }
}

/// Principal axis.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Axis {
    X = 0,
    Y = 1,
    #[default]
    Z = 2,
}

impl Axis {
    /// Unit vector along this axis.
    #[inline]
    pub const fn unit(self) -> Vec3 {
        match self {
            Axis::X => Vec3::X,
            Axis::Y => Vec3::Y,
            Axis::Z => Vec3::Z,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::FRAC_PI_2;

    #[test]
    fn test_affine_roundtrip() {
        let a = Affine3A::from_rotation_translation(
            Quat::from_rotation_y(0.3),
            Vec3::new(1.0, 2.0, 3.0),
        );
        let m = Mat3x4f::from_affine(&a);
        assert_eq!(m.translation(), Vec3::new(1.0, 2.0, 3.0));
        let back = m.to_affine();
        assert!(back.abs_diff_eq(a, 1e-6));
    }

    #[test]
    fn test_rotation_moves_z_axis() {
        let m = Mat3x4f::from_axis_angle(Vec3::X, FRAC_PI_2);
        let dir = m.z_axis();
        assert!(dir.abs_diff_eq(Vec3::new(0.0, -1.0, 0.0), 1e-6));
    }

    #[test]
    fn test_mul_matches_glam() {
        let a = Mat3x4f::from_axis_angle(Vec3::Z, 0.7) * Mat3x4f::from_translation(Vec3::X);
        let b = Mat3x4f::from_affine(
            &(Affine3A::from_axis_angle(Vec3::Z, 0.7) * Affine3A::from_translation(Vec3::X)),
        );
        assert!(a.abs_diff_eq(&b, 1e-6));
    }

    #[test]
    fn test_inverse() {
        let m = Mat3x4f::from_rotation_xyz(0.1, 0.2, 0.3) * Mat3x4f::from_translation(Vec3::ONE);
        let id = m * m.inverse();
        assert!(id.abs_diff_eq(&Mat3x4f::IDENTITY, 1e-5));
    }

    #[test]
    fn test_pod_layout() {
        assert_eq!(std::mem::size_of::<Mat3x4f>(), 48);
        assert_eq!(Mat3x4f::from_rows(Mat3x4f::IDENTITY.to_rows()), Mat3x4f::IDENTITY);
    }
}

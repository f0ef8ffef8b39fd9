//! Common math types used across ls3d
//!
//! The 4DS engine is Y-up; the scene layer is Z-up. The bridge between the
//! two is a plain swap of the 2nd and 3rd components, exposed through
//! [`AxisSwap`]. Every value is stored in scene (Z-up) order once decoded.

use serde::{Deserialize, Serialize};

/// Swaps the Y and Z axes. Applying it twice is the identity.
pub trait AxisSwap: Sized {
    #[must_use]
    fn swap_axes(self) -> Self;
}

/// 2D vector (UV coordinates)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub const ZERO: Self = Self { x: 0.0, y: 0.0 };

    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Mirror the V coordinate (engine and scene disagree on its origin)
    pub fn flip_v(self) -> Self {
        Self { x: self.x, y: -self.y }
    }
}

impl Default for Vec2 {
    fn default() -> Self {
        Self::ZERO
    }
}

/// 3D vector (position, normal, scale)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Self = Self { x: 0.0, y: 0.0, z: 0.0 };
    pub const ONE: Self = Self { x: 1.0, y: 1.0, z: 1.0 };

    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn to_array(self) -> [f32; 3] {
        [self.x, self.y, self.z]
    }

    pub fn length(&self) -> f32 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    pub fn min(self, other: Self) -> Self {
        Self::new(self.x.min(other.x), self.y.min(other.y), self.z.min(other.z))
    }

    pub fn max(self, other: Self) -> Self {
        Self::new(self.x.max(other.x), self.y.max(other.y), self.z.max(other.z))
    }

    /// Component-wise comparison within `epsilon`
    pub fn abs_diff_eq(self, other: Self, epsilon: f32) -> bool {
        (self.x - other.x).abs() <= epsilon
            && (self.y - other.y).abs() <= epsilon
            && (self.z - other.z).abs() <= epsilon
    }
}

impl Default for Vec3 {
    fn default() -> Self {
        Self::ZERO
    }
}

impl std::ops::Add for Vec3 {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self::new(self.x + other.x, self.y + other.y, self.z + other.z)
    }
}

impl std::ops::Sub for Vec3 {
    type Output = Self;

    fn sub(self, other: Self) -> Self {
        Self::new(self.x - other.x, self.y - other.y, self.z - other.z)
    }
}

impl std::ops::Mul<f32> for Vec3 {
    type Output = Self;

    fn mul(self, factor: f32) -> Self {
        Self::new(self.x * factor, self.y * factor, self.z * factor)
    }
}

impl AxisSwap for Vec3 {
    fn swap_axes(self) -> Self {
        Self { x: self.x, y: self.z, z: self.y }
    }
}

impl From<[f32; 3]> for Vec3 {
    fn from(v: [f32; 3]) -> Self {
        Self::new(v[0], v[1], v[2])
    }
}

impl From<Vec3> for glam::Vec3 {
    fn from(v: Vec3) -> Self {
        glam::Vec3::new(v.x, v.y, v.z)
    }
}

impl From<glam::Vec3> for Vec3 {
    fn from(v: glam::Vec3) -> Self {
        Self::new(v.x, v.y, v.z)
    }
}

/// 4D vector (portal planes, padded variant vertices)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vec4 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Vec4 {
    pub const ZERO: Self = Self { x: 0.0, y: 0.0, z: 0.0, w: 0.0 };

    pub fn new(x: f32, y: f32, z: f32, w: f32) -> Self {
        Self { x, y, z, w }
    }

    pub fn truncate(self) -> Vec3 {
        Vec3::new(self.x, self.y, self.z)
    }

    pub fn to_array(self) -> [f32; 4] {
        [self.x, self.y, self.z, self.w]
    }
}

impl Default for Vec4 {
    fn default() -> Self {
        Self::ZERO
    }
}

/// Rotation quaternion, scalar first
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quat {
    pub w: f32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Quat {
    pub const IDENTITY: Self = Self { w: 1.0, x: 0.0, y: 0.0, z: 0.0 };

    pub fn new(w: f32, x: f32, y: f32, z: f32) -> Self {
        Self { w, x, y, z }
    }

    pub fn abs_diff_eq(self, other: Self, epsilon: f32) -> bool {
        (self.w - other.w).abs() <= epsilon
            && (self.x - other.x).abs() <= epsilon
            && (self.y - other.y).abs() <= epsilon
            && (self.z - other.z).abs() <= epsilon
    }
}

impl Default for Quat {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl AxisSwap for Quat {
    fn swap_axes(self) -> Self {
        Self { w: self.w, x: self.x, y: self.z, z: self.y }
    }
}

impl From<Quat> for glam::Quat {
    fn from(q: Quat) -> Self {
        glam::Quat::from_xyzw(q.x, q.y, q.z, q.w)
    }
}

impl From<glam::Quat> for Quat {
    fn from(q: glam::Quat) -> Self {
        Self::new(q.w, q.x, q.y, q.z)
    }
}

/// 4x4 transformation matrix, stored as the file stores it: four rows of
/// four floats with the translation in the last row.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Mat4x4 {
    pub m: [[f32; 4]; 4],
}

impl Mat4x4 {
    pub const IDENTITY: Self = Self {
        m: [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ],
    };

    /// Create a new matrix from a flat array
    pub fn from_flat(data: &[f32; 16]) -> Self {
        Self {
            m: [
                [data[0], data[1], data[2], data[3]],
                [data[4], data[5], data[6], data[7]],
                [data[8], data[9], data[10], data[11]],
                [data[12], data[13], data[14], data[15]],
            ],
        }
    }

    pub fn to_flat(&self) -> [f32; 16] {
        let mut out = [0.0; 16];
        for (row, chunk) in self.m.iter().zip(out.chunks_exact_mut(4)) {
            chunk.copy_from_slice(row);
        }
        out
    }

    /// Get translation component
    pub fn translation(&self) -> Vec3 {
        Vec3::new(self.m[3][0], self.m[3][1], self.m[3][2])
    }

    pub fn to_glam(&self) -> glam::Mat4 {
        glam::Mat4::from_cols_array_2d(&self.m)
    }

    pub fn from_glam(matrix: glam::Mat4) -> Self {
        Self { m: matrix.to_cols_array_2d() }
    }
}

impl Default for Mat4x4 {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl AxisSwap for Mat4x4 {
    /// Conjugates by the Y/Z permutation: rows 1 and 2, then columns 1 and 2.
    fn swap_axes(self) -> Self {
        let mut m = self.m;
        m.swap(1, 2);
        for row in &mut m {
            row.swap(1, 2);
        }
        Self { m }
    }
}

/// Axis-aligned bounding box
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min: Vec3,
    pub max: Vec3,
}

impl BoundingBox {
    pub const ZERO: Self = Self {
        min: Vec3::ZERO,
        max: Vec3::ZERO,
    };

    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Tight box around `points`, or [`BoundingBox::ZERO`] when empty
    pub fn from_points<'a>(points: impl IntoIterator<Item = &'a Vec3>) -> Self {
        let mut iter = points.into_iter();
        let Some(first) = iter.next() else {
            return Self::ZERO;
        };
        let mut bbox = Self::new(*first, *first);
        for p in iter {
            bbox.expand(*p);
        }
        bbox
    }

    pub fn center(&self) -> Vec3 {
        Vec3::new(
            (self.min.x + self.max.x) / 2.0,
            (self.min.y + self.max.y) / 2.0,
            (self.min.z + self.max.z) / 2.0,
        )
    }

    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    /// Half of the largest extent
    pub fn half_extent(&self) -> f32 {
        let size = self.size();
        size.x.max(size.y).max(size.z) * 0.5
    }

    pub fn expand(&mut self, point: Vec3) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self::ZERO
    }
}

impl AxisSwap for BoundingBox {
    fn swap_axes(self) -> Self {
        Self {
            min: self.min.swap_axes(),
            max: self.max.swap_axes(),
        }
    }
}

/// Local translation / rotation / scale of a node
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Transform {
    pub const IDENTITY: Self = Self {
        position: Vec3::ZERO,
        rotation: Quat::IDENTITY,
        scale: Vec3::ONE,
    };

    pub fn new(position: Vec3, rotation: Quat, scale: Vec3) -> Self {
        Self { position, rotation, scale }
    }

    pub fn to_matrix(&self) -> glam::Mat4 {
        glam::Mat4::from_scale_rotation_translation(
            self.scale.into(),
            self.rotation.into(),
            self.position.into(),
        )
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn finite() -> impl Strategy<Value = f32> {
        -1.0e6f32..1.0e6f32
    }

    proptest! {
        #[test]
        fn vec3_swap_is_involution(x in finite(), y in finite(), z in finite()) {
            let v = Vec3::new(x, y, z);
            prop_assert_eq!(v.swap_axes().swap_axes(), v);
        }

        #[test]
        fn quat_swap_is_involution(w in finite(), x in finite(), y in finite(), z in finite()) {
            let q = Quat::new(w, x, y, z);
            prop_assert_eq!(q.swap_axes().swap_axes(), q);
        }

        #[test]
        fn matrix_swap_is_involution(values in proptest::array::uniform16(finite())) {
            let m = Mat4x4::from_flat(&values);
            prop_assert_eq!(m.swap_axes().swap_axes(), m);
        }
    }

    #[test]
    fn test_swap_edge_values() {
        assert_eq!(Vec3::ZERO.swap_axes(), Vec3::ZERO);
        assert_eq!(Quat::IDENTITY.swap_axes(), Quat::IDENTITY);
        assert_eq!(Vec3::new(1.0, 2.0, 3.0).swap_axes(), Vec3::new(1.0, 3.0, 2.0));
        assert_eq!(
            Quat::new(0.5, 0.5, -0.5, 0.25).swap_axes(),
            Quat::new(0.5, 0.5, 0.25, -0.5)
        );
    }

    #[test]
    fn test_bbox_from_points() {
        let points = [
            Vec3::new(1.0, -2.0, 0.0),
            Vec3::new(-1.0, 3.0, 0.5),
            Vec3::new(0.0, 0.0, -4.0),
        ];
        let bbox = BoundingBox::from_points(&points);
        assert_eq!(bbox.min, Vec3::new(-1.0, -2.0, -4.0));
        assert_eq!(bbox.max, Vec3::new(1.0, 3.0, 0.5));
        assert_eq!(bbox.half_extent(), 2.5);
        assert_eq!(BoundingBox::from_points(&Vec::<Vec3>::new()), BoundingBox::ZERO);
    }

    #[test]
    fn test_matrix_translation_layout() {
        let t = Transform::new(Vec3::new(1.0, 2.0, 3.0), Quat::IDENTITY, Vec3::ONE);
        let m = Mat4x4::from_glam(t.to_matrix());
        assert_eq!(m.translation(), Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(Mat4x4::from_flat(&m.to_flat()), m);
    }

    #[test]
    fn test_matrix_swap_moves_translation() {
        let t = Transform::new(Vec3::new(1.0, 2.0, 3.0), Quat::IDENTITY, Vec3::ONE);
        let m = Mat4x4::from_glam(t.to_matrix()).swap_axes();
        assert_eq!(m.translation(), Vec3::new(1.0, 3.0, 2.0));
    }
}

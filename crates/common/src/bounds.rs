use glam::{DVec3, I64Vec3};
use serde::{Deserialize, Serialize};

/// Offsets of the eight octants of a cube, indexed by `x | y << 1 | z << 2`
/// where a set bit means the positive half of that axis.
const SPLIT_TABLE: [DVec3; 8] = [
    DVec3::new(-1.0, -1.0, -1.0),
    DVec3::new(1.0, -1.0, -1.0),
    DVec3::new(-1.0, 1.0, -1.0),
    DVec3::new(1.0, 1.0, -1.0),
    DVec3::new(-1.0, -1.0, 1.0),
    DVec3::new(1.0, -1.0, 1.0),
    DVec3::new(-1.0, 1.0, 1.0),
    DVec3::new(1.0, 1.0, 1.0),
];

/// Axis-aligned cube given by its center and half edge length.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AACube {
    pub center: DVec3,
    pub half_edge: f64,
}

impl AACube {
    pub fn new(center: DVec3, half_edge: f64) -> Self {
        Self { center, half_edge }
    }

    /// Cube spanning `[min, min + edge]` on every axis.
    pub fn from_min_edge(min: DVec3, edge: f64) -> Self {
        let half_edge = edge * 0.5;
        Self {
            center: min + DVec3::splat(half_edge),
            half_edge,
        }
    }

    pub fn min(&self) -> DVec3 {
        self.center - DVec3::splat(self.half_edge)
    }

    pub fn max(&self) -> DVec3 {
        self.center + DVec3::splat(self.half_edge)
    }

    /// Inclusive containment test.
    pub fn contains_point(&self, p: DVec3) -> bool {
        let d = (p - self.center).abs();
        d.x <= self.half_edge && d.y <= self.half_edge && d.z <= self.half_edge
    }

    /// Octant index of `p` relative to the cube center.
    pub fn octant_of(&self, p: DVec3) -> usize {
        let mut index = 0;
        if p.x > self.center.x {
            index |= 1;
        }
        if p.y > self.center.y {
            index |= 2;
        }
        if p.z > self.center.z {
            index |= 4;
        }
        index
    }

    /// The child cube for octant `index` (see [`AACube::octant_of`]).
    pub fn octant(&self, index: usize) -> AACube {
        let half = self.half_edge * 0.5;
        AACube {
            center: self.center + SPLIT_TABLE[index] * half,
            half_edge: half,
        }
    }

    pub fn intersects_sphere(&self, sphere: &Sphere) -> bool {
        let closest = sphere.center.clamp(self.min(), self.max());
        closest.distance_squared(sphere.center) <= sphere.radius * sphere.radius
    }
}

/// Bounding sphere.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sphere {
    pub center: DVec3,
    pub radius: f64,
}

impl Sphere {
    pub fn new(center: DVec3, radius: f64) -> Self {
        Self { center, radius }
    }

    pub fn contains_point(&self, p: DVec3) -> bool {
        self.center.distance_squared(p) <= self.radius * self.radius
    }

    pub fn intersects(&self, other: &Sphere) -> bool {
        let r = self.radius + other.radius;
        self.center.distance_squared(other.center) <= r * r
    }
}

/// Inclusive integer box in world voxel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AABox {
    pub min: I64Vec3,
    pub max: I64Vec3,
}

impl AABox {
    /// Creates a box from two corners in any order.
    pub fn new(a: I64Vec3, b: I64Vec3) -> Self {
        Self {
            min: a.min(b),
            max: a.max(b),
        }
    }

    pub fn from_center_half_widths(center: I64Vec3, half_widths: I64Vec3) -> Self {
        Self::new(center - half_widths, center + half_widths)
    }

    /// Box covering `size` voxels starting at `min`.
    pub fn from_min_size(min: I64Vec3, size: I64Vec3) -> Self {
        Self {
            min,
            max: min + size - I64Vec3::ONE,
        }
    }

    pub fn size(&self) -> I64Vec3 {
        self.max - self.min + I64Vec3::ONE
    }

    pub fn contains(&self, p: I64Vec3) -> bool {
        p.cmpge(self.min).all() && p.cmple(self.max).all()
    }

    pub fn intersects(&self, other: &AABox) -> bool {
        self.min.cmple(other.max).all() && self.max.cmpge(other.min).all()
    }

    /// Overlapping region of two boxes, if any.
    pub fn intersection(&self, other: &AABox) -> Option<AABox> {
        if !self.intersects(other) {
            return None;
        }
        Some(AABox {
            min: self.min.max(other.min),
            max: self.max.min(other.max),
        })
    }
}

/// Integer sphere in world voxel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ISphere {
    pub center: I64Vec3,
    pub radius: i64,
}

impl ISphere {
    pub fn new(center: I64Vec3, radius: i64) -> Self {
        Self { center, radius }
    }

    pub fn contains(&self, p: I64Vec3) -> bool {
        (p - self.center).length_squared() <= self.radius * self.radius
    }

    pub fn bounds(&self) -> AABox {
        AABox::from_center_half_widths(self.center, I64Vec3::splat(self.radius))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn octants_cover_parent() {
        let cube = AACube::new(DVec3::ZERO, 8.0);
        for i in 0..8 {
            let child = cube.octant(i);
            assert_eq!(child.half_edge, 4.0);
            assert_eq!(cube.octant_of(child.center), i);
            assert!(cube.contains_point(child.min()));
            assert!(cube.contains_point(child.max()));
        }
    }

    #[test]
    fn octant_of_ties_go_negative() {
        let cube = AACube::new(DVec3::ZERO, 1.0);
        assert_eq!(cube.octant_of(DVec3::ZERO), 0);
        assert_eq!(cube.octant_of(DVec3::new(0.5, 0.0, 0.5)), 5);
    }

    #[test]
    fn cube_sphere_intersection() {
        let cube = AACube::from_min_edge(DVec3::ZERO, 2.0);
        assert!(cube.intersects_sphere(&Sphere::new(DVec3::new(3.0, 1.0, 1.0), 1.0)));
        assert!(!cube.intersects_sphere(&Sphere::new(DVec3::new(3.5, 1.0, 1.0), 1.0)));
    }

    #[test]
    fn box_intersection_is_inclusive() {
        let a = AABox::new(I64Vec3::ZERO, I64Vec3::splat(3));
        let b = AABox::new(I64Vec3::splat(3), I64Vec3::splat(5));
        let c = AABox::new(I64Vec3::splat(4), I64Vec3::splat(5));
        assert_eq!(
            a.intersection(&b),
            Some(AABox::new(I64Vec3::splat(3), I64Vec3::splat(3)))
        );
        assert!(a.intersection(&c).is_none());
        assert_eq!(a.size(), I64Vec3::splat(4));
    }

    #[test]
    fn box_from_unordered_corners() {
        let b = AABox::new(I64Vec3::new(4, 0, -2), I64Vec3::new(-1, 3, 2));
        assert_eq!(b.min, I64Vec3::new(-1, 0, -2));
        assert_eq!(b.max, I64Vec3::new(4, 3, 2));
        assert!(b.contains(I64Vec3::new(0, 1, 0)));
    }

    #[test]
    fn isphere_contains() {
        let s = ISphere::new(I64Vec3::splat(10), 2);
        assert!(s.contains(I64Vec3::new(12, 10, 10)));
        assert!(!s.contains(I64Vec3::new(12, 11, 10)));
        assert_eq!(s.bounds().size(), I64Vec3::splat(5));
    }
}

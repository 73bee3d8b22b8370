//! Culling planes and view frustum.

use glam::{DMat4, DVec3, DVec4};
use serde::{Deserialize, Serialize};

use crate::bounds::{AACube, Sphere};

/// A plane defined by normal and distance from origin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Plane {
    pub normal: DVec3,
    pub distance: f64,
}

impl Plane {
    pub fn new(normal: DVec3, distance: f64) -> Self {
        Self { normal, distance }
    }

    /// Plane through `point` facing along `normal`.
    pub fn from_point_normal(point: DVec3, normal: DVec3) -> Self {
        let normal = normal.normalize();
        Self {
            normal,
            distance: -normal.dot(point),
        }
    }

    /// Signed distance from point to plane (positive = in front)
    pub fn distance_to_point(&self, point: DVec3) -> f64 {
        self.normal.dot(point) + self.distance
    }

    /// True unless the cube lies entirely behind the plane.
    pub fn cube_in_front(&self, cube: &AACube) -> bool {
        self.distance_to_point(self.positive_vertex(cube)) >= 0.0
    }

    /// True unless the sphere lies entirely behind the plane.
    pub fn sphere_in_front(&self, sphere: &Sphere) -> bool {
        self.distance_to_point(sphere.center) >= -sphere.radius
    }

    // corner of the cube furthest along the normal
    fn positive_vertex(&self, cube: &AACube) -> DVec3 {
        let min = cube.min();
        let max = cube.max();
        DVec3::new(
            if self.normal.x >= 0.0 { max.x } else { min.x },
            if self.normal.y >= 0.0 { max.y } else { min.y },
            if self.normal.z >= 0.0 { max.z } else { min.z },
        )
    }
}

/// View frustum with 6 inward-facing planes (near, far, left, right, top, bottom).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Frustum {
    pub planes: [Plane; 6],
}

impl Frustum {
    pub fn from_planes(planes: [Plane; 6]) -> Self {
        Self { planes }
    }

    /// Extract frustum planes from a view-projection matrix with a 0..1
    /// clip depth range (glam's `*_rh` projections).
    pub fn from_view_projection(vp: &DMat4) -> Self {
        let m = vp.to_cols_array_2d();
        let row = |i: usize| DVec4::new(m[0][i], m[1][i], m[2][i], m[3][i]);
        let (r0, r1, r2, r3) = (row(0), row(1), row(2), row(3));

        let near = Self::normalize_plane(r2);
        let far = Self::normalize_plane(r3 - r2);
        let left = Self::normalize_plane(r3 + r0);
        let right = Self::normalize_plane(r3 - r0);
        let top = Self::normalize_plane(r3 - r1);
        let bottom = Self::normalize_plane(r3 + r1);

        Self {
            planes: [near, far, left, right, top, bottom],
        }
    }

    fn normalize_plane(plane: DVec4) -> Plane {
        let normal = plane.truncate();
        let len = normal.length();
        Plane {
            normal: normal / len,
            distance: plane.w / len,
        }
    }

    pub fn contains_point(&self, point: DVec3) -> bool {
        self.planes.iter().all(|p| p.distance_to_point(point) >= 0.0)
    }

    /// Conservative cube test: false only if the cube is fully outside one plane.
    pub fn intersects_cube(&self, cube: &AACube) -> bool {
        self.planes.iter().all(|p| p.cube_in_front(cube))
    }

    pub fn intersects_sphere(&self, sphere: &Sphere) -> bool {
        self.planes.iter().all(|p| p.sphere_in_front(sphere))
    }
}

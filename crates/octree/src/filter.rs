use strata_common::{AACube, Frustum, Plane, Sphere};

/// Additive set of query volumes. A volume passes only if it passes every
/// filter in the set; an empty set passes everything.
#[derive(Debug, Clone, Default)]
pub struct FilterSet {
    planes: Vec<Plane>,
    frusta: Vec<Frustum>,
    spheres: Vec<Sphere>,
}

impl FilterSet {
    pub fn add_plane(&mut self, plane: Plane) {
        self.planes.push(plane);
    }

    pub fn add_frustum(&mut self, frustum: Frustum) {
        self.frusta.push(frustum);
    }

    pub fn add_sphere(&mut self, sphere: Sphere) {
        self.spheres.push(sphere);
    }

    pub fn clear(&mut self) {
        self.planes.clear();
        self.frusta.clear();
        self.spheres.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.planes.is_empty() && self.frusta.is_empty() && self.spheres.is_empty()
    }

    pub fn len(&self) -> usize {
        self.planes.len() + self.frusta.len() + self.spheres.len()
    }

    pub fn passes_cube(&self, cube: &AACube) -> bool {
        self.planes.iter().all(|p| p.cube_in_front(cube))
            && self.frusta.iter().all(|f| f.intersects_cube(cube))
            && self.spheres.iter().all(|s| cube.intersects_sphere(s))
    }

    pub fn passes_sphere(&self, sphere: &Sphere) -> bool {
        self.planes.iter().all(|p| p.sphere_in_front(sphere))
            && self.frusta.iter().all(|f| f.intersects_sphere(sphere))
            && self.spheres.iter().all(|s| s.intersects(sphere))
    }
}

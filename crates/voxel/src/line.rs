use glam::IVec3;

/// Integer 3D line stepper.
///
/// The dominant axis advances one voxel per step while the other two are
/// driven by error accumulators. Both endpoints are yielded, so a line from
/// `a` to `b` visits `max(|b - a|) + 1` voxels.
#[derive(Debug, Clone)]
pub struct VoxelLine {
    current: IVec3,
    step: IVec3,
    delta: IVec3,
    err: IVec3,
    dist: i32,
    remaining: i32,
}

impl VoxelLine {
    pub fn new(from: IVec3, to: IVec3) -> Self {
        let diff = to - from;
        let delta = diff.abs();
        let dist = delta.max_element();
        Self {
            current: from,
            step: IVec3::new(sign(diff.x), sign(diff.y), sign(diff.z)),
            delta,
            err: delta,
            dist,
            remaining: dist + 1,
        }
    }

    /// Number of voxels the line visits.
    pub fn voxel_count(&self) -> usize {
        (self.dist + 1) as usize
    }
}

fn sign(v: i32) -> i32 {
    if v > 0 { 1 } else { -1 }
}

impl Iterator for VoxelLine {
    type Item = IVec3;

    fn next(&mut self) -> Option<IVec3> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let out = self.current;

        self.err += self.delta;
        for axis in 0..3 {
            if self.err[axis] > self.dist {
                self.err[axis] -= self.dist;
                self.current[axis] += self.step[axis];
            }
        }
        Some(out)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.remaining as usize;
        (n, Some(n))
    }
}

impl ExactSizeIterator for VoxelLine {}

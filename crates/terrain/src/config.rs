use std::path::{Path, PathBuf};

use glam::I64Vec3;
use serde::{Deserialize, Serialize};

/// Largest world edge, in world units, that the discoverable area may span.
pub const MAX_WORLD_EXTENT: i64 = 1 << 40;

/// Errors from loading or validating a [`TerrainConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error reading {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("JSON error in {path:?}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Terrain streaming configuration.
///
/// Distances are per-axis block counts in the units of the LOD they apply
/// to. LOD 0 is the finest level; `lod_count - 1` is the coarsest, used for
/// discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerrainConfig {
    /// Voxels per block edge at every LOD. Power of two, at least 4.
    pub block_size: u32,
    /// Extra voxels on the positive side of each grid shared with the
    /// neighbouring block.
    pub block_overlap: u32,
    /// Number of LOD levels (2..=11).
    pub lod_count: u32,
    /// Lowest-LOD blocks within this distance get generated.
    pub setup_distance: u32,
    /// Generated blocks within this distance get subdivided.
    pub subdivide_distance: u32,
    /// Extra distance before children are merged away again.
    pub merge_hysteresis: u32,
    /// Upper bound of discoverable lowest-LOD block coordinates.
    pub max_discovery_bounds: I64Vec3,
    /// Observer travel (world units) that triggers rediscovery. Defaults to
    /// one lowest-LOD block.
    pub rediscovery_distance: Option<f64>,
    /// Worker threads for generation and meshing. 0 runs jobs inline.
    pub worker_threads: usize,
    /// Density value treated as empty space.
    pub non_solid_value: u8,
}

impl Default for TerrainConfig {
    fn default() -> Self {
        Self {
            block_size: 32,
            block_overlap: 2,
            lod_count: 11,
            setup_distance: 4,
            subdivide_distance: 1,
            merge_hysteresis: 1,
            max_discovery_bounds: I64Vec3::splat(100_000),
            rediscovery_distance: None,
            worker_threads: 4,
            non_solid_value: 0,
        }
    }
}

impl TerrainConfig {
    /// Load and validate a config from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &'static str, reason: &str| -> Result<(), ConfigError> {
            Err(ConfigError::Invalid {
                field,
                reason: reason.to_string(),
            })
        };

        if self.block_size < 4 || !self.block_size.is_power_of_two() {
            return invalid("block_size", "must be a power of two and at least 4");
        }
        if self.block_overlap == 0 || self.block_overlap > self.block_size {
            return invalid("block_overlap", "must be between 1 and block_size");
        }
        if !(2..=11).contains(&self.lod_count) {
            return invalid("lod_count", "must be between 2 and 11");
        }
        if self.setup_distance < 2 {
            return invalid("setup_distance", "must be at least 2");
        }
        if self.subdivide_distance == 0 || self.subdivide_distance >= self.setup_distance {
            return invalid("subdivide_distance", "must be at least 1 and below setup_distance");
        }
        if self.max_discovery_bounds.min_element() <= 0 {
            return invalid("max_discovery_bounds", "must be positive on every axis");
        }
        let extent = self
            .max_discovery_bounds
            .max_element()
            .checked_mul(self.block_world_size(self.lowest_lod()));
        if extent.is_none_or(|e| e > MAX_WORLD_EXTENT) {
            return invalid(
                "max_discovery_bounds",
                &format!("world extent must not exceed {MAX_WORLD_EXTENT} units"),
            );
        }
        if let Some(d) = self.rediscovery_distance {
            if !(d.is_finite() && d > 0.0) {
                return invalid("rediscovery_distance", "must be positive and finite");
            }
        }
        Ok(())
    }

    /// The coarsest LOD, which holds the discovery blocks.
    pub fn lowest_lod(&self) -> u32 {
        self.lod_count - 1
    }

    /// Lowest-LOD block radius that discovery scans.
    pub fn discovery_distance(&self) -> u32 {
        self.setup_distance + 2
    }

    /// World units covered by one voxel at `lod`.
    pub fn voxel_size(&self, lod: u32) -> i64 {
        1 << lod
    }

    /// World units covered by one block edge at `lod`, without overlap.
    pub fn block_world_size(&self, lod: u32) -> i64 {
        self.block_size as i64 * self.voxel_size(lod)
    }

    /// Voxel dimensions of each block grid, overlap included.
    pub fn grid_edge(&self) -> u32 {
        self.block_size + self.block_overlap
    }

    pub fn effective_rediscovery_distance(&self) -> f64 {
        self.rediscovery_distance
            .unwrap_or_else(|| self.block_world_size(self.lowest_lod()) as f64)
    }
}

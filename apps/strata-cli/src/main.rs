use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use glam::{DVec3, I64Vec3, IVec3};
use noise::{Fbm, MultiFractal, NoiseFn, Perlin};
use strata_common::{AACube, ISphere, SplitMix64, Sphere};
use strata_octree::Octree;
use strata_terrain::{
    GenerationError, GenerationRequest, SceneAction, TerrainConfig, TerrainManager, VoxelEdit,
    VoxelGenerator,
};
use strata_voxel::VoxelGrid;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "strata-cli", about = "CLI driver for the strata streaming core")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Terrain config (JSON); defaults to a small demo world
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print crate info and the effective terrain config
    Info,
    /// Stream terrain around an observer walking across the world
    Simulate {
        /// Number of frames to run
        #[arg(short, long, default_value = "200")]
        frames: usize,
        /// Observer speed in world units per frame
        #[arg(long, default_value = "4.0")]
        speed: f64,
        /// Terrain noise seed
        #[arg(short, long, default_value = "42")]
        seed: u32,
        /// Worker threads (overrides the config)
        #[arg(short, long)]
        threads: Option<usize>,
        /// Dig a crater under the observer halfway through
        #[arg(long)]
        dig: bool,
    },
    /// Exercise the octree with random spheres
    Octree {
        /// Number of objects
        #[arg(short, long, default_value = "10000")]
        objects: usize,
        /// Query sphere radius
        #[arg(short, long, default_value = "50.0")]
        radius: f64,
        /// RNG seed
        #[arg(short, long, default_value = "42")]
        seed: u64,
    },
    /// Settle terrain around a point and cast a ray straight down
    Raycast {
        /// World x (defaults to the world center)
        #[arg(long)]
        x: Option<i64>,
        /// World z (defaults to the world center)
        #[arg(long)]
        z: Option<i64>,
        /// Terrain noise seed
        #[arg(short, long, default_value = "42")]
        seed: u32,
    },
}

/// Heightfield terrain from fractal Perlin noise: grass over dirt over stone.
struct NoiseTerrain {
    noise: Fbm<Perlin>,
    base_height: f64,
    amplitude: f64,
    scale: f64,
}

impl NoiseTerrain {
    fn new(seed: u32) -> Self {
        Self {
            noise: Fbm::<Perlin>::new(seed).set_octaves(5).set_persistence(0.5),
            base_height: 128.0,
            amplitude: 64.0,
            scale: 400.0,
        }
    }

    fn height_at(&self, x: i64, z: i64) -> i64 {
        let n = self.noise.get([x as f64 / self.scale, z as f64 / self.scale]);
        (self.base_height + n * self.amplitude) as i64
    }
}

const GRASS: u8 = 1;
const DIRT: u8 = 2;
const STONE: u8 = 3;

impl VoxelGenerator for NoiseTerrain {
    fn generate(&self, request: &GenerationRequest) -> Result<VoxelGrid, GenerationError> {
        let mut grid = request.empty_grid(0);
        let step = request.voxel_size;
        for z in 0..request.dims.z {
            for x in 0..request.dims.x {
                let world = request.world_position(IVec3::new(x, 0, z));
                let height = self.height_at(world.x, world.z);
                // voxels whose world y lies below the surface
                let solid = (height - world.y + step - 1).div_euclid(step).clamp(0, request.dims.y as i64) as i32;
                if solid == 0 {
                    continue;
                }
                grid.set_density_span(IVec3::new(x, 0, z), solid, 1);
                for y in 0..solid {
                    let depth = height - (world.y + y as i64 * step);
                    let material = match depth {
                        d if d <= step => GRASS,
                        d if d <= 4 * step => DIRT,
                        _ => STONE,
                    };
                    grid.set_material(IVec3::new(x, y, z), material);
                }
            }
        }
        Ok(grid)
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<TerrainConfig> {
    match path {
        Some(path) => TerrainConfig::from_json_file(path)
            .with_context(|| format!("loading terrain config {}", path.display())),
        // small enough to settle in a few hundred milliseconds
        None => Ok(TerrainConfig {
            block_size: 16,
            lod_count: 5,
            setup_distance: 2,
            max_discovery_bounds: I64Vec3::new(64, 2, 64),
            ..TerrainConfig::default()
        }),
    }
}

/// Center of the discoverable world at ground level.
fn world_center(config: &TerrainConfig, terrain: &NoiseTerrain) -> DVec3 {
    let extent = config.max_discovery_bounds * config.block_world_size(config.lowest_lod());
    let x = extent.x / 2;
    let z = extent.z / 2;
    DVec3::new(x as f64, terrain.height_at(x, z) as f64 + 8.0, z as f64)
}

fn simulate(
    mut config: TerrainConfig,
    frames: usize,
    speed: f64,
    seed: u32,
    threads: Option<usize>,
    dig: bool,
) -> anyhow::Result<()> {
    if let Some(threads) = threads {
        config.worker_threads = threads;
    }
    let start = world_center(&config, &NoiseTerrain::new(seed));
    let mut manager = TerrainManager::new(config, NoiseTerrain::new(seed))?;

    println!("Simulating {frames} frames from {start}, speed {speed}/frame");
    let mut attached = 0usize;
    let mut detached = 0usize;
    for frame in 0..frames {
        let observer = start + DVec3::new(frame as f64 * speed, 0.0, frame as f64 * speed * 0.5);
        if dig && frame == frames / 2 {
            let center = observer.floor().as_i64vec3() - I64Vec3::new(0, 8, 0);
            manager.apply_edit(VoxelEdit::fill_sphere(ISphere::new(center, 12), 0));
            tracing::info!(frame, %center, "digging crater");
        }
        manager.update(&observer);

        for action in manager.take_actions() {
            match action {
                SceneAction::Attach { .. } => attached += 1,
                SceneAction::Detach { .. } => detached += 1,
                SceneAction::SetVisible { .. } => {}
            }
        }
        if frame % 50 == 0 || frame + 1 == frames {
            let stats = manager.stats();
            println!(
                "  frame {frame}: blocks={} visible={} pending={} created={} deleted={} time={:?}",
                stats.total_blocks,
                stats.visible_blocks,
                stats.pending_tasks,
                stats.blocks_created,
                stats.blocks_deleted,
                stats.frame_time
            );
        }
    }

    let timer = manager.frame_timer();
    println!(
        "Done: {} blocks, {attached} meshes attached, {detached} detached, {} edits",
        manager.block_count(),
        manager.edit_log().recorded()
    );
    println!("Frame time: avg {:?}, max {:?}", timer.average(), timer.max());
    manager.shutdown();
    Ok(())
}

fn octree_demo(objects: usize, radius: f64, seed: u64) {
    let extent = 4096.0;
    let mut rng = SplitMix64::new(seed);
    let mut tree = Octree::with_defaults(AACube::from_min_edge(DVec3::ZERO, extent));
    let mut spheres = Vec::with_capacity(objects);
    for id in 0..objects {
        let center = DVec3::new(
            rng.range_f64(0.0, extent),
            rng.range_f64(0.0, extent),
            rng.range_f64(0.0, extent),
        );
        let sphere = Sphere::new(center, rng.range_f64(0.5, 8.0));
        tree.insert(id, sphere);
        spheres.push(sphere);
    }
    println!(
        "Inserted {objects}: nodes={} leaves={} depth={}",
        tree.node_count(),
        tree.leaf_count(),
        tree.depth()
    );

    let query = Sphere::new(DVec3::splat(extent / 2.0), radius);
    tree.add_sphere_filter(query);
    tree.filter();
    let expected = spheres.iter().filter(|s| s.intersects(&query)).count();
    println!(
        "Sphere query r={radius}: {} results ({expected} by brute force)",
        tree.result().len()
    );
    tree.clear_filter();

    for id in (0..objects).step_by(2) {
        tree.remove(id);
    }
    println!(
        "Removed half: objects={} nodes={} leaves={} depth={}",
        tree.len(),
        tree.node_count(),
        tree.leaf_count(),
        tree.depth()
    );
}

fn raycast(mut config: TerrainConfig, x: Option<i64>, z: Option<i64>, seed: u32) -> anyhow::Result<()> {
    config.worker_threads = 0;
    let terrain = NoiseTerrain::new(seed);
    let center = world_center(&config, &terrain);
    let x = x.unwrap_or(center.x as i64);
    let z = z.unwrap_or(center.z as i64);
    let surface = terrain.height_at(x, z);

    let mut manager = TerrainManager::new(config, terrain)?;
    let observer = DVec3::new(x as f64, surface as f64, z as f64);
    for _ in 0..16 {
        manager.update(&observer);
    }

    let from = I64Vec3::new(x, surface + 16, z);
    let to = I64Vec3::new(x, surface - 16, z);
    match manager.cast_ray(from, to) {
        Some(hit) => println!(
            "Ray {from} -> {to}: hit {} (value {}), last empty voxel {}; generator surface at y={}",
            hit.inside,
            hit.value,
            hit.outside,
            surface - 1
        ),
        None => println!("Ray {from} -> {to}: no hit (blocks not streamed at LOD 0?)"),
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Info => {
            println!("strata-cli v{}", env!("CARGO_PKG_VERSION"));
            println!("common: {}", strata_common::crate_info());
            println!("voxel: {}", strata_voxel::crate_info());
            println!("octree: {}", strata_octree::crate_info());
            println!("terrain: {}", strata_terrain::crate_info());
            println!(
                "config: block_size={} lods={} setup={} subdivide={} workers={}",
                config.block_size,
                config.lod_count,
                config.setup_distance,
                config.subdivide_distance,
                config.worker_threads
            );
        }
        Commands::Simulate {
            frames,
            speed,
            seed,
            threads,
            dig,
        } => simulate(config, frames, speed, seed, threads, dig)?,
        Commands::Octree {
            objects,
            radius,
            seed,
        } => octree_demo(objects, radius, seed),
        Commands::Raycast { x, z, seed } => raycast(config, x, z, seed)?,
    }

    Ok(())
}

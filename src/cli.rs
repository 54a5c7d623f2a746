use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::Parser;
use indicatif::ProgressBar;
use log::{info, warn};
use quadbvh::{
    Accelerator, BruteForce, QbvhAccel, QbvhParams, StackCache,
    geometry::{Ray, WorldBox, WorldPoint, WorldVector},
    mesh::{MergedMesh, TriangleMesh},
};
use rand::{Rng, SeedableRng, rngs::SmallRng};
use rand_distr::{Distribution, UnitSphere};

/// Build a QBVH over an OBJ mesh and shoot random rays at it
#[derive(Parser)]
#[command(name = "quadbvh-cli")]
struct Args {
    /// Wavefront OBJ file to load
    path: PathBuf,

    /// Number of random rays to shoot
    #[arg(long, default_value_t = 100_000)]
    rays: usize,

    /// Seed for the ray generator
    #[arg(long, default_value_t = 0)]
    seed: u64,

    #[arg(long, default_value_t = 4)]
    max_prims_per_leaf: usize,

    /// Check every ray against the brute force reference
    #[arg(long)]
    verify: bool,

    /// Print the whole tree
    #[arg(long)]
    dump: bool,
}

/// Ray starting on a sphere enclosing the box, aimed at a random point inside it
fn random_ray(bounds: &WorldBox, rng: &mut SmallRng) -> Ray {
    let center = bounds.center();
    let radius = (bounds.max - bounds.min).norm().max(1.0);

    let on_sphere: [f32; 3] = UnitSphere.sample(rng);
    let origin = center + WorldVector::from(on_sphere) * radius;
    let target = WorldPoint::new(
        rng.random_range(bounds.min.x..=bounds.max.x),
        rng.random_range(bounds.min.y..=bounds.max.y),
        rng.random_range(bounds.min.z..=bounds.max.z),
    );
    Ray::new(origin, target - origin)
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let meshes = TriangleMesh::load_obj(&args.path)
        .with_context(|| format!("Loading {}", args.path.display()))?;
    let vertex_count = meshes.iter().map(TriangleMesh::vertex_count).sum();
    let triangle_count = meshes.iter().map(TriangleMesh::triangle_count).sum();

    let params = QbvhParams::builder()
        .max_prims_per_leaf(args.max_prims_per_leaf)
        .build()?;
    let mut accel = QbvhAccel::new(params);
    accel.init(&meshes, vertex_count, triangle_count)?;
    let qbvh = accel.qbvh()?;

    println!("{}", qbvh.statistics());
    if args.dump {
        println!("{}", qbvh.tree_dump());
    }

    let bounds = qbvh.bounding_box();
    if bounds.is_empty() {
        bail!("Mesh has no triangles");
    }

    let reference = if args.verify {
        Some(BruteForce::new(MergedMesh::merge(&meshes)?))
    } else {
        None
    };

    let mut rng = SmallRng::seed_from_u64(args.seed);
    let mut stack = StackCache::default();
    let mut hits = 0;
    let mut mismatches = 0;
    let bar = ProgressBar::new(args.rays as u64);
    for _ in 0..args.rays {
        let ray = random_ray(&bounds, &mut rng);
        let hit = accel.intersect_with_stack(&ray, &mut stack)?;
        hits += hit.is_some() as usize;

        if let Some(reference) = &reference {
            let expected = reference.intersect(&ray);
            if expected.map(|h| h.t) != hit.map(|h| h.t) {
                mismatches += 1;
                warn!("Mismatch for {ray:?}: expected {expected:?}, got {hit:?}");
            }
        }
        bar.inc(1);
    }
    bar.finish();

    info!("{hits} of {} rays hit", args.rays);
    if reference.is_some() {
        if mismatches > 0 {
            bail!("{mismatches} rays disagree with the brute force reference");
        }
        info!("All rays match the brute force reference");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert2::{assert, let_assert};
    use clap::CommandFactory;

    #[test]
    fn argument_definitions() {
        Args::command().debug_assert();
    }

    #[test]
    fn defaults() {
        let_assert!(Ok(args) = Args::try_parse_from(["quadbvh-cli", "teapot.obj"]));
        assert!(args.path == PathBuf::from("teapot.obj"));
        assert!(args.rays == 100_000);
        assert!(args.seed == 0);
        assert!(args.max_prims_per_leaf == 4);
        assert!(!args.verify);
        assert!(!args.dump);
    }

    #[test]
    fn options() {
        let_assert!(
            Ok(args) = Args::try_parse_from([
                "quadbvh-cli",
                "--rays",
                "10",
                "--max-prims-per-leaf",
                "8",
                "--verify",
                "teapot.obj",
            ])
        );
        assert!(args.rays == 10);
        assert!(args.max_prims_per_leaf == 8);
        assert!(args.verify);
    }

    #[test]
    fn missing_path_is_rejected() {
        assert!(Args::try_parse_from(["quadbvh-cli", "--dump"]).is_err());
    }
}

mod accelerator;
mod brute_force;
pub mod geometry;
pub mod mesh;
pub mod qbvh;
mod util;

pub use accelerator::{AccelError, Accelerator, QbvhAccel, RayHit};
pub use brute_force::BruteForce;
pub use qbvh::{BuildError, Qbvh, QbvhParams, StackCache};
pub use util::Stats;

//! Normalizing flows over `ndarray` arrays: composable bijections with
//! analytic log-determinants, distributions with numpy-style batch
//! broadcasting, and ready-made flow architectures.
//!
//! All randomness flows through a caller-seeded `ChaCha8Rng`, so flow
//! construction and sampling are reproducible from a single seed.

pub mod bijections;
pub mod distributions;
pub mod errors;
pub mod flows;
pub mod nn;
pub mod params;
pub mod shapes;

pub use bijections::Bijection;
pub use distributions::{Distribution, Transformed};
pub use errors::{FlowError, Result};
pub use params::ParamLeaves;

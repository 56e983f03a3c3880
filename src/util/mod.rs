//! Internal utilities.
//!
//! - [`det_rng`]: deterministic PRNG backing every nondeterministic choice

pub mod det_rng;

pub use det_rng::DetRng;

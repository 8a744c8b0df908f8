//! PRNG construction for environments
//!
//! Environments own a [`StdRng`] built through [`rng_from_seed`]. Passing an
//! explicit seed makes rollouts reproducible; passing `None` draws a fresh
//! seed from thread-local entropy. The seed actually used is returned so
//! callers can report it back to the user.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Build a [`StdRng`] from an optional seed, returning the seed used.
#[must_use]
pub fn rng_from_seed(seed: Option<u64>) -> (StdRng, u64) {
    let seed = seed.unwrap_or_else(|| rand::thread_rng().gen());
    (StdRng::seed_from_u64(seed), seed)
}

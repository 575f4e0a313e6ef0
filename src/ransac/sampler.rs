//! Uniform random sampler drawing minimal samples without replacement.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Uniform sampler over `[0, n)` producing index sets without replacement.
///
/// By default the generator is seeded from entropy; consensus runs that must
/// be reproducible (tests, regression baselines) construct it from a fixed
/// seed.
pub struct UniformSampler {
    rng: StdRng,
}

impl UniformSampler {
    /// Construct with a random seed (suitable for production use).
    pub fn new() -> Self {
        UniformSampler {
            rng: StdRng::from_entropy(),
        }
    }

    /// Construct with a fixed seed (reproducible sampling).
    pub fn from_seed(seed: u64) -> Self {
        UniformSampler {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Fill `out` with distinct indices drawn uniformly from `[0, n)`.
    ///
    /// Returns `false` when the request cannot be satisfied (`out` longer
    /// than the population). Rejection sampling is appropriate for the small
    /// sample sizes of minimal solvers.
    pub fn sample_unique(&mut self, n: usize, out: &mut [usize]) -> bool {
        if out.len() > n || n == 0 {
            return false;
        }
        for i in 0..out.len() {
            loop {
                let candidate = self.rng.gen_range(0..n);
                if out[..i].iter().all(|&v| v != candidate) {
                    out[i] = candidate;
                    break;
                }
            }
        }
        true
    }
}

impl Default for UniformSampler {
    fn default() -> Self {
        Self::new()
    }
}

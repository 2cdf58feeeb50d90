//! DeterministicRng - Seeded Random Number Generator
//!
//! TigerStyle: ChaCha20-based RNG so every simulated fault and every generated
//! operation sequence replays from its seed.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// Golden-ratio increment used to derive fork seeds.
const FORK_SEED_STRIDE: u64 = 0x9E37_79B9_7F4A_7C15;

/// A deterministic random number generator.
///
/// Same seed, same sequence. Forks get independent streams derived from the
/// parent seed, so a simulated device and a property-test driver can draw
/// from one seed without perturbing each other.
#[derive(Debug, Clone)]
pub struct DeterministicRng {
    rng: ChaCha20Rng,
    seed: u64,
    forks_count: u64,
}

impl DeterministicRng {
    /// Create a new RNG with the given seed.
    ///
    /// # Example
    /// ```
    /// use devmem_core::dst::DeterministicRng;
    /// let mut rng = DeterministicRng::new(42);
    /// assert!(rng.next_float() < 1.0);
    /// ```
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha20Rng::seed_from_u64(seed),
            seed,
            forks_count: 0,
        }
    }

    /// Get the original seed.
    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Uniform float in [0, 1).
    pub fn next_float(&mut self) -> f64 {
        self.rng.gen::<f64>()
    }

    /// Uniform u64.
    pub fn next_u64(&mut self) -> u64 {
        self.rng.gen()
    }

    /// Uniform usize in [min, max] (inclusive).
    ///
    /// # Panics
    /// Panics if min > max.
    pub fn next_usize(&mut self, min: usize, max: usize) -> usize {
        assert!(min <= max, "min ({}) must be <= max ({})", min, max);
        self.rng.gen_range(min..=max)
    }

    /// True with the given probability.
    ///
    /// # Panics
    /// Panics if probability is not in [0, 1].
    pub fn next_bool(&mut self, probability: f64) -> bool {
        assert!(
            (0.0..=1.0).contains(&probability),
            "probability must be in [0, 1], got {}",
            probability
        );
        self.next_float() < probability
    }

    /// Pick an index into a collection of `len` items.
    ///
    /// # Panics
    /// Panics if `len` is zero.
    pub fn next_index(&mut self, len: usize) -> usize {
        assert!(len > 0, "cannot pick from an empty collection");
        self.rng.gen_range(0..len)
    }

    /// Pick an element of a slice.
    ///
    /// # Panics
    /// Panics if the slice is empty.
    pub fn pick<'a, T>(&mut self, items: &'a [T]) -> &'a T {
        &items[self.next_index(items.len())]
    }

    /// Pick an index according to integer weights.
    ///
    /// # Panics
    /// Panics if the weights are empty or all zero.
    pub fn weighted_index(&mut self, weights: &[u32]) -> usize {
        let total: u64 = weights.iter().map(|w| u64::from(*w)).sum();
        assert!(total > 0, "weights must not all be zero");

        let mut roll = self.rng.gen_range(0..total);
        for (index, weight) in weights.iter().enumerate() {
            let weight = u64::from(*weight);
            if roll < weight {
                return index;
            }
            roll -= weight;
        }
        unreachable!("roll is always below the weight total")
    }

    /// Create an independent fork of this RNG.
    pub fn fork(&mut self) -> Self {
        self.forks_count += 1;
        let fork_seed = self
            .seed
            .wrapping_add(self.forks_count.wrapping_mul(FORK_SEED_STRIDE));
        Self::new(fork_seed)
    }
}

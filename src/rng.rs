use rand::Rng;

use crate::config::WorkerInfo;

#[derive(Debug, Clone)]
/// Small splitmix64 RNG so seeded orderings do not drift across `rand` releases.
pub(crate) struct DeterministicRng {
    state: u64,
}

impl DeterministicRng {
    pub(crate) fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    /// Seed from OS entropy for stages running without a deterministic seed.
    pub(crate) fn from_entropy() -> Self {
        Self::new(rand::random())
    }

    fn next_u64_internal(&mut self) -> u64 {
        let mut z = self.state.wrapping_add(0x9E3779B97F4A7C15);
        self.state = z;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
        z ^ (z >> 31)
    }
}

impl rand::RngCore for DeterministicRng {
    fn next_u32(&mut self) -> u32 {
        self.next_u64_internal() as u32
    }

    fn next_u64(&mut self) -> u64 {
        self.next_u64_internal()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        let mut offset = 0;
        while offset < dest.len() {
            let value = self.next_u64_internal();
            let bytes = value.to_le_bytes();
            let remaining = dest.len() - offset;
            let copy_len = remaining.min(bytes.len());
            dest[offset..offset + copy_len].copy_from_slice(&bytes[..copy_len]);
            offset += copy_len;
        }
    }
}

/// Derive the seed used by a reshuffler or resampler for one iteration.
///
/// A non-negative `base_seed` gives `base_seed + epoch`, identical on every
/// worker that observes the same epoch. A negative `base_seed` falls back to
/// the worker's own identity, spaced by `epoch * num_workers` so consecutive
/// epochs of different workers never collide.
pub fn derive_seed(base_seed: i64, epoch: u64, worker: &WorkerInfo) -> u64 {
    if base_seed >= 0 {
        (base_seed as u64).wrapping_add(epoch)
    } else {
        let spacing = worker.num_workers.max(1) as u64;
        worker.seed.wrapping_add(epoch.wrapping_mul(spacing))
    }
}

/// Draw an index from the categorical distribution described by `weights`.
///
/// Weights need not be normalized. Returns the last positive-weight index
/// when floating point rounding leaves the draw past the cumulative total.
pub(crate) fn pick_weighted<R: Rng + ?Sized>(rng: &mut R, weights: &[f64]) -> usize {
    let total: f64 = weights.iter().filter(|w| **w > 0.0).sum();
    if total <= 0.0 {
        return 0;
    }
    let target = rng.random::<f64>() * total;
    let mut cumulative = 0.0;
    let mut last_positive = 0;
    for (idx, weight) in weights.iter().enumerate() {
        if *weight <= 0.0 {
            continue;
        }
        cumulative += weight;
        last_positive = idx;
        if target < cumulative {
            return idx;
        }
    }
    last_positive
}

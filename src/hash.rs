use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::constants::worker::WORKER_SEED_DOMAIN;

pub fn stable_hash_with(f: impl FnOnce(&mut DefaultHasher)) -> u64 {
    let mut hasher = DefaultHasher::new();
    f(&mut hasher);
    hasher.finish()
}

/// Identity seed of one worker of one rank, stable across runs for a fixed `seed`.
pub fn worker_identity_seed(seed: i64, rank: usize, worker_id: usize) -> u64 {
    stable_hash_with(|hasher| {
        WORKER_SEED_DOMAIN.hash(hasher);
        seed.hash(hasher);
        rank.hash(hasher);
        worker_id.hash(hasher);
    })
}

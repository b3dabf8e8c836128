//! Shard draws with replacement.

use std::sync::Arc;

use rand::Rng;
use tracing::debug;

use crate::config::WorkerInfo;
use crate::epoch::EpochSource;
use crate::errors::PipelineError;
use crate::rng::{DeterministicRng, derive_seed};
use crate::stage::Stream;
use crate::types::ShardId;

/// Samples shard identifiers uniformly with replacement.
///
/// In deterministic mode the generator is reseeded from `(base_seed, epoch)`
/// at the start of every pass, so a pass is reproducible for a given epoch.
/// Otherwise each pass draws from fresh entropy.
#[derive(Clone, Debug)]
pub struct ResampledShards {
    shards: Arc<[ShardId]>,
    draws: Option<usize>,
    deterministic: bool,
    base_seed: i64,
    epoch: EpochSource,
    worker: WorkerInfo,
}

impl ResampledShards {
    /// Resampler over `shards`; `draws = None` yields without bound.
    pub fn new(
        shards: Vec<ShardId>,
        draws: Option<usize>,
        deterministic: bool,
        base_seed: i64,
        epoch: impl Into<EpochSource>,
        worker: WorkerInfo,
    ) -> Result<Self, PipelineError> {
        if shards.is_empty() {
            return Err(PipelineError::configuration(
                "cannot resample from an empty shard list",
            ));
        }
        Ok(Self {
            shards: shards.into(),
            draws,
            deterministic,
            base_seed,
            epoch: epoch.into(),
            worker,
        })
    }

    /// Number of distinct shards drawn from.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Start one pass of draws.
    pub fn draws(&mut self) -> ResampleIter {
        let epoch = self.epoch.begin_iteration();
        let rng = if self.deterministic {
            let seed = derive_seed(self.base_seed, epoch, &self.worker);
            debug!(epoch, seed, shards = self.shards.len(), "starting deterministic resample pass");
            DeterministicRng::new(seed)
        } else {
            DeterministicRng::from_entropy()
        };
        ResampleIter {
            shards: Arc::clone(&self.shards),
            remaining: self.draws,
            rng,
        }
    }

    /// One pass of draws as a pipeline stream.
    pub fn stream(&mut self) -> Stream<ShardId> {
        Box::new(self.draws().map(Ok))
    }
}

/// Iterator over one pass of [`ResampledShards`] draws.
pub struct ResampleIter {
    shards: Arc<[ShardId]>,
    remaining: Option<usize>,
    rng: DeterministicRng,
}

impl Iterator for ResampleIter {
    type Item = ShardId;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(remaining) = self.remaining.as_mut() {
            if *remaining == 0 {
                return None;
            }
            *remaining -= 1;
        }
        let idx = self.rng.random_range(0..self.shards.len());
        Some(self.shards[idx].clone())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match self.remaining {
            Some(remaining) => (remaining, Some(remaining)),
            None => (usize::MAX, None),
        }
    }
}

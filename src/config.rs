use serde::{Deserialize, Serialize};

use crate::constants::shuffle::{
    SAMPLE_SHUFFLE_INITIAL, SAMPLE_SHUFFLE_SIZE, SHARD_SHUFFLE_INITIAL, SHARD_SHUFFLE_SIZE,
};
use crate::constants::worker::DEFAULT_PREFETCH;
use crate::errors::PipelineError;
use crate::hash::worker_identity_seed;
use crate::stage::FailurePolicy;

/// Buffer sizing for one bounded streaming reshuffler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShuffleConfig {
    /// Maximum number of items held in the shuffle buffer.
    pub buffer_size: usize,
    /// Items buffered before the first item is emitted.
    pub initial: usize,
}

impl ShuffleConfig {
    /// Defaults used for shard-level shuffling.
    pub fn shards() -> Self {
        Self {
            buffer_size: SHARD_SHUFFLE_SIZE,
            initial: SHARD_SHUFFLE_INITIAL,
        }
    }

    /// Defaults used for sample-level shuffling.
    pub fn samples() -> Self {
        Self {
            buffer_size: SAMPLE_SHUFFLE_SIZE,
            initial: SAMPLE_SHUFFLE_INITIAL,
        }
    }
}

/// Configuration of one single-source pipeline.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Base seed. Non-negative values make shard order identical across workers
    /// for a given epoch; negative values derive per-worker seeds.
    pub seed: i64,
    /// Samples per batch on one rank.
    pub batch_size: usize,
    /// Number of distributed ranks.
    pub world_size: usize,
    /// This process's rank.
    pub rank: usize,
    /// Loader worker threads per rank; `0` runs the pipeline inline.
    pub workers: usize,
    /// Training mode (shuffled, full batches, epoch-balanced) versus evaluation.
    pub is_train: bool,
    /// Draw shards with replacement instead of walking the static list.
    pub resampled: bool,
    /// Shards drawn per resampling pass; `None` draws without bound.
    pub resample_draws: Option<usize>,
    /// Round batch accounting down instead of up.
    pub floor: bool,
    /// In evaluation mode, also split shards across ranks.
    pub extract_features: bool,
    /// Shard-level reshuffler sizing.
    pub shard_shuffle: ShuffleConfig,
    /// Sample-level reshuffler sizing.
    pub sample_shuffle: ShuffleConfig,
    /// Lower-case field extensions before grouping.
    pub lowercase_extensions: bool,
    /// Optional allow-list of field extensions kept in samples.
    pub extensions: Option<Vec<String>>,
    /// Per-worker prefetch queue length.
    pub prefetch: usize,
    /// How recoverable shard, entry, and decode errors are handled.
    pub failure_policy: FailurePolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            batch_size: 64,
            world_size: 1,
            rank: 0,
            workers: 0,
            is_train: true,
            resampled: false,
            resample_draws: None,
            floor: false,
            extract_features: false,
            shard_shuffle: ShuffleConfig::shards(),
            sample_shuffle: ShuffleConfig::samples(),
            lowercase_extensions: true,
            extensions: None,
            prefetch: DEFAULT_PREFETCH,
            failure_policy: FailurePolicy::default(),
        }
    }
}

impl PipelineConfig {
    /// Parse a configuration from JSON; missing fields take their defaults.
    pub fn from_json(raw: &str) -> Result<Self, PipelineError> {
        let config: Self = serde_json::from_str(raw).map_err(|err| {
            PipelineError::configuration(format!("invalid pipeline config: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot produce batches.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.batch_size == 0 {
            return Err(PipelineError::configuration("batch_size must be positive"));
        }
        if self.world_size == 0 {
            return Err(PipelineError::configuration("world_size must be positive"));
        }
        if self.rank >= self.world_size {
            return Err(PipelineError::configuration(format!(
                "rank {} is outside world_size {}",
                self.rank, self.world_size
            )));
        }
        Ok(())
    }

    /// Worker count used for batch accounting (`max(1, workers)`).
    pub fn effective_workers(&self) -> usize {
        self.workers.max(1)
    }

    /// Identity of worker `worker_id` on this rank.
    pub fn worker_info(&self, worker_id: usize) -> WorkerInfo {
        WorkerInfo::new(
            self.rank,
            self.world_size,
            worker_id,
            self.effective_workers(),
            self.seed,
        )
    }
}

/// Configuration of a multi-source mixing session.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MixingConfig {
    /// Pick sources by sample-count share instead of round robin.
    pub weighted: bool,
    /// Epoch the session starts at.
    pub initial_epoch: u64,
    /// Total virtual-epoch sample budget split evenly across sources when no
    /// per-source counts are given.
    pub train_num_samples: Option<u64>,
    /// Per-source virtual-epoch sample counts, in source order.
    pub per_source_samples: Vec<u64>,
}

impl MixingConfig {
    /// Virtual-epoch sample count for each of `num_sources` sources.
    ///
    /// Uses `per_source_samples` when it names every source, otherwise splits
    /// `train_num_samples` evenly.
    pub fn source_sample_counts(&self, num_sources: usize) -> Vec<Option<u64>> {
        if num_sources > 0 && self.per_source_samples.len() == num_sources {
            return self.per_source_samples.iter().copied().map(Some).collect();
        }
        let share = self
            .train_num_samples
            .map(|total| total / num_sources.max(1) as u64);
        vec![share; num_sources]
    }
}

/// Identity of one loader worker, used to partition shards and derive seeds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerInfo {
    /// Distributed rank of the owning process.
    pub rank: usize,
    /// Number of distributed ranks.
    pub world_size: usize,
    /// Index of this worker on its rank.
    pub worker_id: usize,
    /// Number of workers on each rank.
    pub num_workers: usize,
    /// Worker-distinct seed used when the base seed is negative.
    pub seed: u64,
}

impl WorkerInfo {
    /// Build a worker identity whose seed is stable for a fixed `base_seed`.
    pub fn new(
        rank: usize,
        world_size: usize,
        worker_id: usize,
        num_workers: usize,
        base_seed: i64,
    ) -> Self {
        Self {
            rank,
            world_size,
            worker_id,
            num_workers,
            seed: worker_identity_seed(base_seed, rank, worker_id),
        }
    }

    /// Identity of the only worker of a single-process run.
    pub fn single(base_seed: i64) -> Self {
        Self::new(0, 1, 0, 1, base_seed)
    }
}

//! Epoch length accounting for training and evaluation pipelines.

use crate::errors::PipelineError;

/// Per-epoch sample and batch counts of one source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EpochPlan {
    /// Samples consumed per epoch across all ranks.
    pub num_samples: u64,
    /// Batches produced per epoch across all ranks.
    pub num_batches: u64,
    /// Batches each worker yields per epoch; `None` when the stream simply exhausts.
    pub worker_batches: Option<u64>,
}

fn round_div(numerator: u64, denominator: u64, floor: bool) -> u64 {
    if floor {
        numerator / denominator
    } else {
        numerator.div_ceil(denominator)
    }
}

/// Training plan: every worker yields exactly `worker_batches` full batches.
///
/// ```
/// use shardstream::accounting::training_plan;
///
/// let plan = training_plan(1000, 10, 2, 3, false).unwrap();
/// assert_eq!(plan.num_batches, 51);
/// assert_eq!(plan.num_samples, 1020);
/// assert_eq!(plan.worker_batches, Some(17));
/// ```
pub fn training_plan(
    declared_samples: u64,
    batch_size: usize,
    world_size: usize,
    workers: usize,
    floor: bool,
) -> Result<EpochPlan, PipelineError> {
    if batch_size == 0 || world_size == 0 {
        return Err(PipelineError::configuration(
            "batch_size and world_size must be positive",
        ));
    }
    let global_batch = (batch_size * world_size) as u64;
    let num_workers = workers.max(1) as u64;
    let num_batches = round_div(declared_samples, global_batch, floor);
    let worker_batches = round_div(num_batches, num_workers, floor);
    let num_batches = worker_batches * num_workers;
    Ok(EpochPlan {
        num_samples: num_batches * global_batch,
        num_batches,
        worker_batches: Some(worker_batches),
    })
}

/// Evaluation plan: the stream exhausts naturally with a short final batch.
pub fn evaluation_plan(declared_samples: u64, batch_size: usize) -> Result<EpochPlan, PipelineError> {
    if batch_size == 0 {
        return Err(PipelineError::configuration("batch_size must be positive"));
    }
    Ok(EpochPlan {
        num_samples: declared_samples,
        num_batches: declared_samples.div_ceil(batch_size as u64),
        worker_batches: None,
    })
}

/// Declared sample count: the manifest wins over the caller override.
///
/// Training with neither is a configuration error; evaluation declares zero.
pub fn resolve_declared_samples(
    manifest: Option<u64>,
    override_samples: Option<u64>,
    is_train: bool,
) -> Result<u64, PipelineError> {
    match manifest.or(override_samples) {
        Some(samples) => Ok(samples),
        None if is_train => Err(PipelineError::configuration(
            "training needs a sample count: none found in the manifest and none provided",
        )),
        None => Ok(0),
    }
}

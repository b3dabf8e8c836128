use std::io;

use thiserror::Error;

use crate::types::{SampleKey, ShardId, SourceId};

/// Error type for pipeline configuration, shard IO, decoding, and mixing failures.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("shard '{shard}' is unavailable: {reason}")]
    ShardUnavailable { shard: ShardId, reason: String },
    #[error("failed to decode sample '{key}' from shard '{shard}': {reason}")]
    Decode {
        key: SampleKey,
        shard: ShardId,
        reason: String,
    },
    #[error("malformed record in shard '{shard}': {details}")]
    MalformedRecord { shard: ShardId, details: String },
    #[error("source '{source_id}' was exhausted again right after its iterator was recreated")]
    Exhausted { source_id: SourceId },
    #[error("worker {worker_id} stopped unexpectedly")]
    WorkerStopped { worker_id: usize },
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl PipelineError {
    /// Shorthand for a [`PipelineError::Configuration`] error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Shorthand for a [`PipelineError::ShardUnavailable`] error.
    pub fn shard_unavailable(shard: impl Into<ShardId>, reason: impl ToString) -> Self {
        Self::ShardUnavailable {
            shard: shard.into(),
            reason: reason.to_string(),
        }
    }

    /// True for errors that are recovered locally by skipping a shard, entry, or sample.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::ShardUnavailable { .. }
                | PipelineError::Decode { .. }
                | PipelineError::MalformedRecord { .. }
                | PipelineError::Io(_)
        )
    }
}

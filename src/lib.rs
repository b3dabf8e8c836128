#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

/// Epoch length accounting for training and evaluation.
pub mod accounting;
/// Pipeline, shuffle, and mixing configuration types.
pub mod config;
/// Centralized constants used across shuffling, grouping, and mixing.
pub mod constants;
/// Entry, sample, and batch types.
pub mod data;
/// Shared epoch counter and epoch-change hooks.
pub mod epoch;
/// Reusable example runners shared by downstream crates.
pub mod example_apps;
mod hash;
/// Worker threads merged into one batch stream.
pub mod loader;
/// Aggregate metrics helpers.
pub mod metrics;
/// Multi-source mixing scheduler.
pub mod mixing;
/// Single-source pipeline and the batch-source interface.
pub mod pipeline;
/// Shard resampling with replacement.
pub mod resample;
mod rng;
/// Deterministic streaming reshuffler.
pub mod shuffle;
/// Shard listing and archive reading traits and built-in readers.
pub mod source;
/// Stage trait and the generic per-sample stages.
pub mod stage;
/// Input transports used by sources (local filesystem).
pub mod transport;
/// Shared type aliases.
pub mod types;

mod errors;

pub use config::{MixingConfig, PipelineConfig, ShuffleConfig, WorkerInfo};
pub use data::{Batch, Entry, Sample};
pub use epoch::{EpochNotify, SharedEpoch};
pub use errors::PipelineError;
pub use loader::WorkerLoader;
pub use mixing::{MixStep, MixedBatch, MixingLoader};
pub use pipeline::{BatchSource, BatchStream, SingleSourcePipeline, SourceSpec};
pub use resample::ResampledShards;
pub use rng::derive_seed;
pub use shuffle::DetShuffle;
pub use source::{ArchiveReader, InMemoryArchive, ManifestSize, ShardLister};
pub use stage::{FailurePolicy, Stage, StageOutcome};
pub use types::{EntryName, FieldName, ManifestSpec, SampleKey, ShardId, SourceId};

//! Single-source streaming pipeline and the batch-source interface the
//! mixing scheduler consumes.
//!
//! A pipeline owns one manifest. Building it lists the shards, resolves the
//! declared sample count, and fixes the epoch plan. Every call to
//! [`BatchSource::batches`] starts one fresh pass: each worker rebuilds its
//! stage chain, reads the current shared epoch, and yields its share of the
//! epoch's batches.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::accounting::{EpochPlan, evaluation_plan, resolve_declared_samples, training_plan};
use crate::config::{PipelineConfig, WorkerInfo};
use crate::constants::grouping::BARREN_SHARDS_PER_LISTED;
use crate::constants::shuffle::WORKER_SEED;
use crate::data::{Batch, Sample};
use crate::epoch::{EpochNotify, SharedEpoch};
use crate::errors::PipelineError;
use crate::loader::{WorkerLoader, WorkerTask};
use crate::resample::ResampledShards;
use crate::shuffle::DetShuffle;
use crate::source::utilities::grouping::{GroupSamples, KeyRule};
use crate::source::{ArchiveReader, ExpandShards, ShardLister};
use crate::stage::{
    Batcher, DecodeSamples, FilterSamples, Partition, SampleDecoder, SampleFilter, Stage, Stream,
    stream_of,
};
use crate::transport::{FsArchive, FsShardLister};
use crate::types::{ManifestSpec, ShardId, SourceId};

/// Stream of batches produced by one epoch pass.
pub type BatchStream<T> = Stream<Batch<T>>;

/// One named manifest and its optional sample-count override.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceSpec {
    /// Source identifier used in logs and mixed batches.
    pub id: SourceId,
    /// Manifest specification handed to the shard lister.
    pub manifest: ManifestSpec,
    /// Sample count used when the manifest does not declare one.
    pub num_samples: Option<u64>,
}

impl SourceSpec {
    /// Source without a sample-count override.
    pub fn new(id: impl Into<SourceId>, manifest: impl Into<ManifestSpec>) -> Self {
        Self {
            id: id.into(),
            manifest: manifest.into(),
            num_samples: None,
        }
    }

    /// Set the sample-count override.
    pub fn with_num_samples(mut self, num_samples: u64) -> Self {
        self.num_samples = Some(num_samples);
        self
    }
}

/// Anything the mixing scheduler can draw batches from.
pub trait BatchSource<T>: Send {
    /// Source identifier.
    fn id(&self) -> &str;
    /// Samples per epoch; drives weighted selection.
    fn num_samples(&self) -> u64;
    /// Batches per epoch.
    fn num_batches(&self) -> u64;
    /// Epoch counter read by this source's stages.
    fn epoch(&self) -> &SharedEpoch;
    /// Optional epoch-change hook.
    fn epoch_notifier(&self) -> Option<&dyn EpochNotify> {
        None
    }
    /// Publish `epoch` and notify the hook, if any.
    fn set_epoch(&mut self, epoch: u64) {
        self.epoch().set(epoch);
        if let Some(notifier) = self.epoch_notifier() {
            notifier.on_epoch_changed(epoch);
        }
    }
    /// Start a fresh epoch pass.
    fn batches(&mut self) -> Result<BatchStream<T>, PipelineError>;
}

/// Builder for [`SingleSourcePipeline`].
pub struct PipelineBuilder<T> {
    spec: SourceSpec,
    config: PipelineConfig,
    lister: Arc<dyn ShardLister>,
    reader: Arc<dyn ArchiveReader>,
    decoder: Option<Arc<dyn SampleDecoder<T>>>,
    filter: Option<Arc<dyn SampleFilter>>,
    notifier: Option<Arc<dyn EpochNotify>>,
    epoch: Option<SharedEpoch>,
    key_rule: Option<KeyRule>,
}

impl<T: Send + 'static> PipelineBuilder<T> {
    /// Replace the default configuration.
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Shard lister; defaults to [`FsShardLister`].
    pub fn lister(mut self, lister: Arc<dyn ShardLister>) -> Self {
        self.lister = lister;
        self
    }

    /// Archive reader; defaults to [`FsArchive`].
    pub fn reader(mut self, reader: Arc<dyn ArchiveReader>) -> Self {
        self.reader = reader;
        self
    }

    /// Sample decoder (required).
    pub fn decoder(mut self, decoder: Arc<dyn SampleDecoder<T>>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    /// Sample decoder given as a closure.
    pub fn decode_with<F>(self, decode: F) -> Self
    where
        F: Fn(Sample) -> Result<T, PipelineError> + Send + Sync + 'static,
    {
        self.decoder(Arc::new(decode))
    }

    /// Sample filter applied before decoding; invalid samples are always dropped.
    pub fn filter(mut self, filter: Arc<dyn SampleFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Sample filter given as a closure.
    pub fn filter_with<F>(self, keep: F) -> Self
    where
        F: Fn(&Sample) -> bool + Send + Sync + 'static,
    {
        self.filter(Arc::new(keep))
    }

    /// Hook called whenever the epoch is published through [`BatchSource::set_epoch`].
    pub fn notifier(mut self, notifier: Arc<dyn EpochNotify>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Share an existing epoch counter instead of creating one at epoch 0.
    pub fn epoch(mut self, epoch: SharedEpoch) -> Self {
        self.epoch = Some(epoch);
        self
    }

    /// Entry-name split rule used by the record grouper.
    pub fn key_rule(mut self, key_rule: KeyRule) -> Self {
        self.key_rule = Some(key_rule);
        self
    }

    /// List shards, resolve counts, and validate the configuration.
    pub fn build(self) -> Result<SingleSourcePipeline<T>, PipelineError> {
        let config = self.config;
        config.validate()?;
        let decoder = self.decoder.ok_or_else(|| {
            PipelineError::configuration(format!("source '{}' has no sample decoder", self.spec.id))
        })?;

        let shards = self.lister.list(&self.spec.manifest)?;
        let size = self.lister.size(&self.spec.manifest)?;
        let declared =
            resolve_declared_samples(size.total_samples, self.spec.num_samples, config.is_train)?;
        let plan = if config.is_train {
            training_plan(
                declared,
                config.batch_size,
                config.world_size,
                config.workers,
                config.floor,
            )?
        } else {
            evaluation_plan(declared, config.batch_size)?
        };

        if config.is_train && !config.resampled {
            let needed = config.effective_workers() * config.world_size;
            if shards.len() < needed {
                return Err(PipelineError::configuration(format!(
                    "source '{}' has {} shards but {} workers across {} ranks need at least {needed}",
                    self.spec.id,
                    shards.len(),
                    config.effective_workers(),
                    config.world_size,
                )));
            }
        }
        if config.resampled && shards.is_empty() {
            return Err(PipelineError::configuration(format!(
                "source '{}' has no shards to resample",
                self.spec.id
            )));
        }

        info!(
            source = %self.spec.id,
            shards = shards.len(),
            declared,
            num_samples = plan.num_samples,
            num_batches = plan.num_batches,
            worker_batches = ?plan.worker_batches,
            train = config.is_train,
            resampled = config.resampled,
            "built single-source pipeline"
        );

        let mut group = GroupSamples::new().with_lowercase(config.lowercase_extensions);
        if let Some(key_rule) = self.key_rule {
            group = group.with_key_rule(key_rule);
        }
        if let Some(extensions) = &config.extensions {
            group = group.with_extensions(extensions.iter().cloned());
        }

        Ok(SingleSourcePipeline {
            spec: self.spec,
            config,
            shards: shards.into(),
            plan,
            epoch: self.epoch.unwrap_or_default(),
            reader: self.reader,
            decoder,
            filter: self
                .filter
                .unwrap_or_else(|| Arc::new(|_: &Sample| true)),
            notifier: self.notifier,
            group,
        })
    }
}

/// Streaming pipeline over one manifest.
pub struct SingleSourcePipeline<T> {
    spec: SourceSpec,
    config: PipelineConfig,
    shards: Arc<[ShardId]>,
    plan: EpochPlan,
    epoch: SharedEpoch,
    reader: Arc<dyn ArchiveReader>,
    decoder: Arc<dyn SampleDecoder<T>>,
    filter: Arc<dyn SampleFilter>,
    notifier: Option<Arc<dyn EpochNotify>>,
    group: GroupSamples,
}

impl<T: Send + 'static> SingleSourcePipeline<T> {
    /// Start building a pipeline for `spec` with default configuration.
    pub fn builder(spec: SourceSpec) -> PipelineBuilder<T> {
        PipelineBuilder {
            spec,
            config: PipelineConfig::default(),
            lister: Arc::new(FsShardLister::new()),
            reader: Arc::new(FsArchive::new()),
            decoder: None,
            filter: None,
            notifier: None,
            epoch: None,
            key_rule: None,
        }
    }

    /// Listed shards in manifest order.
    pub fn shards(&self) -> &[ShardId] {
        &self.shards
    }

    /// Epoch plan fixed at build time.
    pub fn plan(&self) -> EpochPlan {
        self.plan
    }

    /// Pipeline configuration.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn worker_chain(&self, worker: WorkerInfo) -> Result<WorkerChain<T>, PipelineError> {
        let config = &self.config;
        let shard_source = if config.is_train && config.resampled {
            ShardSource::Resampled(ResampledShards::new(
                self.shards.to_vec(),
                config.resample_draws,
                true,
                WORKER_SEED,
                self.epoch.clone(),
                worker,
            )?)
        } else {
            ShardSource::Listed(Arc::clone(&self.shards))
        };
        let split_shards = !(config.is_train && config.resampled);
        let shard_shuffle = (config.is_train && !config.resampled).then(|| {
            DetShuffle::new(config.shard_shuffle, config.seed, self.epoch.clone(), worker)
        });
        let node_split = (split_shards && (config.is_train || config.extract_features))
            .then(|| Partition::new(worker.rank, worker.world_size));
        let worker_split = split_shards.then(|| Partition::new(worker.worker_id, worker.num_workers));
        let sample_shuffle = config.is_train.then(|| {
            DetShuffle::new(config.sample_shuffle, WORKER_SEED, self.epoch.clone(), worker)
        });
        let mut expand = ExpandShards::new(Arc::clone(&self.reader), config.failure_policy);
        if !split_shards {
            let limit = self.shards.len().saturating_mul(BARREN_SHARDS_PER_LISTED);
            expand = expand.with_barren_limit(limit);
        }

        Ok(WorkerChain {
            source_id: self.spec.id.clone(),
            worker,
            shard_source,
            shard_shuffle,
            node_split,
            worker_split,
            expand,
            group: self.group.clone(),
            sample_shuffle,
            filter: FilterSamples::new(Arc::clone(&self.filter)),
            decode: DecodeSamples::new(Arc::clone(&self.decoder), config.failure_policy),
            batcher: Batcher::new(config.batch_size, !config.is_train),
        })
    }

    fn worker_stream(&self, worker_id: usize) -> Result<BatchStream<T>, PipelineError> {
        let chain = self.worker_chain(self.config.worker_info(worker_id))?;
        Ok(match self.plan.worker_batches {
            Some(limit) => Box::new(EpochLimited::new(chain, limit)),
            None => {
                let mut chain = chain;
                chain.run()
            }
        })
    }
}

impl<T: Send + 'static> BatchSource<T> for SingleSourcePipeline<T> {
    fn id(&self) -> &str {
        &self.spec.id
    }

    fn num_samples(&self) -> u64 {
        self.plan.num_samples
    }

    fn num_batches(&self) -> u64 {
        self.plan.num_batches
    }

    fn epoch(&self) -> &SharedEpoch {
        &self.epoch
    }

    fn epoch_notifier(&self) -> Option<&dyn EpochNotify> {
        self.notifier.as_deref()
    }

    fn batches(&mut self) -> Result<BatchStream<T>, PipelineError> {
        debug!(
            source = %self.spec.id,
            epoch = self.epoch.get(),
            workers = self.config.workers,
            "starting epoch pass"
        );
        if self.config.workers == 0 {
            return self.worker_stream(0);
        }
        let mut tasks: Vec<WorkerTask<T>> = Vec::with_capacity(self.config.workers);
        for worker_id in 0..self.config.workers {
            let stream = self.worker_stream(worker_id)?;
            tasks.push(Box::new(move || stream));
        }
        Ok(Box::new(WorkerLoader::spawn(tasks, self.config.prefetch)?))
    }
}

enum ShardSource {
    Listed(Arc<[ShardId]>),
    Resampled(ResampledShards),
}

/// Stage instances of one worker; [`WorkerChain::run`] wires a fresh pass.
struct WorkerChain<T> {
    source_id: SourceId,
    worker: WorkerInfo,
    shard_source: ShardSource,
    shard_shuffle: Option<DetShuffle>,
    node_split: Option<Partition>,
    worker_split: Option<Partition>,
    expand: ExpandShards,
    group: GroupSamples,
    sample_shuffle: Option<DetShuffle>,
    filter: FilterSamples,
    decode: DecodeSamples<T>,
    batcher: Batcher,
}

impl<T: Send + 'static> WorkerChain<T> {
    fn run(&mut self) -> BatchStream<T> {
        let mut shards: Stream<ShardId> = match &mut self.shard_source {
            ShardSource::Listed(shards) => stream_of(shards.to_vec()),
            ShardSource::Resampled(resampler) => resampler.stream(),
        };
        if let Some(shuffle) = self.shard_shuffle.as_mut() {
            shards = shuffle.process(shards);
        }
        if let Some(split) = self.node_split.as_mut() {
            shards = split.process(shards);
        }
        if let Some(split) = self.worker_split.as_mut() {
            shards = split.process(shards);
        }
        let entries = self.expand.process(shards);
        let mut samples = self.group.process(entries);
        if let Some(shuffle) = self.sample_shuffle.as_mut() {
            samples = shuffle.process(samples);
        }
        let samples = self.filter.process(samples);
        let records = self.decode.process(samples);
        self.batcher.process(records)
    }
}

/// Repeats a worker's chain until it has yielded exactly `limit` batches.
///
/// A repetition that yields nothing ends the stream early.
struct EpochLimited<T> {
    chain: WorkerChain<T>,
    current: Option<BatchStream<T>>,
    remaining: u64,
    yielded_this_pass: bool,
}

impl<T: Send + 'static> EpochLimited<T> {
    fn new(chain: WorkerChain<T>, limit: u64) -> Self {
        Self {
            chain,
            current: None,
            remaining: limit,
            yielded_this_pass: false,
        }
    }
}

impl<T: Send + 'static> Iterator for EpochLimited<T> {
    type Item = Result<Batch<T>, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.remaining > 0 {
            if self.current.is_none() {
                self.current = Some(self.chain.run());
                self.yielded_this_pass = false;
            }
            let next = self.current.as_mut().and_then(Iterator::next);
            match next {
                Some(Ok(batch)) => {
                    self.remaining -= 1;
                    self.yielded_this_pass = true;
                    return Some(Ok(batch));
                }
                Some(Err(err)) => {
                    self.remaining = 0;
                    return Some(Err(err));
                }
                None if self.yielded_this_pass => {
                    self.current = None;
                }
                None => {
                    warn!(
                        source = %self.chain.source_id,
                        worker_id = self.chain.worker.worker_id,
                        missing = self.remaining,
                        "pass yielded no batches; ending the worker stream early"
                    );
                    self.remaining = 0;
                }
            }
        }
        None
    }
}

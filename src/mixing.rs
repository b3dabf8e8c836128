//! Multi-source mixing scheduler.
//!
//! The scheduler owns every sub-pipeline and one monotonic epoch counter. An
//! epoch is `num_batches()` pulls; the pass that reaches the end reports
//! [`MixStep::EpochComplete`] after publishing the next epoch to all sources.

use tracing::{debug, info};

use crate::config::MixingConfig;
use crate::constants::mixing::EXHAUSTION_RETRY_LIMIT;
use crate::data::Batch;
use crate::errors::PipelineError;
use crate::metrics::{SourceSkew, source_skew};
use crate::pipeline::{BatchSource, BatchStream};
use crate::rng::{DeterministicRng, pick_weighted};
use crate::types::SourceId;

/// A batch tagged with where and when it was drawn.
#[derive(Clone, Debug, PartialEq)]
pub struct MixedBatch<T> {
    /// Index of the source in the session.
    pub source_index: usize,
    /// Identifier of the source.
    pub source_id: SourceId,
    /// Epoch the batch was drawn in.
    pub epoch: u64,
    /// Position of the batch within its epoch.
    pub round: u64,
    /// The batch itself.
    pub batch: Batch<T>,
}

/// Result of one scheduler step.
#[derive(Debug)]
pub enum MixStep<T> {
    /// A batch drawn from one of the sources.
    Batch(MixedBatch<T>),
    /// The epoch ended; `epoch` is the newly started epoch.
    EpochComplete { epoch: u64 },
}

/// Interleaves batches from several sources under one epoch counter.
pub struct MixingLoader<T> {
    sources: Vec<Box<dyn BatchSource<T>>>,
    iters: Vec<Option<BatchStream<T>>>,
    weights: Option<Vec<f64>>,
    round: u64,
    epoch: u64,
    total_batches: u64,
    total_samples: u64,
    selections: Vec<u64>,
}

impl<T: Send + 'static> MixingLoader<T> {
    /// Session over `sources` starting at `epoch`.
    ///
    /// With `weighted`, sources are picked with probability proportional to
    /// their sample counts; otherwise in round robin.
    pub fn new(
        mut sources: Vec<Box<dyn BatchSource<T>>>,
        epoch: u64,
        weighted: bool,
    ) -> Result<Self, PipelineError> {
        if sources.is_empty() {
            return Err(PipelineError::configuration("mixing needs at least one source"));
        }
        let total_batches: u64 = sources.iter().map(|source| source.num_batches()).sum();
        if total_batches == 0 {
            return Err(PipelineError::configuration(
                "mixing needs a non-zero total batch count",
            ));
        }
        let total_samples: u64 = sources.iter().map(|source| source.num_samples()).sum();
        let weights = if weighted {
            if total_samples == 0 {
                return Err(PipelineError::configuration(
                    "weighted mixing needs a non-zero total sample count",
                ));
            }
            Some(
                sources
                    .iter()
                    .map(|source| source.num_samples() as f64 / total_samples as f64)
                    .collect::<Vec<_>>(),
            )
        } else {
            None
        };
        for source in sources.iter_mut() {
            source.set_epoch(epoch);
        }
        info!(
            sources = sources.len(),
            total_batches,
            total_samples,
            epoch,
            weights = ?weights,
            "built mixing session"
        );
        let count = sources.len();
        Ok(Self {
            sources,
            iters: (0..count).map(|_| None).collect(),
            weights,
            round: 0,
            epoch,
            total_batches,
            total_samples,
            selections: vec![0; count],
        })
    }

    /// Session configured by `config`.
    pub fn from_config(
        sources: Vec<Box<dyn BatchSource<T>>>,
        config: &MixingConfig,
    ) -> Result<Self, PipelineError> {
        Self::new(sources, config.initial_epoch, config.weighted)
    }

    /// Draw the next batch, or cross the epoch boundary.
    pub fn step(&mut self) -> Result<MixStep<T>, PipelineError> {
        if self.round >= self.total_batches {
            self.epoch += 1;
            self.round = 0;
            for source in self.sources.iter_mut() {
                source.set_epoch(self.epoch);
            }
            info!(epoch = self.epoch, "mixing epoch boundary");
            return Ok(MixStep::EpochComplete { epoch: self.epoch });
        }
        let index = self.select();
        let batch = self.pull(index)?;
        let round = self.round;
        self.round += 1;
        self.selections[index] += 1;
        Ok(MixStep::Batch(MixedBatch {
            source_index: index,
            source_id: self.sources[index].id().to_string(),
            epoch: self.epoch,
            round,
            batch,
        }))
    }

    /// Iterate the batches of the current epoch.
    pub fn epoch_pass(&mut self) -> EpochPass<'_, T> {
        EpochPass {
            loader: self,
            done: false,
        }
    }

    fn select(&self) -> usize {
        match &self.weights {
            Some(weights) => {
                let seed = self
                    .round
                    .wrapping_add(self.total_batches.wrapping_mul(self.epoch));
                let mut rng = DeterministicRng::new(seed);
                pick_weighted(&mut rng, weights)
            }
            None => (self.round % self.sources.len() as u64) as usize,
        }
    }

    fn pull(&mut self, index: usize) -> Result<Batch<T>, PipelineError> {
        let mut recreated = 0;
        loop {
            if self.iters[index].is_none() {
                self.iters[index] = Some(self.sources[index].batches()?);
            }
            if let Some(result) = self.iters[index].as_mut().and_then(Iterator::next) {
                return result;
            }
            self.iters[index] = None;
            let source_id = self.sources[index].id().to_string();
            if recreated >= EXHAUSTION_RETRY_LIMIT {
                return Err(PipelineError::Exhausted { source_id });
            }
            recreated += 1;
            debug!(source = %source_id, epoch = self.epoch, "source exhausted; recreating its iterator");
        }
    }

    /// Normalised selection weights, when weighted.
    pub fn weights(&self) -> Option<&[f64]> {
        self.weights.as_deref()
    }

    /// Batches drawn so far in the current epoch.
    pub fn round(&self) -> u64 {
        self.round
    }

    /// Current epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Total declared batches per epoch.
    pub fn num_batches(&self) -> u64 {
        self.total_batches
    }

    /// Total declared samples per epoch.
    pub fn len(&self) -> u64 {
        self.total_samples
    }

    /// True when the sources declare no samples.
    pub fn is_empty(&self) -> bool {
        self.total_samples == 0
    }

    /// Number of sources in the session.
    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Batches drawn from each source since the session started.
    pub fn selection_counts(&self) -> &[u64] {
        &self.selections
    }

    /// Skew of the selection counts against the weights.
    pub fn skew(&self) -> Option<SourceSkew> {
        let counts: Vec<(SourceId, u64)> = self
            .sources
            .iter()
            .zip(&self.selections)
            .map(|(source, count)| (source.id().to_string(), *count))
            .collect();
        source_skew(&counts, self.weights.as_deref())
    }
}

/// Iterator over one epoch of a [`MixingLoader`].
pub struct EpochPass<'a, T> {
    loader: &'a mut MixingLoader<T>,
    done: bool,
}

impl<T: Send + 'static> Iterator for EpochPass<'_, T> {
    type Item = Result<MixedBatch<T>, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.loader.step() {
            Ok(MixStep::Batch(batch)) => Some(Ok(batch)),
            Ok(MixStep::EpochComplete { .. }) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epoch::SharedEpoch;
    use crate::stage::stream_of;

    /// Source yielding `per_pass` single-item batches per iterator.
    struct FakeSource {
        id: String,
        num_samples: u64,
        num_batches: u64,
        per_pass: u64,
        passes: u64,
        epoch: SharedEpoch,
    }

    impl FakeSource {
        fn boxed(id: &str, num_samples: u64, num_batches: u64, per_pass: u64) -> Box<dyn BatchSource<u64>> {
            Box::new(Self {
                id: id.to_string(),
                num_samples,
                num_batches,
                per_pass,
                passes: 0,
                epoch: SharedEpoch::new(0),
            })
        }
    }

    impl BatchSource<u64> for FakeSource {
        fn id(&self) -> &str {
            &self.id
        }

        fn num_samples(&self) -> u64 {
            self.num_samples
        }

        fn num_batches(&self) -> u64 {
            self.num_batches
        }

        fn epoch(&self) -> &SharedEpoch {
            &self.epoch
        }

        fn batches(&mut self) -> Result<BatchStream<u64>, PipelineError> {
            self.passes += 1;
            let pass = self.passes;
            Ok(stream_of(
                (0..self.per_pass).map(move |idx| Batch::new(vec![pass * 100 + idx])),
            ))
        }
    }

    #[test]
    fn round_robin_alternates_sources() {
        let mut loader = MixingLoader::new(
            vec![FakeSource::boxed("a", 4, 2, 10), FakeSource::boxed("b", 4, 2, 10)],
            0,
            false,
        )
        .unwrap();
        let order: Vec<usize> = loader
            .epoch_pass()
            .map(|batch| batch.unwrap().source_index)
            .collect();
        assert_eq!(order, vec![0, 1, 0, 1]);
        assert_eq!(loader.epoch(), 1);
        assert_eq!(loader.round(), 0);
    }

    #[test]
    fn exhausted_source_is_recreated_once() {
        let mut loader =
            MixingLoader::new(vec![FakeSource::boxed("a", 5, 5, 2)], 0, false).unwrap();
        let firsts: Vec<u64> = loader
            .epoch_pass()
            .map(|batch| batch.unwrap().batch.samples[0])
            .collect();
        assert_eq!(firsts, vec![100, 101, 200, 201, 300]);
    }

    #[test]
    fn empty_source_is_fatal() {
        let mut loader =
            MixingLoader::new(vec![FakeSource::boxed("a", 5, 5, 0)], 0, false).unwrap();
        assert!(matches!(
            loader.step(),
            Err(PipelineError::Exhausted { source_id }) if source_id == "a"
        ));
    }

    #[test]
    fn construction_validates_the_session() {
        assert!(matches!(
            MixingLoader::<u64>::new(Vec::new(), 0, false),
            Err(PipelineError::Configuration(_))
        ));
        assert!(matches!(
            MixingLoader::new(vec![FakeSource::boxed("a", 5, 0, 1)], 0, false),
            Err(PipelineError::Configuration(_))
        ));
        assert!(matches!(
            MixingLoader::new(vec![FakeSource::boxed("a", 0, 3, 1)], 0, true),
            Err(PipelineError::Configuration(_))
        ));
    }

    #[test]
    fn weights_follow_sample_counts() {
        let loader = MixingLoader::new(
            vec![FakeSource::boxed("a", 100, 10, 10), FakeSource::boxed("b", 300, 30, 30)],
            0,
            true,
        )
        .unwrap();
        assert_eq!(loader.weights(), Some(&[0.25, 0.75][..]));
        assert_eq!(loader.len(), 400);
        assert_eq!(loader.num_batches(), 40);
    }

    #[test]
    fn weighted_selection_is_reproducible() {
        let run = || {
            let mut loader = MixingLoader::new(
                vec![FakeSource::boxed("a", 100, 10, 100), FakeSource::boxed("b", 300, 30, 100)],
                3,
                true,
            )
            .unwrap();
            loader
                .epoch_pass()
                .map(|batch| batch.unwrap().source_index)
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn construction_publishes_the_initial_epoch() {
        let epoch = SharedEpoch::new(0);
        let source: Box<dyn BatchSource<u64>> = Box::new(FakeSource {
            id: "a".into(),
            num_samples: 1,
            num_batches: 1,
            per_pass: 1,
            passes: 0,
            epoch: epoch.clone(),
        });
        let _loader = MixingLoader::new(vec![source], 7, false).unwrap();
        assert_eq!(epoch.get(), 7);
    }

    #[test]
    fn skew_tracks_selections() {
        let mut loader = MixingLoader::new(
            vec![FakeSource::boxed("a", 4, 2, 10), FakeSource::boxed("b", 4, 2, 10)],
            0,
            false,
        )
        .unwrap();
        for batch in loader.epoch_pass() {
            batch.unwrap();
        }
        assert_eq!(loader.selection_counts(), &[2, 2]);
        let skew = loader.skew().unwrap();
        assert_eq!(skew.total, 4);
        assert!((skew.ratio - 1.0).abs() < 1e-9);
    }
}

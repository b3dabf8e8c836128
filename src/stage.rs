//! Uniform stage interface and the generic stages of a single-source chain.
//!
//! Every stage consumes one boxed stream and returns another. Items are
//! `Result`s, but an `Err` travelling through a stream is always fatal:
//! recoverable failures are resolved inside the stage that hit them through
//! its [`FailurePolicy`] and never reach the consumer.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::data::{Batch, Sample};
use crate::errors::PipelineError;

/// Boxed stream of stage items; an `Err` item is fatal.
pub type Stream<T> = Box<dyn Iterator<Item = Result<T, PipelineError>> + Send>;

/// One step of a pipeline chain.
pub trait Stage<In, Out>: Send {
    /// Wrap `input` into this stage's output stream.
    fn process(&mut self, input: Stream<In>) -> Stream<Out>;
}

/// Tagged result of one fallible pull inside a stage.
#[derive(Debug)]
pub enum StageOutcome<T> {
    /// The pull produced an item.
    Item(T),
    /// The pull failed recoverably; the driving loop moves on.
    Skip(PipelineError),
    /// The pull failed fatally; the driving loop propagates it.
    Fatal(PipelineError),
}

/// How a stage treats recoverable failures.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Log transient errors and skip the shard, entry, or sample.
    #[default]
    LogAndContinue,
    /// Surface every error to the consumer.
    Propagate,
}

impl FailurePolicy {
    /// Classify the result of a pull made by `stage`.
    pub fn outcome<T>(self, stage: &str, result: Result<T, PipelineError>) -> StageOutcome<T> {
        match result {
            Ok(item) => StageOutcome::Item(item),
            Err(err) if self == FailurePolicy::LogAndContinue && err.is_transient() => {
                warn!(stage, error = %err, "ignoring recoverable pipeline error");
                StageOutcome::Skip(err)
            }
            Err(err) => StageOutcome::Fatal(err),
        }
    }
}

/// Keep every `count`-th item starting at `index`.
///
/// Used twice per chain: once across ranks, once across workers of a rank.
#[derive(Clone, Copy, Debug)]
pub struct Partition {
    index: usize,
    count: usize,
}

impl Partition {
    /// Partition selecting slot `index` of `count`.
    pub fn new(index: usize, count: usize) -> Self {
        Self {
            index,
            count: count.max(1),
        }
    }
}

impl<T: Send + 'static> Stage<T, T> for Partition {
    fn process(&mut self, input: Stream<T>) -> Stream<T> {
        if self.count == 1 {
            return input;
        }
        let (index, count) = (self.index, self.count);
        Box::new(
            input
                .enumerate()
                .filter(move |(position, _)| position % count == index)
                .map(|(_, item)| item),
        )
    }
}

/// Predicate deciding which grouped samples reach the decoder.
pub trait SampleFilter: Send + Sync {
    /// True to keep `sample`.
    fn keep(&self, sample: &Sample) -> bool;
}

impl<F> SampleFilter for F
where
    F: Fn(&Sample) -> bool + Send + Sync,
{
    fn keep(&self, sample: &Sample) -> bool {
        self(sample)
    }
}

/// Keeps samples that carry at least one field of every listed alternative set.
///
/// `RequireFields::new([["txt"], ["jpg", "png", "jpeg", "webp"]])` keeps
/// captioned images only.
#[derive(Clone, Debug, Default)]
pub struct RequireFields {
    groups: Vec<Vec<String>>,
}

impl RequireFields {
    /// Build from alternative sets of field names.
    pub fn new<G, F>(groups: G) -> Self
    where
        G: IntoIterator<Item = F>,
        F: IntoIterator,
        F::Item: Into<String>,
    {
        Self {
            groups: groups
                .into_iter()
                .map(|group| group.into_iter().map(Into::into).collect())
                .collect(),
        }
    }
}

impl SampleFilter for RequireFields {
    fn keep(&self, sample: &Sample) -> bool {
        self.groups
            .iter()
            .all(|group| group.iter().any(|field| sample.contains(field)))
    }
}

/// Turns grouped samples into training records.
pub trait SampleDecoder<T>: Send + Sync {
    /// Decode one sample; errors skip the sample under the default policy.
    fn decode(&self, sample: Sample) -> Result<T, PipelineError>;
}

impl<T, F> SampleDecoder<T> for F
where
    F: Fn(Sample) -> Result<T, PipelineError> + Send + Sync,
{
    fn decode(&self, sample: Sample) -> Result<T, PipelineError> {
        self(sample)
    }
}

/// Drops samples rejected by a [`SampleFilter`] (invalid samples always).
pub struct FilterSamples {
    filter: Arc<dyn SampleFilter>,
}

impl FilterSamples {
    /// Stage applying `filter`.
    pub fn new(filter: Arc<dyn SampleFilter>) -> Self {
        Self { filter }
    }
}

impl Stage<Sample, Sample> for FilterSamples {
    fn process(&mut self, input: Stream<Sample>) -> Stream<Sample> {
        let filter = Arc::clone(&self.filter);
        Box::new(input.filter(move |item| match item {
            Ok(sample) => sample.is_valid() && filter.keep(sample),
            Err(_) => true,
        }))
    }
}

/// Applies a [`SampleDecoder`] under a [`FailurePolicy`].
pub struct DecodeSamples<T> {
    decoder: Arc<dyn SampleDecoder<T>>,
    policy: FailurePolicy,
}

impl<T> DecodeSamples<T> {
    /// Stage applying `decoder`.
    pub fn new(decoder: Arc<dyn SampleDecoder<T>>, policy: FailurePolicy) -> Self {
        Self { decoder, policy }
    }
}

impl<T: Send + 'static> Stage<Sample, T> for DecodeSamples<T> {
    fn process(&mut self, input: Stream<Sample>) -> Stream<T> {
        let decoder = Arc::clone(&self.decoder);
        let policy = self.policy;
        Box::new(input.filter_map(move |item| {
            let sample = match item {
                Ok(sample) => sample,
                Err(err) => return Some(Err(err)),
            };
            match policy.outcome("decode", decoder.decode(sample)) {
                StageOutcome::Item(record) => Some(Ok(record)),
                StageOutcome::Skip(_) => None,
                StageOutcome::Fatal(err) => Some(Err(err)),
            }
        }))
    }
}

/// Collects records into batches of `batch_size`.
#[derive(Clone, Copy, Debug)]
pub struct Batcher {
    batch_size: usize,
    partial: bool,
}

impl Batcher {
    /// Batcher emitting a trailing short batch only when `partial` is set.
    pub fn new(batch_size: usize, partial: bool) -> Self {
        Self {
            batch_size: batch_size.max(1),
            partial,
        }
    }
}

impl<T: Send + 'static> Stage<T, Batch<T>> for Batcher {
    fn process(&mut self, input: Stream<T>) -> Stream<Batch<T>> {
        Box::new(BatchIter {
            input,
            batch_size: self.batch_size,
            partial: self.partial,
            done: false,
        })
    }
}

struct BatchIter<T> {
    input: Stream<T>,
    batch_size: usize,
    partial: bool,
    done: bool,
}

impl<T> Iterator for BatchIter<T> {
    type Item = Result<Batch<T>, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut samples = Vec::with_capacity(self.batch_size);
        while samples.len() < self.batch_size {
            match self.input.next() {
                Some(Ok(record)) => samples.push(record),
                Some(Err(err)) => {
                    self.done = true;
                    return Some(Err(err));
                }
                None => {
                    self.done = true;
                    break;
                }
            }
        }
        if samples.len() == self.batch_size || (self.partial && !samples.is_empty()) {
            Some(Ok(Batch::new(samples)))
        } else {
            None
        }
    }
}

/// Lift a plain iterator into a [`Stream`].
pub fn stream_of<T: 'static, I>(items: I) -> Stream<T>
where
    I: IntoIterator<Item = T>,
    I::IntoIter: Send + 'static,
{
    Box::new(items.into_iter().map(Ok))
}

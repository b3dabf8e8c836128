//! Deterministic bounded-memory streaming shuffle.

use rand::Rng;
use tracing::debug;

use crate::config::{ShuffleConfig, WorkerInfo};
use crate::epoch::EpochSource;
use crate::errors::PipelineError;
use crate::rng::{DeterministicRng, derive_seed};
use crate::stage::{Stage, Stream};

/// Reshuffler stage seeded from `(base_seed, epoch)` on every fresh iteration.
///
/// With a non-negative base seed every worker observing the same epoch gets
/// the same order, which keeps shard assignment consistent across ranks.
#[derive(Clone, Debug)]
pub struct DetShuffle {
    config: ShuffleConfig,
    base_seed: i64,
    epoch: EpochSource,
    worker: WorkerInfo,
}

impl DetShuffle {
    /// Reshuffler reading its epoch from `epoch`.
    pub fn new(
        config: ShuffleConfig,
        base_seed: i64,
        epoch: impl Into<EpochSource>,
        worker: WorkerInfo,
    ) -> Self {
        Self {
            config,
            base_seed,
            epoch: epoch.into(),
            worker,
        }
    }

    /// Start one iteration over `input`, consuming one epoch tick when the
    /// epoch source is local.
    pub fn shuffle<I>(&mut self, input: I) -> ShuffleIter<I::IntoIter>
    where
        I: IntoIterator,
    {
        let epoch = self.epoch.begin_iteration();
        let seed = derive_seed(self.base_seed, epoch, &self.worker);
        debug!(
            epoch,
            seed,
            buffer = self.config.buffer_size,
            initial = self.config.initial,
            "starting reshuffle pass"
        );
        ShuffleIter::new(input.into_iter(), self.config, DeterministicRng::new(seed))
    }
}

/// Only `Ok` items are buffered. An `Err` is emitted as soon as it is pulled
/// and ends the stream.
impl<T: Send + 'static> Stage<T, T> for DetShuffle {
    fn process(&mut self, input: Stream<T>) -> Stream<T> {
        Box::new(ShuffledStream {
            inner: self.shuffle(UntilError { input, error: None }),
            failed: false,
        })
    }
}

/// Yields the `Ok` items of a stream and parks the first `Err`.
struct UntilError<T> {
    input: Stream<T>,
    error: Option<PipelineError>,
}

impl<T> Iterator for UntilError<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.error.is_some() {
            return None;
        }
        match self.input.next()? {
            Ok(item) => Some(item),
            Err(err) => {
                self.error = Some(err);
                None
            }
        }
    }
}

struct ShuffledStream<T> {
    inner: ShuffleIter<UntilError<T>>,
    failed: bool,
}

impl<T> Iterator for ShuffledStream<T> {
    type Item = Result<T, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let item = self.inner.next();
        if let Some(err) = self.inner.input.error.take() {
            self.failed = true;
            return Some(Err(err));
        }
        item.map(Ok)
    }
}

/// Iterator produced by [`DetShuffle::shuffle`].
///
/// Holds at most `buffer_size` items. Nothing is emitted until `initial`
/// items are buffered; afterwards every pulled item takes the slot of a
/// uniformly chosen buffered item, which is emitted. While the buffer is
/// below capacity it grows by one item per emission. Once the input ends the
/// buffer drains in random order.
pub struct ShuffleIter<I: Iterator> {
    input: I,
    input_done: bool,
    buffer: Vec<I::Item>,
    capacity: usize,
    initial: usize,
    rng: DeterministicRng,
    primed: bool,
}

impl<I: Iterator> ShuffleIter<I> {
    fn new(input: I, config: ShuffleConfig, rng: DeterministicRng) -> Self {
        let capacity = config.buffer_size.max(1);
        let initial = config.initial.clamp(1, capacity);
        Self {
            input,
            input_done: false,
            buffer: Vec::with_capacity(initial),
            capacity,
            initial,
            rng,
            primed: false,
        }
    }

    fn pull(&mut self) -> Option<I::Item> {
        if self.input_done {
            return None;
        }
        let item = self.input.next();
        self.input_done = item.is_none();
        item
    }

    fn exchange(&mut self, item: I::Item) -> I::Item {
        if self.buffer.is_empty() {
            return item;
        }
        let slot = self.rng.random_range(0..self.buffer.len());
        std::mem::replace(&mut self.buffer[slot], item)
    }

    fn drain_one(&mut self) -> Option<I::Item> {
        if self.buffer.is_empty() {
            return None;
        }
        let slot = self.rng.random_range(0..self.buffer.len());
        Some(self.buffer.swap_remove(slot))
    }
}

impl<I: Iterator> Iterator for ShuffleIter<I> {
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.primed {
            self.primed = true;
            while self.buffer.len() < self.initial {
                match self.pull() {
                    Some(item) => self.buffer.push(item),
                    None => break,
                }
            }
        }
        let Some(item) = self.pull() else {
            return self.drain_one();
        };
        if self.buffer.len() < self.capacity {
            self.buffer.push(item);
            return match self.pull() {
                Some(extra) => Some(self.exchange(extra)),
                None => self.drain_one(),
            };
        }
        Some(self.exchange(item))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let (low, high) = if self.input_done {
            (0, Some(0))
        } else {
            self.input.size_hint()
        };
        let buffered = self.buffer.len();
        (
            low.saturating_add(buffered),
            high.and_then(|high| high.checked_add(buffered)),
        )
    }
}

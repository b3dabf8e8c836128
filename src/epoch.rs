use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Epoch counter shared between the coordinating thread and loader workers.
///
/// Exactly one owner calls [`SharedEpoch::set`] (the mixing scheduler, or the
/// single-source pipeline when unmixed); workers only read. Clones share the
/// same counter.
#[derive(Clone, Default)]
pub struct SharedEpoch {
    value: Arc<AtomicU64>,
}

impl SharedEpoch {
    /// Create a counter starting at `epoch`.
    pub fn new(epoch: u64) -> Self {
        Self {
            value: Arc::new(AtomicU64::new(epoch)),
        }
    }

    /// Current epoch.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// Publish a new epoch to every reader.
    pub fn set(&self, epoch: u64) {
        self.value.store(epoch, Ordering::Release);
    }
}

impl fmt::Debug for SharedEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SharedEpoch").field(&self.get()).finish()
    }
}

/// Capability of components that track a distributed partition per epoch.
///
/// Decided when a pipeline is built; the mixing scheduler calls it on every
/// epoch boundary.
pub trait EpochNotify: Send + Sync {
    /// Called after the session epoch changed to `epoch`.
    fn on_epoch_changed(&self, epoch: u64);
}

/// Where a reshuffler or resampler reads its epoch from.
#[derive(Clone, Debug)]
pub enum EpochSource {
    /// Read from a counter advanced by its owner.
    Shared(SharedEpoch),
    /// Standalone counter advanced once per fresh iteration, starting at 0.
    Local { next: u64 },
}

impl EpochSource {
    /// Standalone counter whose first iteration observes epoch 0.
    pub fn local() -> Self {
        EpochSource::Local { next: 0 }
    }

    /// Epoch for an iteration that is starting now.
    pub fn begin_iteration(&mut self) -> u64 {
        match self {
            EpochSource::Shared(shared) => shared.get(),
            EpochSource::Local { next } => {
                let epoch = *next;
                *next = next.saturating_add(1);
                epoch
            }
        }
    }
}

impl From<SharedEpoch> for EpochSource {
    fn from(shared: SharedEpoch) -> Self {
        EpochSource::Shared(shared)
    }
}

//! Background workers feeding one consumer in strict round-robin order.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;

use tracing::{debug, warn};

use crate::data::Batch;
use crate::errors::PipelineError;
use crate::stage::Stream;

/// Builds one worker's batch stream on the worker thread.
pub type WorkerTask<T> = Box<dyn FnOnce() -> Stream<Batch<T>> + Send>;

#[derive(Default)]
/// Loader runtime counters.
struct LoaderStats {
    produced: AtomicUsize,
    errors: AtomicUsize,
}

struct WorkerSlot<T> {
    worker_id: usize,
    receiver: Option<mpsc::Receiver<Result<Batch<T>, PipelineError>>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl<T> WorkerSlot<T> {
    /// Join a finished worker; true when it ended by panicking.
    fn join(&mut self) -> bool {
        self.receiver.take();
        match self.handle.take() {
            Some(handle) => handle.join().is_err(),
            None => false,
        }
    }
}

/// Runs each worker's stream on its own thread and merges their batches.
///
/// Batches are taken from workers in turn, one at a time; a worker whose
/// stream ended drops out of the rotation. Every worker queues at most
/// `prefetch` batches ahead of the consumer.
pub struct WorkerLoader<T> {
    slots: Vec<WorkerSlot<T>>,
    cursor: usize,
    stats: Arc<LoaderStats>,
    failed: bool,
}

impl<T: Send + 'static> WorkerLoader<T> {
    /// Spawn one thread per task.
    pub fn spawn(tasks: Vec<WorkerTask<T>>, prefetch: usize) -> Result<Self, PipelineError> {
        let stats = Arc::new(LoaderStats::default());
        let mut slots = Vec::with_capacity(tasks.len());
        for (worker_id, task) in tasks.into_iter().enumerate() {
            let (sender, receiver) = mpsc::sync_channel(prefetch.max(1));
            let stats_thread = Arc::clone(&stats);
            let handle = thread::Builder::new()
                .name(format!("shardstream-worker-{worker_id}"))
                .spawn(move || {
                    for result in task() {
                        if result.is_err() {
                            stats_thread.errors.fetch_add(1, Ordering::Relaxed);
                        }
                        if sender.send(result).is_err() {
                            return;
                        }
                        stats_thread.produced.fetch_add(1, Ordering::Relaxed);
                    }
                    debug!(worker_id, "worker stream exhausted");
                })?;
            slots.push(WorkerSlot {
                worker_id,
                receiver: Some(receiver),
                handle: Some(handle),
            });
        }
        Ok(Self {
            slots,
            cursor: 0,
            stats,
            failed: false,
        })
    }

    /// Number of workers still in the rotation.
    pub fn live_workers(&self) -> usize {
        self.slots.len()
    }

    /// Total number of batches handed over by the workers.
    pub fn produced_count(&self) -> usize {
        self.stats.produced.load(Ordering::Relaxed)
    }

    /// Total number of errors produced by the workers.
    pub fn error_count(&self) -> usize {
        self.stats.errors.load(Ordering::Relaxed)
    }
}

impl<T> Iterator for WorkerLoader<T> {
    type Item = Result<Batch<T>, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.failed && !self.slots.is_empty() {
            self.cursor %= self.slots.len();
            let slot = &mut self.slots[self.cursor];
            let received = slot
                .receiver
                .as_ref()
                .and_then(|receiver| receiver.recv().ok());
            match received {
                Some(result) => {
                    self.cursor += 1;
                    if result.is_err() {
                        self.failed = true;
                    }
                    return Some(result);
                }
                None => {
                    let worker_id = slot.worker_id;
                    let panicked = slot.join();
                    self.slots.remove(self.cursor);
                    if panicked {
                        warn!(worker_id, "worker thread panicked");
                        self.failed = true;
                        return Some(Err(PipelineError::WorkerStopped { worker_id }));
                    }
                }
            }
        }
        None
    }
}

impl<T> Drop for WorkerLoader<T> {
    fn drop(&mut self) {
        for slot in &mut self.slots {
            slot.receiver.take();
        }
        for slot in &mut self.slots {
            if let Some(handle) = slot.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::stream_of;

    fn task(worker: u32, batches: u32) -> WorkerTask<u32> {
        Box::new(move || {
            stream_of((0..batches).map(move |idx| Batch::new(vec![worker * 100 + idx])))
        })
    }

    fn firsts(loader: WorkerLoader<u32>) -> Vec<u32> {
        loader
            .map(|batch| batch.unwrap().samples[0])
            .collect()
    }

    #[test]
    fn merges_workers_round_robin() {
        let loader = WorkerLoader::spawn(vec![task(0, 2), task(1, 2), task(2, 2)], 2).unwrap();
        assert_eq!(firsts(loader), vec![0, 100, 200, 1, 101, 201]);
    }

    #[test]
    fn exhausted_workers_leave_the_rotation() {
        let loader = WorkerLoader::spawn(vec![task(0, 1), task(1, 3)], 1).unwrap();
        assert_eq!(firsts(loader), vec![0, 100, 101, 102]);
    }

    #[test]
    fn panicking_worker_surfaces_as_error() {
        let panicking: WorkerTask<u32> = Box::new(|| panic!("worker failed"));
        let mut loader = WorkerLoader::spawn(vec![panicking], 1).unwrap();
        assert!(matches!(
            loader.next(),
            Some(Err(PipelineError::WorkerStopped { worker_id: 0 }))
        ));
        assert!(loader.next().is_none());
    }

    #[test]
    fn dropping_the_loader_stops_unbounded_workers() {
        let endless: WorkerTask<u32> =
            Box::new(|| stream_of((0..).map(|idx| Batch::new(vec![idx]))));
        let mut loader = WorkerLoader::spawn(vec![endless], 1).unwrap();
        assert!(loader.next().is_some());
        drop(loader);
    }

    #[test]
    fn counts_produced_batches() {
        let mut loader = WorkerLoader::spawn(vec![task(0, 3)], 4).unwrap();
        while loader.next().is_some() {}
        assert_eq!(loader.produced_count(), 3);
        assert_eq!(loader.error_count(), 0);
    }
}

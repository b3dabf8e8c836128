//! Shard listing and archive reading interfaces.
//!
//! Ownership model:
//! - `ShardLister` turns a manifest specification into an ordered shard list
//!   and reports the manifest's declared size.
//! - `ArchiveReader` opens one shard and yields its raw entries in order.
//! - `ExpandShards` is the fault boundary between the two: a shard that cannot
//!   be opened or read is logged and skipped, never fatal.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::warn;

use crate::constants::grouping::{BARREN_SHARDS_MSG, SKIP_SHARD_MSG};
use crate::data::Entry;
use crate::errors::PipelineError;
use crate::stage::{FailurePolicy, Stage, StageOutcome, Stream};
use crate::types::{EntryName, ShardId};

/// Utility helpers used by the shard-to-sample stages.
pub mod utilities;

/// Declared size of a manifest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ManifestSize {
    /// Total samples across the listed shards, when the manifest records it.
    pub total_samples: Option<u64>,
    /// Number of listed shards.
    pub shard_count: usize,
}

/// Produces the ordered shard list of a manifest specification.
pub trait ShardLister: Send + Sync {
    /// Ordered shard identifiers named by `spec`.
    fn list(&self, spec: &str) -> Result<Vec<ShardId>, PipelineError>;
    /// Declared sample count and shard count of `spec`.
    fn size(&self, spec: &str) -> Result<ManifestSize, PipelineError>;
}

/// Raw `(filename, payload)` pairs of one opened shard.
pub type EntryIter = Box<dyn Iterator<Item = Result<(EntryName, Vec<u8>), PipelineError>> + Send>;

/// Opens shards and yields their entries in archive order.
pub trait ArchiveReader: Send + Sync {
    /// Open `shard`; failing here skips the shard.
    fn open(&self, shard: &str) -> Result<EntryIter, PipelineError>;
}

/// Fault boundary turning shard identifiers into a flat entry stream.
///
/// An open failure skips the shard; a read failure part way through skips
/// the rest of that shard. Both are logged.
pub struct ExpandShards {
    reader: Arc<dyn ArchiveReader>,
    policy: FailurePolicy,
    barren_limit: Option<usize>,
}

impl ExpandShards {
    /// Stage reading shards through `reader`.
    pub fn new(reader: Arc<dyn ArchiveReader>, policy: FailurePolicy) -> Self {
        Self {
            reader,
            policy,
            barren_limit: None,
        }
    }

    /// End the entry stream after `limit` consecutive shards yield no entry.
    ///
    /// Needed for unbounded shard streams, which would otherwise spin forever
    /// over a corpus whose shards are all unreadable.
    pub fn with_barren_limit(mut self, limit: usize) -> Self {
        self.barren_limit = Some(limit.max(1));
        self
    }
}

impl Stage<ShardId, Entry> for ExpandShards {
    fn process(&mut self, input: Stream<ShardId>) -> Stream<Entry> {
        Box::new(EntryStream {
            shards: input,
            reader: Arc::clone(&self.reader),
            policy: self.policy,
            current: None,
            current_yielded: false,
            barren: 0,
            barren_limit: self.barren_limit,
            failed: false,
        })
    }
}

struct EntryStream {
    shards: Stream<ShardId>,
    reader: Arc<dyn ArchiveReader>,
    policy: FailurePolicy,
    current: Option<(ShardId, EntryIter)>,
    current_yielded: bool,
    barren: usize,
    barren_limit: Option<usize>,
    failed: bool,
}

impl EntryStream {
    /// Count a shard that ended without yielding; false once the limit is hit.
    fn note_barren(&mut self, shard: &str) -> bool {
        self.barren += 1;
        match self.barren_limit {
            Some(limit) if self.barren >= limit => {
                warn!(shard = %shard, consecutive = self.barren, "{BARREN_SHARDS_MSG}");
                self.failed = true;
                false
            }
            _ => true,
        }
    }

    fn close_current(&mut self) -> bool {
        let Some((shard, _)) = self.current.take() else {
            return true;
        };
        if self.current_yielded {
            return true;
        }
        self.note_barren(&shard)
    }
}

impl Iterator for EntryStream {
    type Item = Result<Entry, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some((shard, entries)) = self.current.as_mut() {
                match entries.next() {
                    Some(read) => match self.policy.outcome("read_entry", read) {
                        StageOutcome::Item((filename, payload)) => {
                            let entry = Entry::new(filename, payload, shard.clone());
                            self.current_yielded = true;
                            self.barren = 0;
                            return Some(Ok(entry));
                        }
                        StageOutcome::Skip(_) => {
                            warn!(shard = %shard, "{SKIP_SHARD_MSG}: read failed, dropping the rest of the shard");
                            if !self.close_current() {
                                return None;
                            }
                        }
                        StageOutcome::Fatal(err) => {
                            self.failed = true;
                            return Some(Err(err));
                        }
                    },
                    None => {
                        if !self.close_current() {
                            return None;
                        }
                    }
                }
                continue;
            }
            let shard = match self.shards.next()? {
                Ok(shard) => shard,
                Err(err) => {
                    self.failed = true;
                    return Some(Err(err));
                }
            };
            match self.policy.outcome("open_shard", self.reader.open(&shard)) {
                StageOutcome::Item(entries) => {
                    self.current = Some((shard, entries));
                    self.current_yielded = false;
                }
                StageOutcome::Skip(_) => {
                    warn!(shard = %shard, "{SKIP_SHARD_MSG}: open failed");
                    if !self.note_barren(&shard) {
                        return None;
                    }
                }
                StageOutcome::Fatal(err) => {
                    self.failed = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

/// Archive reader and shard lister over shards held in memory.
///
/// Useful for tests and for feeding pre-fetched archives through the engine.
/// Shards can be marked broken (open fails) or truncated (a read fails after
/// a number of entries).
#[derive(Clone, Debug, Default)]
pub struct InMemoryArchive {
    shards: HashMap<ShardId, Vec<(EntryName, Vec<u8>)>>,
    order: Vec<ShardId>,
    broken: HashSet<ShardId>,
    truncated: HashMap<ShardId, usize>,
    total_samples: Option<u64>,
}

impl InMemoryArchive {
    /// Empty archive set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a shard holding `entries` in order.
    pub fn with_shard<N, E>(mut self, shard: impl Into<ShardId>, entries: E) -> Self
    where
        N: Into<EntryName>,
        E: IntoIterator<Item = (N, Vec<u8>)>,
    {
        let shard = shard.into();
        let entries = entries
            .into_iter()
            .map(|(name, payload)| (name.into(), payload))
            .collect();
        if !self.shards.contains_key(&shard) {
            self.order.push(shard.clone());
        }
        self.shards.insert(shard, entries);
        self
    }

    /// List a shard whose open always fails.
    pub fn with_broken_shard(mut self, shard: impl Into<ShardId>) -> Self {
        let shard = shard.into();
        if !self.order.contains(&shard) {
            self.order.push(shard.clone());
        }
        self.broken.insert(shard);
        self
    }

    /// Make reads of `shard` fail after `after` entries.
    pub fn with_truncation(mut self, shard: impl Into<ShardId>, after: usize) -> Self {
        self.truncated.insert(shard.into(), after);
        self
    }

    /// Declared sample count reported by [`ShardLister::size`].
    pub fn with_total_samples(mut self, total: u64) -> Self {
        self.total_samples = Some(total);
        self
    }

    /// Shard identifiers in insertion order.
    pub fn shard_ids(&self) -> Vec<ShardId> {
        self.order.clone()
    }
}

impl ArchiveReader for InMemoryArchive {
    fn open(&self, shard: &str) -> Result<EntryIter, PipelineError> {
        if self.broken.contains(shard) {
            return Err(PipelineError::shard_unavailable(shard, "shard is marked broken"));
        }
        let entries = self
            .shards
            .get(shard)
            .cloned()
            .ok_or_else(|| PipelineError::shard_unavailable(shard, "no such shard"))?;
        let fail_after = self.truncated.get(shard).copied();
        let shard_id = shard.to_string();
        let mut yielded = 0usize;
        let mut entries = entries.into_iter();
        Ok(Box::new(std::iter::from_fn(move || {
            if fail_after == Some(yielded) {
                yielded += 1;
                return Some(Err(PipelineError::shard_unavailable(
                    shard_id.clone(),
                    "truncated archive",
                )));
            }
            yielded += 1;
            entries.next().map(Ok)
        })))
    }
}

impl ShardLister for InMemoryArchive {
    fn list(&self, _spec: &str) -> Result<Vec<ShardId>, PipelineError> {
        Ok(self.order.clone())
    }

    fn size(&self, _spec: &str) -> Result<ManifestSize, PipelineError> {
        Ok(ManifestSize {
            total_samples: self.total_samples,
            shard_count: self.order.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::stream_of;

    fn names(stream: Stream<Entry>) -> Vec<String> {
        stream.map(|entry| entry.unwrap().filename).collect()
    }

    #[test]
    fn broken_shard_is_skipped() {
        let archive = InMemoryArchive::new()
            .with_shard("s0", [("a.txt", vec![1])])
            .with_broken_shard("s1")
            .with_shard("s2", [("b.txt", vec![2])]);
        let mut stage = ExpandShards::new(Arc::new(archive.clone()), FailurePolicy::default());
        let out = names(stage.process(stream_of(archive.shard_ids())));
        assert_eq!(out, vec!["a.txt", "b.txt"]);
    }

    #[test]
    fn truncated_shard_keeps_entries_read_so_far() {
        let archive = InMemoryArchive::new()
            .with_shard("s0", [("a.txt", vec![]), ("b.txt", vec![]), ("c.txt", vec![])])
            .with_truncation("s0", 2)
            .with_shard("s1", [("d.txt", vec![])]);
        let mut stage = ExpandShards::new(Arc::new(archive.clone()), FailurePolicy::default());
        let out = names(stage.process(stream_of(archive.shard_ids())));
        assert_eq!(out, vec!["a.txt", "b.txt", "d.txt"]);
    }

    #[test]
    fn propagate_policy_stops_at_broken_shard() {
        let archive = InMemoryArchive::new()
            .with_broken_shard("s0")
            .with_shard("s1", [("a.txt", vec![])]);
        let mut stage = ExpandShards::new(Arc::new(archive.clone()), FailurePolicy::Propagate);
        let mut out = stage.process(stream_of(archive.shard_ids()));
        assert!(matches!(
            out.next(),
            Some(Err(PipelineError::ShardUnavailable { .. }))
        ));
        assert!(out.next().is_none());
    }

    #[test]
    fn barren_limit_ends_an_endless_stream_of_broken_shards() {
        let archive = InMemoryArchive::new()
            .with_broken_shard("s0")
            .with_shard("s1", Vec::<(String, Vec<u8>)>::new());
        let mut stage =
            ExpandShards::new(Arc::new(archive), FailurePolicy::default()).with_barren_limit(6);
        let endless: Stream<ShardId> = Box::new(
            ["s0", "s1"]
                .into_iter()
                .cycle()
                .map(|shard| Ok(shard.to_string())),
        );
        assert!(stage.process(endless).next().is_none());
    }

    #[test]
    fn barren_count_resets_after_a_readable_shard() {
        let archive = InMemoryArchive::new()
            .with_broken_shard("bad")
            .with_shard("good", [("a.txt", vec![])]);
        let mut stage =
            ExpandShards::new(Arc::new(archive), FailurePolicy::default()).with_barren_limit(2);
        let shards = ["bad", "good", "bad", "good", "bad", "good"].map(String::from);
        let out = names(stage.process(stream_of(shards)));
        assert_eq!(out, vec!["a.txt", "a.txt", "a.txt"]);
    }

    #[test]
    fn entries_carry_their_shard() {
        let archive = InMemoryArchive::new().with_shard("s7", [("x.jpg", vec![9])]);
        let mut stage = ExpandShards::new(Arc::new(archive.clone()), FailurePolicy::default());
        let entry = stage
            .process(stream_of(archive.shard_ids()))
            .next()
            .unwrap()
            .unwrap();
        assert_eq!(entry, Entry::new("x.jpg", vec![9], "s7"));
    }
}

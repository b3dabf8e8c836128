use indexmap::IndexMap;

pub use crate::types::{EntryName, FieldName, SampleKey, ShardId, SourceId};

/// One `(filename, payload)` unit read from a shard.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    /// Entry name inside the archive.
    pub filename: EntryName,
    /// Raw entry bytes.
    pub payload: Vec<u8>,
    /// Shard the entry was read from.
    pub shard: ShardId,
}

impl Entry {
    /// Build an entry read from `shard`.
    pub fn new(filename: impl Into<EntryName>, payload: Vec<u8>, shard: impl Into<ShardId>) -> Self {
        Self {
            filename: filename.into(),
            payload,
            shard: shard.into(),
        }
    }
}

/// One logical record assembled from entries sharing a key prefix.
///
/// Fields keep the order their entries appeared in the shard.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sample {
    /// Group prefix shared by every field.
    pub key: SampleKey,
    /// Shard the first entry of the group came from.
    pub shard: ShardId,
    /// Field extension to payload.
    pub fields: IndexMap<FieldName, Vec<u8>>,
}

impl Sample {
    /// Empty sample for `key`.
    pub fn new(key: impl Into<SampleKey>, shard: impl Into<ShardId>) -> Self {
        Self {
            key: key.into(),
            shard: shard.into(),
            fields: IndexMap::new(),
        }
    }

    /// A sample is emitted only when it holds at least one content field.
    pub fn is_valid(&self) -> bool {
        !self.fields.is_empty()
    }

    /// Payload of `field`, if present.
    pub fn get(&self, field: &str) -> Option<&[u8]> {
        self.fields.get(field).map(Vec::as_slice)
    }

    /// True when `field` is present.
    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    /// Store or overwrite `field`.
    pub fn insert(&mut self, field: impl Into<FieldName>, payload: Vec<u8>) {
        self.fields.insert(field.into(), payload);
    }

    /// Field names in insertion order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }
}

/// Ordered group of decoded records handed to the training loop.
#[derive(Clone, Debug, PartialEq)]
pub struct Batch<T> {
    /// Decoded records in stream order.
    pub samples: Vec<T>,
}

impl<T> Batch<T> {
    /// Wrap already-collected records.
    pub fn new(samples: Vec<T>) -> Self {
        Self { samples }
    }

    /// Number of records in the batch.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True when the batch holds no records.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

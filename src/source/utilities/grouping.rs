//! Groups consecutive archive entries that share a key prefix into samples.
//!
//! Grouping is streaming: at most one in-flight sample is held. A new sample
//! starts when the prefix changes or when an extension repeats inside the
//! current sample, which keeps adjacent shards with colliding keys apart.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use crate::constants::grouping::SKIP_UNKEYED_MSG;
use crate::data::{Entry, Sample};
use crate::errors::PipelineError;
use crate::stage::{Stage, Stream};

/// Splits an entry name into `(prefix, extension)`.
pub type KeyRule = Arc<dyn Fn(&str) -> Option<(String, String)> + Send + Sync>;

/// Split `path` at the first `.` of its basename.
///
/// The prefix keeps any directory part. Names whose basename has no dot, or
/// starts with one, have no prefix.
///
/// ```
/// use shardstream::source::utilities::grouping::base_plus_ext;
///
/// assert_eq!(base_plus_ext("dir/0001.seg.jpg"), Some(("dir/0001", "seg.jpg")));
/// assert_eq!(base_plus_ext("README"), None);
/// assert_eq!(base_plus_ext("dir/.hidden"), None);
/// ```
pub fn base_plus_ext(path: &str) -> Option<(&str, &str)> {
    let base_start = path.rfind('/').map_or(0, |idx| idx + 1);
    let dot = path[base_start..].find('.')?;
    if dot == 0 {
        return None;
    }
    let split = base_start + dot;
    Some((&path[..split], &path[split + 1..]))
}

/// [`KeyRule`] wrapping [`base_plus_ext`].
pub fn default_key_rule() -> KeyRule {
    Arc::new(|name: &str| {
        base_plus_ext(name).map(|(prefix, ext)| (prefix.to_string(), ext.to_string()))
    })
}

/// Iterator assembling samples from an entry stream.
pub struct GroupByKeys<I> {
    entries: I,
    key_rule: KeyRule,
    lowercase: bool,
    allowed: Option<Arc<HashSet<String>>>,
    current: Option<Sample>,
    finished: bool,
}

impl<I> GroupByKeys<I>
where
    I: Iterator<Item = Result<Entry, PipelineError>>,
{
    /// Group `entries` using `key_rule`.
    pub fn new(
        entries: I,
        key_rule: KeyRule,
        lowercase: bool,
        allowed: Option<Arc<HashSet<String>>>,
    ) -> Self {
        Self {
            entries,
            key_rule,
            lowercase,
            allowed,
            current: None,
            finished: false,
        }
    }

    fn take_valid(&mut self) -> Option<Sample> {
        self.current.take().filter(Sample::is_valid)
    }
}

impl<I> Iterator for GroupByKeys<I>
where
    I: Iterator<Item = Result<Entry, PipelineError>>,
{
    type Item = Result<Sample, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            let entry = match self.entries.next() {
                Some(Ok(entry)) => entry,
                Some(Err(err)) => {
                    self.finished = true;
                    return Some(Err(err));
                }
                None => {
                    self.finished = true;
                    return self.take_valid().map(Ok);
                }
            };
            let Some((prefix, mut extension)) = (self.key_rule)(&entry.filename) else {
                debug!(filename = %entry.filename, shard = %entry.shard, "{SKIP_UNKEYED_MSG}");
                continue;
            };
            if self.lowercase {
                extension = extension.to_lowercase();
            }

            let starts_new = match &self.current {
                None => true,
                Some(sample) => sample.key != prefix || sample.contains(&extension),
            };
            let mut emitted = None;
            if starts_new {
                emitted = self.take_valid();
                self.current = Some(Sample::new(prefix, entry.shard));
            }
            let keep = self
                .allowed
                .as_ref()
                .is_none_or(|allowed| allowed.contains(&extension));
            if keep && let Some(sample) = self.current.as_mut() {
                sample.insert(extension, entry.payload);
            }
            if let Some(sample) = emitted {
                return Some(Ok(sample));
            }
        }
    }
}

/// Stage wrapping [`GroupByKeys`].
#[derive(Clone)]
pub struct GroupSamples {
    key_rule: KeyRule,
    lowercase: bool,
    allowed: Option<Arc<HashSet<String>>>,
}

impl GroupSamples {
    /// Grouper using the default key rule and lower-cased extensions.
    pub fn new() -> Self {
        Self {
            key_rule: default_key_rule(),
            lowercase: true,
            allowed: None,
        }
    }

    /// Replace the key rule.
    pub fn with_key_rule(mut self, key_rule: KeyRule) -> Self {
        self.key_rule = key_rule;
        self
    }

    /// Toggle extension lower-casing.
    pub fn with_lowercase(mut self, lowercase: bool) -> Self {
        self.lowercase = lowercase;
        self
    }

    /// Keep only the listed extensions; other entries still delimit samples.
    pub fn with_extensions<E>(mut self, extensions: E) -> Self
    where
        E: IntoIterator,
        E::Item: Into<String>,
    {
        self.allowed = Some(Arc::new(extensions.into_iter().map(Into::into).collect()));
        self
    }
}

impl Default for GroupSamples {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage<Entry, Sample> for GroupSamples {
    fn process(&mut self, input: Stream<Entry>) -> Stream<Sample> {
        Box::new(GroupByKeys::new(
            input,
            Arc::clone(&self.key_rule),
            self.lowercase,
            self.allowed.clone(),
        ))
    }
}

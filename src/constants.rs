/// Constants used by the shard-level and sample-level reshufflers.
pub mod shuffle {
    /// Buffer capacity of the shard-level reshuffler.
    pub const SHARD_SHUFFLE_SIZE: usize = 2000;
    /// Items buffered before the shard-level reshuffler starts emitting.
    pub const SHARD_SHUFFLE_INITIAL: usize = 500;
    /// Buffer capacity of the sample-level reshuffler.
    pub const SAMPLE_SHUFFLE_SIZE: usize = 5000;
    /// Items buffered before the sample-level reshuffler starts emitting.
    pub const SAMPLE_SHUFFLE_INITIAL: usize = 1000;
    /// Base seed value meaning "derive the seed from the worker identity".
    pub const WORKER_SEED: i64 = -1;
}

/// Constants used by worker identity and seed derivation.
pub mod worker {
    /// Domain tag mixed into worker identity seeds.
    pub const WORKER_SEED_DOMAIN: &str = "shardstream::worker";
    /// Bounded per-worker queue length used by the worker loader.
    pub const DEFAULT_PREFETCH: usize = 2;
}

/// Constants used by the record grouper.
pub mod grouping {
    /// Log message used when an entry name has no determinable prefix.
    pub const SKIP_UNKEYED_MSG: &str = "skipping entry without a sample prefix";
    /// Log message used when a shard cannot be opened or expanded.
    pub const SKIP_SHARD_MSG: &str = "skipping unreadable shard";
    /// Log message used when an unbounded shard stream stops yielding entries.
    pub const BARREN_SHARDS_MSG: &str = "no entries from consecutive shards; ending the pass";
    /// Consecutive empty shards tolerated per listed shard before a resampled pass ends.
    pub const BARREN_SHARDS_PER_LISTED: usize = 4;
}

/// Constants used by manifest size lookup and shard listing.
pub mod manifest {
    /// Per-shard sample count file stored next to the shards.
    pub const SIZES_FILENAME: &str = "sizes.json";
    /// Total sample count file stored next to the shards.
    pub const LEN_FILENAME: &str = "__len__";
    /// Separator between independent manifest specifications.
    pub const SPEC_SEPARATOR: char = ';';
    /// Archive extension recognised when listing a shard root directory.
    pub const ARCHIVE_EXTENSION: &str = "tar";
}

/// Constants used by the mixing scheduler.
pub mod mixing {
    /// Number of iterator recreations attempted for an exhausted source within one pull.
    pub const EXHAUSTION_RETRY_LIMIT: usize = 1;
}

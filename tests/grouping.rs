use std::sync::Arc;

use shardstream::source::utilities::grouping::GroupSamples;
use shardstream::source::{ExpandShards, InMemoryArchive};
use shardstream::stage::stream_of;
use shardstream::{FailurePolicy, Sample, Stage};

fn grouped(archive: InMemoryArchive) -> Vec<Sample> {
    let shards = archive.shard_ids();
    let mut expand = ExpandShards::new(Arc::new(archive), FailurePolicy::default());
    let mut group = GroupSamples::new();
    group
        .process(expand.process(stream_of(shards)))
        .map(|sample| sample.expect("no fatal errors"))
        .collect()
}

#[test]
fn entries_sharing_a_prefix_become_one_sample() {
    let samples = grouped(InMemoryArchive::new().with_shard(
        "s0",
        [
            ("a.jpg", b"b1".to_vec()),
            ("a.txt", b"b2".to_vec()),
            ("b.jpg", b"b3".to_vec()),
        ],
    ));
    assert_eq!(samples.len(), 2);
    assert_eq!(samples[0].key, "a");
    assert_eq!(samples[0].get("jpg"), Some(&b"b1"[..]));
    assert_eq!(samples[0].get("txt"), Some(&b"b2"[..]));
    assert_eq!(samples[1].key, "b");
    assert_eq!(samples[1].get("jpg"), Some(&b"b3"[..]));
    assert_eq!(samples[1].fields.len(), 1);
}

#[test]
fn repeated_extension_splits_the_group() {
    let samples = grouped(InMemoryArchive::new().with_shard(
        "s0",
        [("a.jpg", b"b1".to_vec()), ("a.jpg", b"b2".to_vec())],
    ));
    assert_eq!(samples.len(), 2);
    assert_eq!(samples[0].get("jpg"), Some(&b"b1"[..]));
    assert_eq!(samples[1].get("jpg"), Some(&b"b2"[..]));
}

#[test]
fn keys_colliding_across_adjacent_shards_stay_apart() {
    let samples = grouped(
        InMemoryArchive::new()
            .with_shard("s0", [("x/0.jpg", vec![0]), ("x/0.txt", vec![0])])
            .with_shard("s1", [("x/0.jpg", vec![1]), ("x/0.txt", vec![1])]),
    );
    let shards: Vec<&str> = samples.iter().map(|sample| sample.shard.as_str()).collect();
    assert_eq!(shards, vec!["s0", "s1"]);
}

#[test]
fn groups_without_stored_fields_are_not_emitted() {
    let shards = InMemoryArchive::new().with_shard(
        "s0",
        [("a.jpg", vec![1]), ("b.json", vec![2]), ("c.jpg", vec![3])],
    );
    let ids = shards.shard_ids();
    let mut expand = ExpandShards::new(Arc::new(shards), FailurePolicy::default());
    let mut group = GroupSamples::new().with_extensions(["jpg"]);
    let keys: Vec<String> = group
        .process(expand.process(stream_of(ids)))
        .map(|sample| sample.unwrap().key)
        .collect();
    assert_eq!(keys, vec!["a", "c"]);
}

#[test]
fn unreadable_shards_are_skipped_and_the_stream_continues() {
    let samples = grouped(
        InMemoryArchive::new()
            .with_shard("s0", [("a.txt", vec![])])
            .with_broken_shard("s1")
            .with_shard("s2", [("b.txt", vec![]), ("c.txt", vec![]), ("d.txt", vec![])])
            .with_truncation("s2", 1)
            .with_shard("s3", [("e.txt", vec![])]),
    );
    let keys: Vec<&str> = samples.iter().map(|sample| sample.key.as_str()).collect();
    assert_eq!(keys, vec!["a", "b", "e"]);
}

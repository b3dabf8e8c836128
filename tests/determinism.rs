use std::sync::Arc;

use shardstream::{
    BatchSource, DetShuffle, InMemoryArchive, PipelineConfig, ResampledShards, SharedEpoch,
    ShuffleConfig, SingleSourcePipeline, SourceSpec, WorkerInfo,
};

fn shuffle_config() -> ShuffleConfig {
    ShuffleConfig {
        buffer_size: 100,
        initial: 20,
    }
}

fn reshuffle(seed: i64, epoch: u64, worker: WorkerInfo) -> Vec<u32> {
    let mut stage = DetShuffle::new(shuffle_config(), seed, SharedEpoch::new(epoch), worker);
    stage.shuffle(0..500u32).collect()
}

#[test]
fn reshuffle_is_reproducible_for_seed_and_epoch() {
    let worker = WorkerInfo::single(42);
    assert_eq!(reshuffle(42, 3, worker), reshuffle(42, 3, worker));
}

#[test]
fn reshuffle_differs_between_epochs() {
    let worker = WorkerInfo::single(42);
    assert_ne!(reshuffle(42, 0, worker), reshuffle(42, 1, worker));
}

#[test]
fn non_negative_seed_ignores_worker_identity() {
    let first = WorkerInfo::new(0, 2, 0, 4, 7);
    let second = WorkerInfo::new(1, 2, 3, 4, 7);
    assert_eq!(reshuffle(7, 2, first), reshuffle(7, 2, second));
}

#[test]
fn negative_seed_gives_each_worker_its_own_order() {
    let first = WorkerInfo::new(0, 1, 0, 2, -1);
    let second = WorkerInfo::new(0, 1, 1, 2, -1);
    assert_ne!(reshuffle(-1, 0, first), reshuffle(-1, 0, second));
}

#[test]
fn deterministic_resampling_repeats_its_draws() {
    let shards: Vec<String> = vec!["s1".into(), "s2".into(), "s3".into()];
    let draw = || {
        let mut resampler = ResampledShards::new(
            shards.clone(),
            Some(5),
            true,
            11,
            SharedEpoch::new(0),
            WorkerInfo::single(11),
        )
        .unwrap();
        resampler.draws().collect::<Vec<_>>()
    };
    let first = draw();
    assert_eq!(first.len(), 5);
    assert_eq!(first, draw());
}

fn corpus() -> Arc<InMemoryArchive> {
    let mut archive = InMemoryArchive::new().with_total_samples(60);
    for shard in 0..6 {
        let entries: Vec<(String, Vec<u8>)> = (0..10)
            .flat_map(|idx| {
                [
                    (format!("{shard}/{idx:02}.txt"), vec![shard as u8]),
                    (format!("{shard}/{idx:02}.jpg"), vec![idx as u8]),
                ]
            })
            .collect();
        archive = archive.with_shard(format!("shard-{shard}"), entries);
    }
    Arc::new(archive)
}

fn pipeline(workers: usize, seed: i64) -> SingleSourcePipeline<String> {
    let archive = corpus();
    let config = PipelineConfig {
        batch_size: 5,
        workers,
        seed,
        shard_shuffle: shuffle_config(),
        sample_shuffle: shuffle_config(),
        ..PipelineConfig::default()
    };
    SingleSourcePipeline::builder(SourceSpec::new("corpus", "mem"))
        .config(config)
        .lister(archive.clone())
        .reader(archive)
        .decode_with(|sample| Ok(sample.key))
        .build()
        .unwrap()
}

fn epoch_keys(pipeline: &mut SingleSourcePipeline<String>) -> Vec<Vec<String>> {
    pipeline
        .batches()
        .unwrap()
        .map(|batch| batch.unwrap().samples)
        .collect()
}

#[test]
fn worker_pool_output_is_identical_across_runs() {
    let first = epoch_keys(&mut pipeline(3, 5));
    let second = epoch_keys(&mut pipeline(3, 5));
    assert_eq!(first.len(), 12);
    assert_eq!(first, second);
}

#[test]
fn worker_pool_covers_every_sample_once_per_epoch() {
    let mut keys: Vec<String> = epoch_keys(&mut pipeline(3, 5)).concat();
    keys.sort();
    keys.dedup();
    assert_eq!(keys.len(), 60);
}

#[test]
fn publishing_a_new_epoch_reorders_the_next_pass() {
    let mut pipeline = pipeline(2, 5);
    let first = epoch_keys(&mut pipeline);
    pipeline.set_epoch(1);
    let second = epoch_keys(&mut pipeline);
    assert_eq!(first.len(), second.len());
    assert_ne!(first, second);
}

use std::fs;
use std::path::Path;

use tempfile::tempdir;

use shardstream::source::ShardLister;
use shardstream::transport::FsShardLister;
use shardstream::{BatchSource, PipelineConfig, PipelineError, SingleSourcePipeline, SourceSpec};

/// Write `shards` shard directories of `per_shard` image/caption pairs.
fn write_corpus(root: &Path, shards: usize, per_shard: usize) {
    for shard in 0..shards {
        let dir = root.join(format!("{shard:03}"));
        fs::create_dir_all(&dir).unwrap();
        for idx in 0..per_shard {
            let key = format!("{shard:03}{idx:04}");
            fs::write(dir.join(format!("{key}.jpg")), [shard as u8, idx as u8]).unwrap();
            fs::write(dir.join(format!("{key}.TXT")), format!("caption {key}")).unwrap();
        }
    }
}

fn caption(sample: shardstream::Sample) -> Result<String, PipelineError> {
    let text = sample.get("txt").ok_or_else(|| PipelineError::Decode {
        key: sample.key.clone(),
        shard: sample.shard.clone(),
        reason: "missing caption".into(),
    })?;
    Ok(String::from_utf8_lossy(text).into_owned())
}

#[test]
fn evaluation_over_directory_shards_reads_every_sample_in_order() {
    let dir = tempdir().unwrap();
    write_corpus(dir.path(), 3, 4);
    let spec = format!("{}/{{000..002}}", dir.path().display());
    let mut pipeline = SingleSourcePipeline::builder(SourceSpec::new("captions", spec))
        .config(PipelineConfig {
            batch_size: 5,
            is_train: false,
            ..PipelineConfig::default()
        })
        .decode_with(caption)
        .build()
        .unwrap();
    let batches: Vec<Vec<String>> = pipeline
        .batches()
        .unwrap()
        .map(|batch| batch.unwrap().samples)
        .collect();
    let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![5, 5, 2]);
    let captions = batches.concat();
    assert_eq!(captions[0], "caption 0000000");
    assert_eq!(captions[11], "caption 0020003");
}

#[test]
fn training_counts_come_from_sizes_json() {
    let dir = tempdir().unwrap();
    write_corpus(dir.path(), 4, 5);
    fs::write(
        dir.path().join("sizes.json"),
        r#"{"000": 5, "001": 5, "002": "5", "003": 5}"#,
    )
    .unwrap();
    let spec = format!("{}/{{000..003}}", dir.path().display());
    let mut pipeline = SingleSourcePipeline::builder(
        SourceSpec::new("captions", spec).with_num_samples(1_000_000),
    )
    .config(PipelineConfig {
        batch_size: 3,
        workers: 2,
        seed: 9,
        ..PipelineConfig::default()
    })
    .decode_with(caption)
    .build()
    .unwrap();
    // 20 samples, batch 3: ceil(20 / 3) = 7 batches, rounded up to 8 across two workers.
    assert_eq!(pipeline.num_batches(), 8);
    assert_eq!(pipeline.num_samples(), 24);
    let batches: Vec<Vec<String>> = pipeline
        .batches()
        .unwrap()
        .map(|batch| batch.unwrap().samples)
        .collect();
    assert_eq!(batches.len(), 8);
    assert!(batches.iter().all(|batch| batch.len() == 3));
}

#[test]
fn missing_shard_directories_are_skipped() {
    let dir = tempdir().unwrap();
    write_corpus(dir.path(), 2, 3);
    let spec = format!("{}/{{000..003}}", dir.path().display());
    let mut pipeline = SingleSourcePipeline::builder(SourceSpec::new("captions", spec))
        .config(PipelineConfig {
            batch_size: 100,
            is_train: false,
            ..PipelineConfig::default()
        })
        .decode_with(caption)
        .build()
        .unwrap();
    let batches: Vec<_> = pipeline.batches().unwrap().map(Result::unwrap).collect();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 6);
}

#[test]
fn shard_root_directory_lists_its_shards() {
    let dir = tempdir().unwrap();
    write_corpus(dir.path(), 3, 1);
    fs::write(dir.path().join("__len__"), "3").unwrap();
    let lister = FsShardLister::new();
    let root = dir.path().to_str().unwrap();
    assert_eq!(lister.list(root).unwrap().len(), 3);
    let size = lister.size(root).unwrap();
    assert_eq!(size.total_samples, Some(3));
    assert_eq!(size.shard_count, 3);
}

#[test]
fn training_needs_more_shards_than_workers() {
    let dir = tempdir().unwrap();
    write_corpus(dir.path(), 2, 2);
    let spec = format!("{}/{{000..001}}", dir.path().display());
    let result = SingleSourcePipeline::builder(SourceSpec::new("captions", spec).with_num_samples(4))
        .config(PipelineConfig {
            workers: 4,
            ..PipelineConfig::default()
        })
        .decode_with(caption)
        .build();
    assert!(matches!(result, Err(PipelineError::Configuration(_))));
}

#[test]
fn resampled_training_draws_until_the_epoch_is_full() {
    let dir = tempdir().unwrap();
    write_corpus(dir.path(), 2, 2);
    let spec = format!("{}/{{000..001}}", dir.path().display());
    let mut pipeline =
        SingleSourcePipeline::builder(SourceSpec::new("captions", spec).with_num_samples(40))
            .config(PipelineConfig {
                batch_size: 4,
                workers: 4,
                resampled: true,
                ..PipelineConfig::default()
            })
            .decode_with(caption)
            .build()
            .unwrap();
    let batches: Vec<_> = pipeline.batches().unwrap().map(Result::unwrap).collect();
    assert_eq!(batches.len() as u64, pipeline.num_batches());
    assert_eq!(batches.len(), 12);
}

/// Write `shards` tar shards of `per_shard` image/caption pairs.
fn write_tar_corpus(root: &Path, shards: usize, per_shard: usize) {
    for shard in 0..shards {
        let file = fs::File::create(root.join(format!("{shard:03}.tar"))).unwrap();
        let mut builder = tar::Builder::new(file);
        for idx in 0..per_shard {
            let key = format!("{shard:03}{idx:04}");
            let caption = format!("caption {key}");
            for (ext, body) in [("jpg", vec![shard as u8, idx as u8]), ("txt", caption.into_bytes())] {
                let mut header = tar::Header::new_gnu();
                header.set_size(body.len() as u64);
                header.set_mode(0o644);
                header.set_cksum();
                builder
                    .append_data(&mut header, format!("{key}.{ext}"), body.as_slice())
                    .unwrap();
            }
        }
        builder.finish().unwrap();
    }
}

#[test]
fn tar_shards_in_a_root_directory_are_read_by_default() {
    let dir = tempdir().unwrap();
    write_tar_corpus(dir.path(), 2, 3);
    let spec = dir.path().display().to_string();
    let mut pipeline = SingleSourcePipeline::builder(SourceSpec::new("captions", spec))
        .config(PipelineConfig {
            batch_size: 4,
            is_train: false,
            ..PipelineConfig::default()
        })
        .decode_with(caption)
        .build()
        .unwrap();
    assert_eq!(pipeline.shards().len(), 2);
    let captions: Vec<String> = pipeline
        .batches()
        .unwrap()
        .flat_map(|batch| batch.unwrap().samples)
        .collect();
    assert_eq!(captions.len(), 6);
    assert_eq!(captions[0], "caption 0000000");
    assert_eq!(captions[5], "caption 0010002");
}

#[test]
fn brace_patterns_mix_tar_and_directory_shards() {
    let dir = tempdir().unwrap();
    write_tar_corpus(dir.path(), 1, 2);
    write_corpus(&dir.path().join("dirs"), 1, 2);
    let spec = format!(
        "{root}/{{000..000}}.tar;{root}/dirs/{{000..000}}",
        root = dir.path().display()
    );
    let mut pipeline = SingleSourcePipeline::builder(SourceSpec::new("captions", spec))
        .config(PipelineConfig {
            batch_size: 8,
            is_train: false,
            ..PipelineConfig::default()
        })
        .decode_with(caption)
        .build()
        .unwrap();
    let batches: Vec<Vec<String>> = pipeline
        .batches()
        .unwrap()
        .map(|batch| batch.unwrap().samples)
        .collect();
    assert_eq!(
        batches,
        vec![vec![
            "caption 0000000".to_string(),
            "caption 0000001".to_string(),
            "caption 0000000".to_string(),
            "caption 0000001".to_string(),
        ]]
    );
}

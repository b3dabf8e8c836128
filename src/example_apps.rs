use std::error::Error;
use std::path::{Path, PathBuf};

use clap::{Parser, error::ErrorKind};

use crate::config::{MixingConfig, PipelineConfig};
use crate::data::Sample;
use crate::metrics::SourceSkew;
use crate::mixing::MixingLoader;
use crate::pipeline::{BatchSource, SingleSourcePipeline, SourceSpec};

#[derive(Debug, Parser)]
#[command(
    name = "mixing_demo",
    disable_help_subcommand = true,
    about = "Stream mixed batches from several shard sources",
    long_about = "Build one streaming pipeline per source, mix them round-robin or by sample-count weights, and print what each batch contains.",
    after_help = "Each --source is a manifest specification: a shard directory, a brace pattern such as /data/{000..099}, or several joined with ';'."
)]
struct MixingDemoCli {
    #[arg(
        long = "source",
        value_name = "MANIFEST",
        required = true,
        help = "Manifest specification of one source, repeat in source order"
    )]
    sources: Vec<String>,
    #[arg(
        long = "samples-per-source",
        value_name = "COUNT",
        help = "Per-source sample count used when a manifest declares none, repeat in source order"
    )]
    samples_per_source: Vec<u64>,
    #[arg(
        long = "train-num-samples",
        value_name = "COUNT",
        help = "Total sample budget split evenly across sources without per-source counts"
    )]
    train_num_samples: Option<u64>,
    #[arg(long, help = "Pick sources by sample-count share instead of round robin")]
    weighted: bool,
    #[arg(
        long = "batch-size",
        value_name = "N",
        value_parser = parse_positive_usize,
        help = "Samples per batch (overrides the config file)"
    )]
    batch_size: Option<usize>,
    #[arg(long, value_name = "N", help = "Loader workers per source (0 runs inline)")]
    workers: Option<usize>,
    #[arg(
        long,
        allow_negative_numbers = true,
        help = "Base seed; negative values seed per worker"
    )]
    seed: Option<i64>,
    #[arg(long, default_value_t = 1, help = "Number of epochs to stream")]
    epochs: u64,
    #[arg(long, default_value_t = 0, help = "Epoch to start at")]
    initial_epoch: u64,
    #[arg(long, help = "Draw shards with replacement")]
    resampled: bool,
    #[arg(
        long,
        value_name = "PATH",
        help = "JSON pipeline configuration; flags override its fields"
    )]
    config: Option<PathBuf>,
}

impl MixingDemoCli {
    fn pipeline_config(&self) -> Result<PipelineConfig, Box<dyn Error>> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::from_json(&std::fs::read_to_string(path)?)?,
            None => PipelineConfig::default(),
        };
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        config.resampled |= self.resampled;
        config.validate()?;
        Ok(config)
    }

    fn mixing_config(&self) -> MixingConfig {
        MixingConfig {
            weighted: self.weighted,
            initial_epoch: self.initial_epoch,
            train_num_samples: self.train_num_samples,
            per_source_samples: self.samples_per_source.clone(),
        }
    }
}

/// One-line description of a grouped sample.
fn describe(sample: Sample) -> String {
    let fields: Vec<String> = sample
        .fields
        .iter()
        .map(|(name, payload)| format!("{name}:{}B", payload.len()))
        .collect();
    format!("{} [{}]", sample.key, fields.join(", "))
}

fn source_id(manifest: &str, index: usize) -> String {
    Path::new(manifest.trim_end_matches('/'))
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.contains('{'))
        .unwrap_or_else(|| format!("source-{index}"))
}

/// Run the mixing demo with command-line style arguments.
pub fn run_mixing_demo<I>(args_iter: I) -> Result<(), Box<dyn Error>>
where
    I: Iterator<Item = String>,
{
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let Some(cli) = parse_cli::<MixingDemoCli, _>(
        std::iter::once("mixing_demo".to_string()).chain(args_iter),
    )?
    else {
        return Ok(());
    };

    let pipeline_config = cli.pipeline_config()?;
    let mixing_config = cli.mixing_config();
    let counts = mixing_config.source_sample_counts(cli.sources.len());

    let mut sources: Vec<Box<dyn BatchSource<String>>> = Vec::with_capacity(cli.sources.len());
    for (index, (manifest, count)) in cli.sources.iter().zip(counts).enumerate() {
        let mut spec = SourceSpec::new(source_id(manifest, index), manifest.as_str());
        if let Some(count) = count {
            spec = spec.with_num_samples(count);
        }
        let pipeline = SingleSourcePipeline::builder(spec)
            .config(pipeline_config.clone())
            .decode_with(|sample| Ok(describe(sample)))
            .build()?;
        println!(
            "source {index}: {} ({} shards, {} samples, {} batches per epoch)",
            pipeline.id(),
            pipeline.shards().len(),
            pipeline.num_samples(),
            pipeline.num_batches(),
        );
        sources.push(Box::new(pipeline));
    }

    let mut loader = MixingLoader::from_config(sources, &mixing_config)?;
    if let Some(weights) = loader.weights() {
        println!("weights: {weights:?}");
    }
    for _ in 0..cli.epochs {
        let epoch = loader.epoch();
        println!("=== epoch {epoch} ({} batches) ===", loader.num_batches());
        for mixed in loader.epoch_pass() {
            let mixed = mixed?;
            println!(
                "[epoch {} round {:>4}] {} -> {} samples, first: {}",
                mixed.epoch,
                mixed.round,
                mixed.source_id,
                mixed.batch.len(),
                mixed.batch.samples.first().map(String::as_str).unwrap_or("-"),
            );
        }
    }
    if let Some(skew) = loader.skew() {
        print_skew(&skew);
    }
    Ok(())
}

fn print_skew(skew: &SourceSkew) {
    println!(
        "selections: {} batches over {} sources (min {}, max {}, ratio {:.2})",
        skew.total, skew.sources, skew.min, skew.max, skew.ratio
    );
    for entry in &skew.per_source {
        match entry.expected {
            Some(expected) => println!(
                "  {:<24} {:>6} ({:.3} observed, {:.3} expected)",
                entry.source, entry.count, entry.share, expected
            ),
            None => println!(
                "  {:<24} {:>6} ({:.3} observed)",
                entry.source, entry.count, entry.share
            ),
        }
    }
}

fn parse_positive_usize(raw: &str) -> Result<usize, String> {
    let parsed = raw.parse::<usize>().map_err(|_| {
        format!(
            "Could not parse --batch-size value '{}' as a positive integer",
            raw
        )
    })?;
    if parsed == 0 {
        return Err("--batch-size must be greater than zero".to_string());
    }
    Ok(parsed)
}

fn parse_cli<T, I>(args: I) -> Result<Option<T>, Box<dyn Error>>
where
    T: Parser,
    I: IntoIterator,
    I::Item: Into<std::ffi::OsString> + Clone,
{
    match T::try_parse_from(args) {
        Ok(cli) => Ok(Some(cli)),
        Err(err) => match err.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                err.print()?;
                Ok(None)
            }
            _ => Err(err.into()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> MixingDemoCli {
        parse_cli::<MixingDemoCli, _>(std::iter::once("mixing_demo").chain(args.iter().copied()))
            .unwrap()
            .unwrap()
    }

    #[test]
    fn repeated_sources_keep_their_order() {
        let cli = parse(&[
            "--source",
            "/data/a",
            "--source",
            "/data/b",
            "--samples-per-source",
            "10",
            "--samples-per-source",
            "30",
            "--weighted",
        ]);
        assert_eq!(cli.sources, vec!["/data/a", "/data/b"]);
        assert_eq!(cli.mixing_config().source_sample_counts(2), vec![Some(10), Some(30)]);
        assert!(cli.weighted);
    }

    #[test]
    fn flags_override_config_defaults() {
        let cli = parse(&["--source", "/data/a", "--batch-size", "8", "--seed", "-1"]);
        let config = cli.pipeline_config().unwrap();
        assert_eq!(config.batch_size, 8);
        assert_eq!(config.seed, -1);
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let result = parse_cli::<MixingDemoCli, _>(["mixing_demo", "--source", "a", "--batch-size", "0"]);
        assert!(result.is_err());
    }

    #[test]
    fn source_ids_fall_back_to_position_for_patterns() {
        assert_eq!(source_id("/data/laion/", 0), "laion");
        assert_eq!(source_id("/data/{000..009}", 3), "source-3");
    }
}

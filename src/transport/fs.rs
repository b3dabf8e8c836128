use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;
use walkdir::WalkDir;

use crate::constants::manifest::{
    ARCHIVE_EXTENSION, LEN_FILENAME, SIZES_FILENAME, SPEC_SEPARATOR,
};
use crate::errors::PipelineError;
use crate::source::{ArchiveReader, EntryIter, ManifestSize, ShardLister};
use crate::transport::tarball::TarArchive;
use crate::types::ShardId;

/// Expand a manifest specification into shard paths.
///
/// Independent specifications are separated by `;`. Each one may carry
/// brace patterns: `{000..003}` is a zero-padded numeric range and
/// `{a,b}` an alternative list. Patterns nest and combine left to right.
///
/// ```
/// use shardstream::transport::expand_urls;
///
/// let shards = expand_urls("data/{00..02}.tar;extra/{a,b}.tar").unwrap();
/// assert_eq!(
///     shards,
///     vec!["data/00.tar", "data/01.tar", "data/02.tar", "extra/a.tar", "extra/b.tar"]
/// );
/// ```
pub fn expand_urls(spec: &str) -> Result<Vec<String>, PipelineError> {
    let mut out = Vec::new();
    for part in spec.split(SPEC_SEPARATOR).map(str::trim).filter(|p| !p.is_empty()) {
        expand_braces(part, &mut out)?;
    }
    Ok(out)
}

fn expand_braces(pattern: &str, out: &mut Vec<String>) -> Result<(), PipelineError> {
    let Some(open) = pattern.find('{') else {
        if pattern.contains('}') {
            return Err(PipelineError::configuration(format!(
                "unbalanced '}}' in shard pattern '{pattern}'"
            )));
        }
        out.push(pattern.to_string());
        return Ok(());
    };
    let close = matching_brace(pattern, open).ok_or_else(|| {
        PipelineError::configuration(format!("unbalanced '{{' in shard pattern '{pattern}'"))
    })?;
    let head = &pattern[..open];
    let body = &pattern[open + 1..close];
    let tail = &pattern[close + 1..];
    for alternative in brace_alternatives(body)? {
        expand_braces(&format!("{head}{alternative}{tail}"), out)?;
    }
    Ok(())
}

fn matching_brace(pattern: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (idx, ch) in pattern[open..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(open + idx);
                }
            }
            _ => {}
        }
    }
    None
}

fn brace_alternatives(body: &str) -> Result<Vec<String>, PipelineError> {
    if let Some((start, end)) = body.split_once("..")
        && !start.is_empty()
        && start.bytes().all(|b| b.is_ascii_digit())
        && !end.is_empty()
        && end.bytes().all(|b| b.is_ascii_digit())
    {
        let parse = |text: &str| {
            text.parse::<u64>().map_err(|err| {
                PipelineError::configuration(format!("invalid shard range '{body}': {err}"))
            })
        };
        let (low, high) = (parse(start)?, parse(end)?);
        let padded = (start.len() > 1 && start.starts_with('0'))
            || (end.len() > 1 && end.starts_with('0'));
        let width = if padded { start.len().max(end.len()) } else { 0 };
        let values: Box<dyn Iterator<Item = u64>> = if low <= high {
            Box::new(low..=high)
        } else {
            Box::new((high..=low).rev())
        };
        return Ok(values.map(|value| format!("{value:0width$}")).collect());
    }

    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut last = 0usize;
    for (idx, ch) in body.char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(body[last..idx].to_string());
                last = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(body[last..].to_string());
    if parts.len() == 1 && !body.contains('{') {
        return Err(PipelineError::configuration(format!(
            "brace pattern '{{{body}}}' is neither a range nor a list"
        )));
    }
    Ok(parts)
}

/// Lists shards on the local filesystem.
///
/// A specification naming an existing directory (without brace patterns)
/// lists that directory's immediate subdirectories and `.tar` files in name
/// order. Anything else is brace-expanded as written.
#[derive(Clone, Debug, Default)]
pub struct FsShardLister {
    follow_links: bool,
}

impl FsShardLister {
    /// Lister that does not follow symlinks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure symlink traversal when listing shard directories.
    pub fn with_follow_symlinks(mut self, follow_links: bool) -> Self {
        self.follow_links = follow_links;
        self
    }

    fn list_part(&self, part: &str) -> Result<(Vec<ShardId>, PathBuf), PipelineError> {
        let root = Path::new(part);
        if !part.contains('{') && root.is_dir() {
            let mut shards = Vec::new();
            for entry in WalkDir::new(root)
                .min_depth(1)
                .max_depth(1)
                .follow_links(self.follow_links)
                .sort_by_file_name()
            {
                let entry = entry.map_err(|err| PipelineError::shard_unavailable(part, err))?;
                let path = entry.path();
                let is_archive = path
                    .extension()
                    .is_some_and(|ext| ext == ARCHIVE_EXTENSION);
                if entry.file_type().is_dir() || (entry.file_type().is_file() && is_archive) {
                    shards.push(path.to_string_lossy().into_owned());
                }
            }
            return Ok((shards, root.to_path_buf()));
        }
        let mut shards = Vec::new();
        expand_braces(part, &mut shards)?;
        let dir = shards
            .first()
            .and_then(|first| Path::new(first).parent())
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok((shards, dir))
    }
}

fn parts(spec: &str) -> impl Iterator<Item = &str> {
    spec.split(SPEC_SEPARATOR)
        .map(str::trim)
        .filter(|part| !part.is_empty())
}

impl ShardLister for FsShardLister {
    fn list(&self, spec: &str) -> Result<Vec<ShardId>, PipelineError> {
        let mut shards = Vec::new();
        for part in parts(spec) {
            shards.extend(self.list_part(part)?.0);
        }
        Ok(shards)
    }

    fn size(&self, spec: &str) -> Result<ManifestSize, PipelineError> {
        let mut shard_count = 0usize;
        let mut total: Option<u64> = Some(0);
        for part in parts(spec) {
            let (shards, dir) = self.list_part(part)?;
            shard_count += shards.len();
            let declared = declared_size(&dir, &shards)?;
            total = total.zip(declared).map(|(sum, count)| sum + count);
        }
        if shard_count == 0 {
            total = None;
        }
        Ok(ManifestSize {
            total_samples: total,
            shard_count,
        })
    }
}

fn declared_size(dir: &Path, shards: &[ShardId]) -> Result<Option<u64>, PipelineError> {
    let sizes_path = dir.join(SIZES_FILENAME);
    if sizes_path.is_file() {
        let sizes: Value = serde_json::from_slice(&fs::read(&sizes_path)?).map_err(|err| {
            PipelineError::configuration(format!("invalid {}: {err}", sizes_path.display()))
        })?;
        let mut total = 0u64;
        for shard in shards {
            let name = Path::new(shard)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| shard.clone());
            let count = sizes.get(&name).and_then(count_value).ok_or_else(|| {
                PipelineError::configuration(format!(
                    "{} has no usable entry for shard '{name}'",
                    sizes_path.display()
                ))
            })?;
            total += count;
        }
        debug!(path = %sizes_path.display(), total, "read per-shard sizes");
        return Ok(Some(total));
    }
    let len_path = dir.join(LEN_FILENAME);
    if len_path.is_file() {
        let text = fs::read_to_string(&len_path)?;
        let total = text.trim().parse::<u64>().map_err(|err| {
            PipelineError::configuration(format!("invalid {}: {err}", len_path.display()))
        })?;
        debug!(path = %len_path.display(), total, "read total size");
        return Ok(Some(total));
    }
    Ok(None)
}

fn count_value(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

/// Archive reader treating each shard as a directory of entry files.
///
/// Entries are the regular files below the shard directory, named by their
/// `/`-separated path relative to it and yielded in sorted path order.
#[derive(Clone, Debug, Default)]
pub struct DirectoryArchive {
    follow_links: bool,
}

impl DirectoryArchive {
    /// Reader that does not follow symlinks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure symlink traversal inside shards.
    pub fn with_follow_symlinks(mut self, follow_links: bool) -> Self {
        self.follow_links = follow_links;
        self
    }
}

impl ArchiveReader for DirectoryArchive {
    fn open(&self, shard: &str) -> Result<EntryIter, PipelineError> {
        let root = PathBuf::from(shard);
        if !root.is_dir() {
            return Err(PipelineError::shard_unavailable(shard, "not a directory"));
        }
        let mut files = Vec::new();
        for entry in WalkDir::new(&root)
            .min_depth(1)
            .follow_links(self.follow_links)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|err| PipelineError::shard_unavailable(shard, err))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&root)
                .map_err(|err| PipelineError::shard_unavailable(shard, err))?;
            let name = relative
                .components()
                .map(|component| component.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            files.push((name, entry.into_path()));
        }
        Ok(Box::new(files.into_iter().map(
            |(name, path)| -> Result<(String, Vec<u8>), PipelineError> {
                let payload = fs::read(&path)?;
                Ok((name, payload))
            },
        )))
    }
}

/// Archive reader for shards listed by [`FsShardLister`].
///
/// Shards ending in `.tar` are read with [`TarArchive`]; anything else is
/// read as a shard directory with [`DirectoryArchive`].
#[derive(Clone, Debug, Default)]
pub struct FsArchive {
    directories: DirectoryArchive,
    tarballs: TarArchive,
}

impl FsArchive {
    /// Reader that does not follow symlinks inside shard directories.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure symlink traversal inside shard directories.
    pub fn with_follow_symlinks(mut self, follow_links: bool) -> Self {
        self.directories = self.directories.with_follow_symlinks(follow_links);
        self
    }
}

impl ArchiveReader for FsArchive {
    fn open(&self, shard: &str) -> Result<EntryIter, PipelineError> {
        let is_tarball = Path::new(shard)
            .extension()
            .is_some_and(|ext| ext == ARCHIVE_EXTENSION);
        if is_tarball {
            self.tarballs.open(shard)
        } else {
            self.directories.open(shard)
        }
    }
}

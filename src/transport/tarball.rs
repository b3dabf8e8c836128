use std::fs::File;
use std::io::{BufReader, Read};

use tar::{Archive, Entry as TarEntry};
use tracing::debug;

use crate::errors::PipelineError;
use crate::source::{ArchiveReader, EntryIter};
use crate::types::EntryName;

/// Archive reader over local `.tar` shards.
///
/// Regular file members are yielded in archive order; directories, links and
/// other member types are skipped. Members are read when the shard is
/// opened. A corrupt header ends the shard with a read error after the
/// members before it, so those are still delivered.
#[derive(Clone, Copy, Debug, Default)]
pub struct TarArchive;

impl TarArchive {
    /// Tar shard reader.
    pub fn new() -> Self {
        Self
    }
}

impl ArchiveReader for TarArchive {
    fn open(&self, shard: &str) -> Result<EntryIter, PipelineError> {
        let file = File::open(shard).map_err(|err| PipelineError::shard_unavailable(shard, err))?;
        let mut archive = Archive::new(BufReader::new(file));
        let members = archive
            .entries()
            .map_err(|err| PipelineError::shard_unavailable(shard, err))?;

        let mut records = Vec::new();
        for member in members {
            let read = member
                .map_err(|err| PipelineError::shard_unavailable(shard, err))
                .and_then(|mut member| read_member(shard, &mut member));
            match read {
                Ok(Some(record)) => records.push(Ok(record)),
                Ok(None) => {}
                Err(err) => {
                    records.push(Err(err));
                    break;
                }
            }
        }
        debug!(shard, members = records.len(), "read tar shard");
        Ok(Box::new(records.into_iter()))
    }
}

fn read_member<R: Read>(
    shard: &str,
    member: &mut TarEntry<'_, R>,
) -> Result<Option<(EntryName, Vec<u8>)>, PipelineError> {
    if !member.header().entry_type().is_file() {
        return Ok(None);
    }
    let name = {
        let path = member
            .path()
            .map_err(|err| PipelineError::shard_unavailable(shard, err))?;
        path.to_str()
            .ok_or_else(|| PipelineError::MalformedRecord {
                shard: shard.to_string(),
                details: format!("member name {} is not valid UTF-8", path.display()),
            })?
            .to_owned()
    };
    let declared = member.size();
    let mut payload = Vec::with_capacity(usize::try_from(declared).unwrap_or_default());
    member
        .read_to_end(&mut payload)
        .map_err(|err| PipelineError::shard_unavailable(shard, err))?;
    if payload.len() as u64 != declared {
        return Err(PipelineError::shard_unavailable(
            shard,
            format!("member {name} is truncated"),
        ));
    }
    Ok(Some((name, payload)))
}

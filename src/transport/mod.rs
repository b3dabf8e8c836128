/// Local filesystem shard listing and the shard readers it dispatches to.
pub mod fs;
/// Tar shard reader.
pub mod tarball;

pub use fs::{DirectoryArchive, FsArchive, FsShardLister, expand_urls};
pub use tarball::TarArchive;

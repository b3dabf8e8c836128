/// Identifier of one archive shard (path or URL).
/// Examples: `/data/laion/00042.tar`, `s3://bucket/cc12m/000017`
pub type ShardId = String;
/// Identifier for one single-source pipeline inside a mixing session.
/// Examples: `laion400m`, `cc12m`
pub type SourceId = String;
/// Group prefix shared by the entries of one sample.
/// Example: `shard-000/000017`
pub type SampleKey = String;
/// Case-normalized field extension inside a sample.
/// Examples: `jpg`, `txt`, `0.png`
pub type FieldName = String;
/// Archive entry filename as stored in the shard.
/// Example: `shard-000/000017.jpg`
pub type EntryName = String;
/// Manifest specification handed to a shard lister.
/// Example: `/data/a/{00000..00099};/data/b/{000..009}`
pub type ManifestSpec = String;

use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::HashMap;
use serde::Serialize;
use tokio::io::AsyncRead;

use crate::asset::{AssetKey, SizeLabel, SizeSpecs, Variant};
use crate::error::StorageResult;
use crate::processor::SharedDeriver;

/// `"o"` and every requested size label mapped to a retrievable URL.
pub type ResolvedUrls = HashMap<String, String>;

/// A single-pass stream of the original's bytes.
pub type SourceStream<'a> = &'a mut (dyn AsyncRead + Send + Unpin);

#[derive(Debug, Clone, Serialize)]
pub struct WriteReport {
    /// The key the original was stored under.
    pub key: AssetKey,

    /// The crc32 checksum of the original.
    pub checksum: u32,

    /// The size of the original in bytes.
    pub original_size: usize,

    /// The size in bytes of every variant that was persisted.
    pub variants: HashMap<SizeLabel, usize>,

    /// The time spent on the whole write in seconds.
    pub processing_time: f32,
}

/// A place assets and their size variants are kept.
///
/// Calls for different keys never interfere with each other. Calls racing on
/// the same key have no defined order, what survives a racing `write` and
/// `delete` is up to the backend.
#[async_trait]
pub trait StorageAdapter: Sync + Send + 'static {
    /// Builds the URL of the original and of each size.
    ///
    /// This never checks whether anything exists at those URLs.
    fn resolve(&self, key: &AssetKey, sizes: &[SizeLabel]) -> ResolvedUrls;

    /// Persists the original read from `source`, then derives and persists
    /// every size in `sizes` from the persisted original.
    ///
    /// On success everything is durably stored. A failing size does not
    /// stop the others and nothing is rolled back, the call then returns
    /// an error naming every failed label.
    async fn write(
        &self,
        key: &AssetKey,
        source: SourceStream<'_>,
        sizes: &SizeSpecs,
        deriver: SharedDeriver,
    ) -> StorageResult<WriteReport>;

    /// Reads a stored object back, `None` if it does not exist.
    async fn fetch(&self, key: &AssetKey, variant: Variant<'_>) -> StorageResult<Option<Bytes>>;

    /// Removes the original and every size in `sizes`.
    ///
    /// Objects that are already gone count as removed.
    async fn delete(&self, key: &AssetKey, sizes: &[SizeLabel]) -> StorageResult<()>;
}

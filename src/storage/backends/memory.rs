use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::HashMap;
use tokio::io::AsyncReadExt;
use tokio::sync::RwLock;

use crate::asset::{validate_sizes, AssetKey, SizeLabel, SizeSpecs, Variant};
use crate::error::{Operation, StorageError, StorageResult};
use crate::location::locate;
use crate::processor::SharedDeriver;
use crate::storage::template::{ResolvedUrls, SourceStream, StorageAdapter, WriteReport};

/// Keeps every object in process memory, keyed by its location.
///
/// There are no containers to create, everything lives in one flat map.
#[derive(Default)]
pub struct MemoryBackend {
    objects: RwLock<HashMap<String, Bytes>>,
    base_url: String,
}

impl MemoryBackend {
    pub fn new(base_url: &str) -> Self {
        Self {
            objects: RwLock::default(),
            base_url: crate::storage::normalize_base_url(base_url),
        }
    }

    /// The number of objects currently stored.
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    async fn store_variant(&self, location: String, data: Bytes) -> StorageResult<()> {
        debug!("Storing variant @ {}", &location);
        self.objects.write().await.insert(location, data);
        Ok(())
    }
}

#[async_trait]
impl StorageAdapter for MemoryBackend {
    fn resolve(&self, key: &AssetKey, sizes: &[SizeLabel]) -> ResolvedUrls {
        crate::storage::build_urls(&self.base_url, key, sizes)
    }

    #[instrument(name = "memory_write", skip_all, fields(key = %key, sizes = sizes.len()))]
    async fn write(
        &self,
        key: &AssetKey,
        source: SourceStream<'_>,
        sizes: &SizeSpecs,
        deriver: SharedDeriver,
    ) -> StorageResult<WriteReport> {
        validate_sizes(sizes)?;
        let started = Instant::now();

        let mut buff = Vec::new();
        source
            .read_to_end(&mut buff)
            .await
            .map_err(|e| StorageError::transfer(Operation::Read, key.as_str(), "o", e))?;

        let original = Bytes::from(buff);
        self.objects
            .write()
            .await
            .insert(locate(key, Variant::Original), original.clone());

        let (variants, failures) = crate::storage::store_variants(
            key,
            original.clone(),
            sizes,
            deriver,
            |_label, location, data| self.store_variant(location, data),
        )
        .await;

        crate::storage::finish_write(key, &original, variants, failures, started)
    }

    async fn fetch(&self, key: &AssetKey, variant: Variant<'_>) -> StorageResult<Option<Bytes>> {
        let location = locate(key, variant);
        Ok(self.objects.read().await.get(&location).cloned())
    }

    async fn delete(&self, key: &AssetKey, sizes: &[SizeLabel]) -> StorageResult<()> {
        let mut objects = self.objects.write().await;

        objects.remove(&locate(key, Variant::Original));
        for label in sizes {
            objects.remove(&locate(key, Variant::Size(label)));
        }

        Ok(())
    }
}

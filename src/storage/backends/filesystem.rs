use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::{self, DirBuilder, File};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::asset::{validate_sizes, AssetKey, SizeLabel, SizeSpecs, Variant};
use crate::error::{Operation, StorageError, StorageResult};
use crate::location::{container_of, locate};
use crate::processor::SharedDeriver;
use crate::storage::template::{ResolvedUrls, SourceStream, StorageAdapter, WriteReport};

/// Where files go when no directory is configured.
pub const DEFAULT_DIRECTORY: &str = "./public/static/upload/";

pub struct FileSystemBackend {
    directory: PathBuf,
    base_url: String,
}

impl FileSystemBackend {
    /// Creates a backend rooted at `directory`, or at [`DEFAULT_DIRECTORY`]
    /// when none (or an empty one) is given.
    ///
    /// Nothing is touched on disk until the first write.
    pub fn new(directory: Option<PathBuf>, base_url: &str) -> Self {
        let directory = directory
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DIRECTORY));

        Self {
            directory,
            base_url: crate::storage::normalize_base_url(base_url),
        }
    }

    #[inline]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    #[inline]
    fn format_path(&self, location: &str) -> PathBuf {
        self.directory.join(location)
    }

    /// Creates the directory tree holding `location` if it does not exist yet.
    ///
    /// New directories are requested with mode `0o755` on unix. The process
    /// umask still applies, so a stricter umask yields stricter directories.
    /// Existing directories keep whatever mode they have.
    ///
    /// Losing a race against another caller creating the same directory is
    /// fine, only ending up without a directory is an error.
    pub async fn ensure_container(&self, key: &AssetKey, location: &str) -> StorageResult<()> {
        let dir = self.directory.join(container_of(location));

        let mut builder = DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(0o755);

        let created = builder.create(&dir).await;
        match fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            _ => {
                let reason = match created {
                    Err(e) => e.to_string(),
                    Ok(()) => "path exists but is not a directory".to_string(),
                };

                Err(StorageError::ContainerCreationFailed {
                    key: key.to_string(),
                    path: dir.display().to_string(),
                    reason,
                })
            },
        }
    }

    /// Streams `source` into place, renaming over the target once complete.
    async fn persist_stream(&self, path: &Path, source: SourceStream<'_>) -> std::io::Result<()> {
        let temp = TempFile::new(path);

        let mut file = File::create(temp.path()).await?;
        tokio::io::copy(source, &mut file).await?;
        file.sync_all().await?;

        temp.persist(path).await
    }

    async fn persist_bytes(&self, path: &Path, data: &[u8]) -> std::io::Result<()> {
        let temp = TempFile::new(path);

        let mut file = File::create(temp.path()).await?;
        file.write_all(data).await?;
        file.sync_all().await?;

        temp.persist(path).await
    }

    async fn store_variant(
        &self,
        key: &AssetKey,
        label: SizeLabel,
        location: String,
        data: Bytes,
    ) -> StorageResult<()> {
        self.ensure_container(key, &location).await?;
        let path = self.format_path(&location);

        debug!("Storing variant @ {:?}", &path);
        self.persist_bytes(&path, &data)
            .await
            .map_err(|e| StorageError::transfer(Operation::Persist, key.as_str(), label.as_str(), e))
    }

    /// Removes a single file, a missing file counts as removed.
    async fn remove(&self, key: &AssetKey, variant: Variant<'_>) -> StorageResult<()> {
        let path = self.format_path(&locate(key, variant));

        debug!("Purging file @ {:?}", &path);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(ref e) if e.kind() == ErrorKind::NotFound => {
                debug!("File @ {:?} already absent", &path);
                Ok(())
            },
            Err(other) => Err(StorageError::backend(
                Operation::Remove,
                key.as_str(),
                variant.label(),
                other,
            )),
        }
    }
}

/// A temporary sibling of a target file.
///
/// Removed again when dropped before [`TempFile::persist`] renamed it over
/// the target, whether the write failed or was cancelled.
struct TempFile {
    path: PathBuf,
    persisted: bool,
}

impl TempFile {
    fn new(target: &Path) -> Self {
        let name = target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        Self {
            path: target.with_file_name(format!(".{}.{}.tmp", name, Uuid::new_v4())),
            persisted: false,
        }
    }

    #[inline]
    fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(mut self, target: &Path) -> std::io::Result<()> {
        fs::rename(&self.path, target).await?;
        self.persisted = true;
        Ok(())
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if self.persisted {
            return;
        }

        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed abandoned temp file @ {:?}", &self.path),
            Err(ref e) if e.kind() == ErrorKind::NotFound => {},
            Err(e) => warn!("Failed to remove temp file @ {:?}: {}", &self.path, e),
        }
    }
}

#[async_trait]
impl StorageAdapter for FileSystemBackend {
    fn resolve(&self, key: &AssetKey, sizes: &[SizeLabel]) -> ResolvedUrls {
        crate::storage::build_urls(&self.base_url, key, sizes)
    }

    #[instrument(name = "filesystem_write", skip_all, fields(key = %key, sizes = sizes.len()))]
    async fn write(
        &self,
        key: &AssetKey,
        source: SourceStream<'_>,
        sizes: &SizeSpecs,
        deriver: SharedDeriver,
    ) -> StorageResult<WriteReport> {
        validate_sizes(sizes)?;
        let started = Instant::now();

        let location = locate(key, Variant::Original);
        self.ensure_container(key, &location).await?;
        let path = self.format_path(&location);

        debug!("Storing original @ {:?}", &path);
        self.persist_stream(&path, source)
            .await
            .map_err(|e| StorageError::transfer(Operation::Persist, key.as_str(), "o", e))?;

        // The source is spent, sizes are derived from what landed on disk.
        let original = fs::read(&path)
            .await
            .map(Bytes::from)
            .map_err(|e| StorageError::transfer(Operation::Read, key.as_str(), "o", e))?;

        let (variants, failures) = crate::storage::store_variants(
            key,
            original.clone(),
            sizes,
            deriver,
            |label, location, data| self.store_variant(key, label, location, data),
        )
        .await;

        info!(
            "Stored {} with {}/{} variants",
            key,
            variants.len(),
            sizes.len(),
        );
        crate::storage::finish_write(key, &original, variants, failures, started)
    }

    async fn fetch(&self, key: &AssetKey, variant: Variant<'_>) -> StorageResult<Option<Bytes>> {
        let path = self.format_path(&locate(key, variant));

        debug!("Retrieving file @ {:?}", &path);
        match fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(ref e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(other) => Err(StorageError::backend(
                Operation::Read,
                key.as_str(),
                variant.label(),
                other,
            )),
        }
    }

    #[instrument(name = "filesystem_delete", skip_all, fields(key = %key, sizes = sizes.len()))]
    async fn delete(&self, key: &AssetKey, sizes: &[SizeLabel]) -> StorageResult<()> {
        let mut failures = vec![];

        let targets = std::iter::once(Variant::Original).chain(sizes.iter().map(Variant::Size));
        for variant in targets {
            if let Err(e) = self.remove(key, variant).await {
                warn!("{}", e);
                failures.push(e);
            }
        }

        match StorageError::collect(key.as_str(), failures) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

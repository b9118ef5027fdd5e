use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::storage::template::StorageAdapter;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendConfigs {
    FileSystem {
        /// The directory files are stored under.
        ///
        /// Falls back to `filesystem::DEFAULT_DIRECTORY` when unset.
        #[serde(default)]
        directory: Option<PathBuf>,

        /// The URL the directory is served from.
        #[serde(default)]
        base_url: String,
    },
    BlobStorage {
        name: String,
        region: String,
        endpoint: String,
        access_key: Option<String>,
        secret_key: Option<String>,

        /// The URL objects are publicly served from, e.g. a CDN.
        ///
        /// Defaults to `<endpoint>/<name>/`.
        public_url: Option<String>,

        /// The request timeout in seconds.
        request_timeout: Option<u64>,
    },
    Memory {
        #[serde(default)]
        base_url: String,
    },
}

impl BackendConfigs {
    pub async fn connect(&self) -> anyhow::Result<Arc<dyn StorageAdapter>> {
        match self {
            Self::FileSystem { directory, base_url } => {
                info!("Using the file system backend");
                Ok(Arc::new(super::filesystem::FileSystemBackend::new(
                    directory.clone(),
                    base_url,
                )))
            },
            Self::BlobStorage {
                name,
                region,
                endpoint,
                access_key,
                secret_key,
                public_url,
                request_timeout,
            } => {
                info!("Using the blob storage backend with bucket {}", name);
                let backend = super::blob_storage::BlobStorageBackend::new(
                    name.clone(),
                    region.clone(),
                    endpoint.clone(),
                    access_key.clone(),
                    secret_key.clone(),
                    public_url.clone(),
                    request_timeout.map(Duration::from_secs),
                )?;

                Ok(Arc::new(backend))
            },
            Self::Memory { base_url } => {
                info!("Using the in-memory backend, nothing will outlive the process");
                Ok(Arc::new(super::memory::MemoryBackend::new(base_url)))
            },
        }
    }
}

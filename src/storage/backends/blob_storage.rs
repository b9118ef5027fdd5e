use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use mime::Mime;
use rusoto_core::credential::{ProvideAwsCredentials, StaticProvider};
use rusoto_core::{DispatchSignedRequest, HttpClient, Region, RusotoError};
use rusoto_s3::{
    CreateBucketError,
    CreateBucketRequest,
    DeleteObjectRequest,
    GetObjectError,
    GetObjectRequest,
    HeadBucketError,
    HeadBucketRequest,
    PutObjectRequest,
    S3Client,
    S3,
};
use tokio::io::AsyncReadExt;

use crate::asset::{validate_sizes, AssetKey, SizeLabel, SizeSpecs, Variant};
use crate::error::{Operation, StorageError, StorageResult};
use crate::location::locate;
use crate::processor::SharedDeriver;
use crate::storage::template::{ResolvedUrls, SourceStream, StorageAdapter, WriteReport};

/// An S3 compatible bucket acting as the container of every object.
pub struct BlobStorageBackend {
    bucket: String,
    client: S3Client,
    base_url: String,
    request_timeout: Option<Duration>,
}

impl BlobStorageBackend {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        region: String,
        endpoint: String,
        access_key: Option<String>,
        secret_key: Option<String>,
        public_url: Option<String>,
        request_timeout: Option<Duration>,
    ) -> Result<Self> {
        let creds = StaticProvider::new_minimal(
            access_key.unwrap_or_default(),
            secret_key.unwrap_or_default(),
        );

        Ok(Self::with_dispatcher(
            name,
            region,
            endpoint,
            HttpClient::new()?,
            creds,
            public_url,
            request_timeout,
        ))
    }

    /// Builds the backend on top of any request dispatcher and credentials.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn with_dispatcher<D, P>(
        name: String,
        region: String,
        endpoint: String,
        dispatcher: D,
        credentials: P,
        public_url: Option<String>,
        request_timeout: Option<Duration>,
    ) -> Self
    where
        D: DispatchSignedRequest + Send + Sync + 'static,
        P: ProvideAwsCredentials + Send + Sync + 'static,
    {
        let base_url = match public_url {
            Some(url) if !url.is_empty() => crate::storage::normalize_base_url(&url),
            _ => format!("{}/{}/", endpoint.trim_end_matches('/'), name),
        };

        let region = Region::Custom {
            name: region,
            endpoint,
        };
        let client = S3Client::new_with(dispatcher, credentials, region);

        Self {
            bucket: name,
            client,
            base_url,
            request_timeout,
        }
    }

    /// Creates the bucket if it does not exist.
    ///
    /// Someone else creating it first is not an error.
    async fn ensure_container(&self, key: &AssetKey) -> StorageResult<()> {
        let head = HeadBucketRequest {
            bucket: self.bucket.clone(),
            ..Default::default()
        };

        let missing = match self.client.head_bucket(head).await {
            Ok(_) => false,
            Err(RusotoError::Service(HeadBucketError::NoSuchBucket(_))) => true,
            Err(RusotoError::Unknown(ref resp)) if resp.status.as_u16() == 404 => true,
            Err(other) => return Err(self.container_error(key, other)),
        };

        if !missing {
            return Ok(());
        }

        info!("Creating missing bucket {}", &self.bucket);
        let create = CreateBucketRequest {
            bucket: self.bucket.clone(),
            ..Default::default()
        };

        match self.client.create_bucket(create).await {
            Ok(_) => Ok(()),
            Err(RusotoError::Service(CreateBucketError::BucketAlreadyOwnedByYou(_))) => Ok(()),
            Err(other) => Err(self.container_error(key, other)),
        }
    }

    fn container_error(&self, key: &AssetKey, reason: impl std::fmt::Display) -> StorageError {
        StorageError::ContainerCreationFailed {
            key: key.to_string(),
            path: self.bucket.clone(),
            reason: reason.to_string(),
        }
    }

    async fn put(&self, key: &AssetKey, label: &str, location: String, data: Bytes) -> StorageResult<()> {
        debug!("Storing object in bucket @ {}", &location);

        let request = PutObjectRequest {
            bucket: self.bucket.clone(),
            content_length: Some(data.len() as i64),
            content_type: Some(content_type(&location).to_string()),
            key: location,
            body: Some(data.to_vec().into()),
            ..Default::default()
        };

        let fut = self.client.put_object(request);
        let result = match self.request_timeout {
            Some(timeout) => tokio::time::timeout(timeout, fut)
                .await
                .map_err(|_| anyhow::anyhow!("request timed out after {:?}", timeout))
                .and_then(|res| res.map_err(anyhow::Error::from)),
            None => fut.await.map_err(anyhow::Error::from),
        };

        result
            .map(|_| ())
            .map_err(|e| StorageError::transfer(Operation::Persist, key.as_str(), label, e))
    }
}

/// Picks the content type stored alongside an object from its extension.
pub fn content_type(location: &str) -> Mime {
    let extension = location
        .rsplit('/')
        .next()
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase());

    match extension.as_deref() {
        Some("jpg") | Some("jpeg") => mime::IMAGE_JPEG,
        Some("png") => mime::IMAGE_PNG,
        Some("gif") => mime::IMAGE_GIF,
        Some("bmp") => mime::IMAGE_BMP,
        Some("svg") => mime::IMAGE_SVG,
        Some("webp") => "image/webp".parse().unwrap_or(mime::APPLICATION_OCTET_STREAM),
        _ => mime::APPLICATION_OCTET_STREAM,
    }
}

#[async_trait]
impl StorageAdapter for BlobStorageBackend {
    fn resolve(&self, key: &AssetKey, sizes: &[SizeLabel]) -> ResolvedUrls {
        crate::storage::build_urls(&self.base_url, key, sizes)
    }

    #[instrument(name = "blob_write", skip_all, fields(key = %key, sizes = sizes.len()))]
    async fn write(
        &self,
        key: &AssetKey,
        source: SourceStream<'_>,
        sizes: &SizeSpecs,
        deriver: SharedDeriver,
    ) -> StorageResult<WriteReport> {
        validate_sizes(sizes)?;
        let started = Instant::now();

        self.ensure_container(key).await?;

        // Objects are uploaded whole, the buffer stands in for the persisted
        // original when deriving sizes.
        let mut buff = Vec::new();
        source
            .read_to_end(&mut buff)
            .await
            .map_err(|e| StorageError::transfer(Operation::Read, key.as_str(), "o", e))?;
        let original = Bytes::from(buff);

        self.put(key, "o", locate(key, Variant::Original), original.clone())
            .await?;

        let (variants, failures) = crate::storage::store_variants(
            key,
            original.clone(),
            sizes,
            deriver,
            |label, location, data| async move {
                self.put(key, label.as_str(), location, data).await
            },
        )
        .await;

        info!(
            "Stored {} in bucket {} with {}/{} variants",
            key,
            &self.bucket,
            variants.len(),
            sizes.len(),
        );
        crate::storage::finish_write(key, &original, variants, failures, started)
    }

    async fn fetch(&self, key: &AssetKey, variant: Variant<'_>) -> StorageResult<Option<Bytes>> {
        let location = locate(key, variant);
        debug!("Retrieving object in bucket @ {}", &location);

        let request = GetObjectRequest {
            bucket: self.bucket.clone(),
            key: location,
            ..Default::default()
        };

        let output = match self.client.get_object(request).await {
            Ok(output) => output,
            Err(RusotoError::Service(GetObjectError::NoSuchKey(_))) => return Ok(None),
            Err(RusotoError::Unknown(ref resp)) if resp.status.as_u16() == 404 => return Ok(None),
            Err(other) => {
                return Err(StorageError::backend(
                    Operation::Read,
                    key.as_str(),
                    variant.label(),
                    other,
                ))
            },
        };

        let data = match output.body {
            Some(body) => body
                .map_ok(|chunk| chunk.to_vec())
                .try_concat()
                .await
                .map_err(|e| StorageError::backend(Operation::Read, key.as_str(), variant.label(), e))?,
            None => Vec::new(),
        };

        Ok(Some(Bytes::from(data)))
    }

    #[instrument(name = "blob_delete", skip_all, fields(key = %key, sizes = sizes.len()))]
    async fn delete(&self, key: &AssetKey, sizes: &[SizeLabel]) -> StorageResult<()> {
        let mut failures = vec![];

        let targets = std::iter::once(Variant::Original).chain(sizes.iter().map(Variant::Size));
        for variant in targets {
            let location = locate(key, variant);
            debug!("Purging object in bucket @ {}", &location);

            let request = DeleteObjectRequest {
                bucket: self.bucket.clone(),
                key: location,
                ..Default::default()
            };

            match self.client.delete_object(request).await {
                Ok(_) => continue,
                Err(RusotoError::Unknown(ref resp)) if resp.status.as_u16() == 404 => continue,
                Err(other) => {
                    let err = StorageError::backend(Operation::Remove, key.as_str(), variant.label(), other);
                    warn!("{}", err);
                    failures.push(err);
                },
            }
        }

        match StorageError::collect(key.as_str(), failures) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use rusoto_core::request::DispatchSignedRequestFuture;
    use rusoto_core::signature::SignedRequest;
    use rusoto_mock::MockRequestDispatcher;

    use super::*;
    use crate::asset::SizeParams;

    const NO_SUCH_KEY: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Error><Code>NoSuchKey</Code><Message>The specified key does not exist.</Message></Error>"#;

    const ALREADY_OWNED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Error><Code>BucketAlreadyOwnedByYou</Code><Message>You already own this bucket.</Message></Error>"#;

    enum Reply {
        Mock(MockRequestDispatcher),
        Stall,
    }

    /// Answers every request by its method and path and records both.
    struct Routes<F> {
        route: F,
        seen: Arc<Mutex<Vec<String>>>,
    }

    impl<F> DispatchSignedRequest for Routes<F>
    where
        F: Fn(&str, &str) -> Reply + Send + Sync,
    {
        fn dispatch(&self, request: SignedRequest, timeout: Option<Duration>) -> DispatchSignedRequestFuture {
            let method = request.method().to_string();
            let path = request.path().to_string();
            self.seen.lock().unwrap().push(format!("{} {}", method, path));

            match (self.route)(&method, &path) {
                Reply::Mock(mock) => mock.dispatch(request, timeout),
                Reply::Stall => Box::pin(futures::future::pending()),
            }
        }
    }

    fn mocked<F>(request_timeout: Option<Duration>, route: F) -> (BlobStorageBackend, Arc<Mutex<Vec<String>>>)
    where
        F: Fn(&str, &str) -> Reply + Send + Sync + 'static,
    {
        let seen = Arc::new(Mutex::new(vec![]));
        let dispatcher = Routes {
            route,
            seen: seen.clone(),
        };

        let backend = BlobStorageBackend::with_dispatcher(
            "media".to_string(),
            "us-east-1".to_string(),
            "http://127.0.0.1:9000".to_string(),
            dispatcher,
            StaticProvider::new_minimal("access".to_string(), "secret".to_string()),
            None,
            request_timeout,
        );

        (backend, seen)
    }

    fn ok() -> Reply {
        Reply::Mock(MockRequestDispatcher::default())
    }

    fn status(code: u16) -> Reply {
        Reply::Mock(MockRequestDispatcher::with_status(code))
    }

    fn copying_deriver() -> SharedDeriver {
        Arc::new(|source: &[u8], _: &SizeParams| -> anyhow::Result<Bytes> {
            Ok(Bytes::copy_from_slice(source))
        })
    }

    fn thumb_only() -> SizeSpecs {
        let mut sizes = SizeSpecs::new();
        sizes.insert(SizeLabel::new("thumb").unwrap(), SizeParams::new(100, 100));
        sizes
    }

    fn requests(seen: &Mutex<Vec<String>>) -> Vec<String> {
        seen.lock().unwrap().clone()
    }

    fn backend(public_url: Option<&str>) -> BlobStorageBackend {
        BlobStorageBackend::new(
            "media".to_string(),
            "us-east-1".to_string(),
            "http://127.0.0.1:9000/".to_string(),
            Some("access".to_string()),
            Some("secret".to_string()),
            public_url.map(String::from),
            None,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_resolve_falls_back_to_endpoint() {
        let key = AssetKey::new("ab/cd.jpg").unwrap();
        let thumb = SizeLabel::new("thumb").unwrap();

        let urls = backend(None).resolve(&key, &[thumb]);
        assert_eq!(urls["o"], "http://127.0.0.1:9000/media/ab/cd.jpg");
        assert_eq!(urls["thumb"], "http://127.0.0.1:9000/media/ab/cd_thumb.jpg");
    }

    #[tokio::test]
    async fn test_resolve_prefers_public_url() {
        let key = AssetKey::new("ab/cd.jpg").unwrap();
        let urls = backend(Some("https://cdn.example.com")).resolve(&key, &[]);

        assert_eq!(urls.len(), 1);
        assert_eq!(urls["o"], "https://cdn.example.com/ab/cd.jpg");
    }

    #[test]
    fn test_content_type() {
        assert_eq!(content_type("ab/cd.JPG"), mime::IMAGE_JPEG);
        assert_eq!(content_type("ab/cd_thumb.png"), mime::IMAGE_PNG);
        assert_eq!(content_type("ab/cd.webp").to_string(), "image/webp");
        assert_eq!(content_type("a.b/cd"), mime::APPLICATION_OCTET_STREAM);
    }

    #[tokio::test]
    async fn test_write_creates_missing_bucket() -> anyhow::Result<()> {
        let (backend, seen) = mocked(None, |method, path| match (method, path) {
            ("HEAD", "/media") => status(404),
            _ => ok(),
        });
        let key = AssetKey::new("ab/cd.jpg")?;

        let mut source: &[u8] = b"original bytes";
        let report = backend
            .write(&key, &mut source, &thumb_only(), copying_deriver())
            .await?;

        assert_eq!(report.original_size, 14);
        assert_eq!(report.variants.len(), 1);
        assert_eq!(
            requests(&seen),
            vec![
                "HEAD /media",
                "PUT /media",
                "PUT /media/ab/cd.jpg",
                "PUT /media/ab/cd_thumb.jpg",
            ],
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_existing_bucket_is_not_created_again() -> anyhow::Result<()> {
        let (backend, seen) = mocked(None, |_, _| ok());
        let key = AssetKey::new("ab/cd.jpg")?;

        let mut source: &[u8] = b"original bytes";
        backend
            .write(&key, &mut source, &SizeSpecs::new(), copying_deriver())
            .await?;

        assert_eq!(requests(&seen), vec!["HEAD /media", "PUT /media/ab/cd.jpg"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_bucket_already_owned_counts_as_created() -> anyhow::Result<()> {
        let (backend, _seen) = mocked(None, |method, path| match (method, path) {
            ("HEAD", "/media") => status(404),
            ("PUT", "/media") => Reply::Mock(MockRequestDispatcher::with_status(409).with_body(ALREADY_OWNED)),
            _ => ok(),
        });
        let key = AssetKey::new("ab/cd.jpg")?;

        let mut source: &[u8] = b"original bytes";
        let report = backend
            .write(&key, &mut source, &thumb_only(), copying_deriver())
            .await?;

        assert_eq!(report.variants.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_unusable_bucket_fails_before_upload() -> anyhow::Result<()> {
        let (backend, seen) = mocked(None, |method, _| match method {
            "HEAD" => status(403),
            _ => ok(),
        });
        let key = AssetKey::new("ab/cd.jpg")?;

        let mut source: &[u8] = b"original bytes";
        let err = backend
            .write(&key, &mut source, &thumb_only(), copying_deriver())
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::ContainerCreationFailed { .. }));
        assert_eq!(requests(&seen), vec!["HEAD /media"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_failing_variant_upload_is_reported() -> anyhow::Result<()> {
        let (backend, _seen) = mocked(None, |method, path| match (method, path) {
            ("PUT", "/media/ab/cd_thumb.jpg") => status(500),
            _ => ok(),
        });
        let key = AssetKey::new("ab/cd.jpg")?;

        let mut source: &[u8] = b"original bytes";
        let err = backend
            .write(&key, &mut source, &thumb_only(), copying_deriver())
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::TransferFailed { operation: Operation::Persist, .. }));
        assert_eq!(err.failed_labels(), vec!["thumb"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_put_applies_request_timeout() -> anyhow::Result<()> {
        let (backend, _seen) = mocked(Some(Duration::from_millis(50)), |method, _| match method {
            "PUT" => Reply::Stall,
            _ => ok(),
        });
        let key = AssetKey::new("ab/cd.jpg")?;

        let mut source: &[u8] = b"original bytes";
        let err = backend
            .write(&key, &mut source, &thumb_only(), copying_deriver())
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::TransferFailed { operation: Operation::Persist, .. }));
        assert_eq!(err.failed_labels(), vec!["o"]);
        assert!(err.to_string().contains("timed out"), "{}", err);
        Ok(())
    }

    #[tokio::test]
    async fn test_fetch() -> anyhow::Result<()> {
        let (backend, _seen) = mocked(None, |method, path| match (method, path) {
            ("GET", "/media/ab/cd.jpg") => Reply::Mock(MockRequestDispatcher::default().with_body("stored original")),
            ("GET", "/media/ab/cd_thumb.jpg") => Reply::Mock(MockRequestDispatcher::with_status(404).with_body(NO_SUCH_KEY)),
            ("GET", "/media/ab/cd_small.jpg") => status(404),
            _ => status(500),
        });
        let key = AssetKey::new("ab/cd.jpg")?;
        let (thumb, small, large) = (SizeLabel::new("thumb")?, SizeLabel::new("small")?, SizeLabel::new("large")?);

        let original = backend.fetch(&key, Variant::Original).await?;
        assert_eq!(original.as_deref(), Some(&b"stored original"[..]));

        assert!(backend.fetch(&key, Variant::Size(&thumb)).await?.is_none());
        assert!(backend.fetch(&key, Variant::Size(&small)).await?.is_none());

        let err = backend.fetch(&key, Variant::Size(&large)).await.unwrap_err();
        assert!(matches!(err, StorageError::Backend { operation: Operation::Read, .. }));
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_treats_missing_objects_as_removed() -> anyhow::Result<()> {
        let (backend, seen) = mocked(None, |method, path| match (method, path) {
            ("DELETE", "/media/ab/cd.jpg") => status(204),
            _ => status(404),
        });
        let key = AssetKey::new("ab/cd.jpg")?;

        backend.delete(&key, &[SizeLabel::new("thumb")?]).await?;
        assert_eq!(
            requests(&seen),
            vec!["DELETE /media/ab/cd.jpg", "DELETE /media/ab/cd_thumb.jpg"],
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_attempts_every_object() -> anyhow::Result<()> {
        let (backend, seen) = mocked(None, |_, path| match path {
            "/media/ab/cd_small.jpg" => status(500),
            "/media/ab/cd_thumb.jpg" => status(404),
            "/media/ab/cd_large.jpg" => status(503),
            _ => status(204),
        });
        let key = AssetKey::new("ab/cd.jpg")?;
        let labels = [SizeLabel::new("small")?, SizeLabel::new("thumb")?, SizeLabel::new("large")?];

        let err = backend.delete(&key, &labels).await.unwrap_err();

        assert!(matches!(err, StorageError::Partial { .. }));
        assert_eq!(err.failed_labels(), vec!["small", "large"]);
        assert_eq!(requests(&seen).len(), 4);
        Ok(())
    }
}

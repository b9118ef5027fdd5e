use std::future::Future;
use std::time::Instant;

use bytes::Bytes;
use futures::future::join_all;
use hashbrown::HashMap;
use tracing_futures::Instrument;

use crate::asset::{AssetKey, SizeLabel, SizeSpecs, Variant};
use crate::error::{Operation, StorageError, StorageResult};
use crate::location::locate;
use crate::processor::{derive_variants, SharedDeriver};

pub mod backends;
pub mod template;

pub use template::{ResolvedUrls, SourceStream, StorageAdapter, WriteReport};

/// Makes sure a non-empty base URL ends in exactly one `/`.
pub(crate) fn normalize_base_url(base_url: &str) -> String {
    if base_url.is_empty() {
        return String::new();
    }

    format!("{}/", base_url.trim_end_matches('/'))
}

/// Joins a normalized base URL with the location of every requested variant.
pub(crate) fn build_urls(base_url: &str, key: &AssetKey, sizes: &[SizeLabel]) -> ResolvedUrls {
    let mut urls = HashMap::with_capacity(sizes.len() + 1);

    urls.insert(
        Variant::Original.label().to_string(),
        format!("{}{}", base_url, locate(key, Variant::Original)),
    );

    for label in sizes {
        urls.insert(
            label.to_string(),
            format!("{}{}", base_url, locate(key, Variant::Size(label))),
        );
    }

    urls
}

/// Derives every size from the persisted original and hands each result to
/// `put` along with its location.
///
/// Returns the byte size of every persisted variant and every failure,
/// derivation and persistence failures alike.
pub(crate) async fn store_variants<F, Fut>(
    key: &AssetKey,
    original: Bytes,
    sizes: &SizeSpecs,
    deriver: SharedDeriver,
    put: F,
) -> (HashMap<SizeLabel, usize>, Vec<StorageError>)
where
    F: Fn(SizeLabel, String, Bytes) -> Fut,
    Fut: Future<Output = StorageResult<()>>,
{
    let mut stored = HashMap::with_capacity(sizes.len());
    let mut failures = vec![];

    if sizes.is_empty() {
        return (stored, failures);
    }

    let local_sizes = sizes.clone();
    let derived = match tokio::task::spawn_blocking(move || {
        derive_variants(original, &local_sizes, &deriver)
    })
    .await
    {
        Ok(derived) => derived,
        Err(e) => {
            for label in sizes.keys() {
                failures.push(StorageError::transfer(
                    Operation::Derive,
                    key.as_str(),
                    label.as_str(),
                    &e,
                ));
            }
            return (stored, failures);
        },
    };

    let mut pending = vec![];
    for variant in derived {
        match variant.result {
            Ok(data) => {
                let location = locate(key, Variant::Size(&variant.label));
                let size = data.len();
                let span = debug_span!("store_variant", label = %variant.label, size);
                let label = variant.label.clone();
                let fut = put(variant.label, location, data).instrument(span);
                pending.push(async move { (label, size, fut.await) });
            },
            Err(e) => {
                warn!("Failed to derive {} of {}: {:#}", &variant.label, key, e);
                failures.push(StorageError::transfer(
                    Operation::Derive,
                    key.as_str(),
                    variant.label.as_str(),
                    format!("{:#}", e),
                ));
            },
        }
    }

    for (label, size, result) in join_all(pending).await {
        match result {
            Ok(()) => {
                stored.insert(label, size);
            },
            Err(e) => failures.push(e),
        }
    }

    (stored, failures)
}

/// Turns the outcome of a write into the caller facing result.
pub(crate) fn finish_write(
    key: &AssetKey,
    original: &[u8],
    variants: HashMap<SizeLabel, usize>,
    failures: Vec<StorageError>,
    started: Instant,
) -> StorageResult<WriteReport> {
    if let Some(err) = StorageError::collect(key.as_str(), failures) {
        return Err(err);
    }

    Ok(WriteReport {
        key: key.clone(),
        checksum: crate::utils::crc_checksum(original),
        original_size: original.len(),
        variants,
        processing_time: started.elapsed().as_secs_f32(),
    })
}

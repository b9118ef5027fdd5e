//! Pluggable storage for media assets and their derived size variants.
//!
//! An asset is written once under its key together with one variant per
//! requested size, later resolved to URLs and eventually deleted. Backends
//! implement [`StorageAdapter`] and are picked at startup from
//! [`BackendConfigs`].

#[macro_use]
extern crate tracing;

pub mod asset;
pub mod config;
pub mod error;
pub mod location;
pub mod processor;
pub mod storage;
mod utils;


pub use asset::{AssetKey, ResizeMode, ResizingFilter, SizeLabel, SizeParams, SizeSpecs, Variant, ORIGINAL_LABEL};
pub use error::{Operation, StorageError, StorageResult};
pub use location::{container_of, locate};
pub use processor::{Deriver, ImageResizer, SharedDeriver};
pub use storage::backends::{BackendConfigs, BlobStorageBackend, FileSystemBackend, MemoryBackend};
pub use storage::{ResolvedUrls, SourceStream, StorageAdapter, WriteReport};

pub mod blob_storage;
pub mod filesystem;
pub mod memory;
mod register;

pub use blob_storage::BlobStorageBackend;
pub use filesystem::FileSystemBackend;
pub use memory::MemoryBackend;
pub use register::BackendConfigs;

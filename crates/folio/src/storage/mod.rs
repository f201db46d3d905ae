//! Object storage for page images and editions.

pub mod filesystem;

pub use filesystem::FileObjectStore;

use crate::error::StorageError;

/// Write-only object store. Callers keep the returned reference and never
/// read the bytes back.
pub trait ObjectStore: Send + Sync {
    /// Stores `bytes` under the relative `path` and returns a URL for it.
    fn put(&self, path: &str, bytes: &[u8], content_type: &str) -> Result<String, StorageError>;
}

//! Content-addressed blob store for binary attachments.
//!
//! Blobs (images, PDFs, embedded files) live outside the CRDT document; the
//! document only references them by key. Each workspace document owns one
//! blob store, and the native store provider reconciles its keys against the
//! out-of-process service.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{Result, SyncError};

/// Compute the content key for a blob.
// Uses a simple hash for now; can upgrade to SHA-256 when sha2 crate is added
pub fn blob_key(content: &[u8]) -> String {
    use std::hash::{DefaultHasher, Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Storage for binary attachments, keyed by content hash (or an opaque key
/// assigned by the caller).
///
/// Implementations must be thread-safe: blob reconciliation reads keys and
/// bytes from spawned tasks.
pub trait BlobStore: Send + Sync {
    /// List all blob keys currently held.
    fn list(&self) -> Result<Vec<String>>;

    /// Fetch a blob's bytes. Returns `None` for an unknown key.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store a blob under an explicit key.
    fn put(&self, key: &str, data: &[u8]) -> Result<()>;

    /// Store a blob under its content key and return the key.
    fn put_hashed(&self, data: &[u8]) -> Result<String> {
        let key = blob_key(data);
        self.put(&key, data)?;
        Ok(key)
    }
}

/// In-memory blob store.
///
/// Used in tests and as the default store for freshly opened workspaces
/// before a durable backend attaches.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
    /// Keys whose reads should fail, for fault-injection in tests.
    poisoned: RwLock<Vec<String>>,
}

impl MemoryBlobStore {
    /// Create a new empty blob store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent reads of `key` fail. Test helper for exercising
    /// partial-failure paths in blob reconciliation.
    pub fn poison(&self, key: &str) {
        self.poisoned.write().unwrap().push(key.to_string());
    }
}

impl BlobStore for MemoryBlobStore {
    fn list(&self) -> Result<Vec<String>> {
        let blobs = self.blobs.read().unwrap();
        Ok(blobs.keys().cloned().collect())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if self.poisoned.read().unwrap().iter().any(|k| k == key) {
            return Err(SyncError::Blob {
                key: key.to_string(),
                message: "read failed".to_string(),
            });
        }
        let blobs = self.blobs.read().unwrap();
        Ok(blobs.get(key).cloned())
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let mut blobs = self.blobs.write().unwrap();
        blobs.insert(key.to_string(), data.to_vec());
        Ok(())
    }
}

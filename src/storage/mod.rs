//! Storage abstraction for the durable update log.
//!
//! The local store provider persists documents as a compacted snapshot plus
//! an append-only log of incremental updates. The log keeps enough history
//! for catch-up after a reconnect; [`UpdateStorage::compact`] folds old
//! entries back into the snapshot.

mod memory;
mod sqlite;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

use crate::doc::OriginTag;
use crate::error::Result;

/// A persisted incremental update.
#[derive(Debug, Clone)]
pub struct StoredUpdate {
    /// Monotonically increasing id within the store
    pub update_id: i64,

    /// Workspace/document id this update belongs to
    pub doc_name: String,

    /// Binary yrs update data
    pub data: Vec<u8>,

    /// Unix timestamp when this update was recorded (milliseconds)
    pub timestamp: i64,

    /// Which provider (or the local editor) produced the update
    pub origin: OriginTag,
}

/// Trait for update-log storage backends.
///
/// Implementations maintain two kinds of data per document:
/// 1. **Snapshot**: compacted full state
/// 2. **Update log**: incremental updates in arrival order
///
/// Implementations must be thread-safe: the local store provider appends
/// from document observers and loads from a spawned catch-up task.
pub trait UpdateStorage: Send + Sync {
    /// Load the document snapshot. Returns `None` if the document is unknown.
    fn load_doc(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Overwrite the document snapshot.
    fn save_doc(&self, name: &str, state: &[u8]) -> Result<()>;

    /// Delete a document and all its updates.
    fn delete_doc(&self, name: &str) -> Result<()>;

    /// Append an incremental update to the log. Returns the new record id.
    fn append_update(&self, name: &str, update: &[u8], origin: OriginTag) -> Result<i64>;

    /// All updates with id greater than `since_id`, in id order.
    fn get_updates_since(&self, name: &str, since_id: i64) -> Result<Vec<StoredUpdate>>;

    /// All updates for a document, in id order.
    fn get_all_updates(&self, name: &str) -> Result<Vec<StoredUpdate>> {
        self.get_updates_since(name, 0)
    }

    /// Latest update id for a document, or 0 if the log is empty.
    fn get_latest_update_id(&self, name: &str) -> Result<i64>;

    /// Fold all but the most recent `keep_updates` log entries into the
    /// snapshot.
    fn compact(&self, name: &str, keep_updates: usize) -> Result<()>;
}

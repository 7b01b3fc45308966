//! In-memory storage implementation for testing.

use std::collections::HashMap;
use std::sync::RwLock;

use yrs::updates::decoder::Decode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use super::{StoredUpdate, UpdateStorage};
use crate::doc::OriginTag;
use crate::error::{Result, SyncError};

/// In-memory update-log storage.
///
/// Thread-safe via `RwLock`; data is lost when dropped. Used in unit tests
/// and as the fallback backend when no database path is configured.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    /// Document snapshots (name -> binary state)
    docs: RwLock<HashMap<String, Vec<u8>>>,

    /// Update logs (name -> list of updates)
    updates: RwLock<HashMap<String, Vec<StoredUpdate>>>,

    /// Counter for generating update ids
    next_id: RwLock<i64>,

    /// When set, every operation fails. Test helper for exercising the
    /// load-failure path of the local store provider.
    fail: RwLock<bool>,
}

impl MemoryStorage {
    /// Create a new empty in-memory storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail with an I/O error.
    pub fn fail_all(&self, fail: bool) {
        *self.fail.write().unwrap() = fail;
    }

    fn check(&self) -> Result<()> {
        if *self.fail.read().unwrap() {
            return Err(SyncError::Io(std::io::Error::other(
                "simulated storage failure",
            )));
        }
        Ok(())
    }

    fn next_update_id(&self) -> i64 {
        let mut id = self.next_id.write().unwrap();
        *id += 1;
        *id
    }
}

impl UpdateStorage for MemoryStorage {
    fn load_doc(&self, name: &str) -> Result<Option<Vec<u8>>> {
        self.check()?;
        let docs = self.docs.read().unwrap();
        Ok(docs.get(name).cloned())
    }

    fn save_doc(&self, name: &str, state: &[u8]) -> Result<()> {
        self.check()?;
        let mut docs = self.docs.write().unwrap();
        docs.insert(name.to_string(), state.to_vec());
        Ok(())
    }

    fn delete_doc(&self, name: &str) -> Result<()> {
        self.check()?;
        self.docs.write().unwrap().remove(name);
        self.updates.write().unwrap().remove(name);
        Ok(())
    }

    fn append_update(&self, name: &str, update: &[u8], origin: OriginTag) -> Result<i64> {
        self.check()?;
        let id = self.next_update_id();
        let stored = StoredUpdate {
            update_id: id,
            doc_name: name.to_string(),
            data: update.to_vec(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            origin,
        };

        let mut updates = self.updates.write().unwrap();
        updates.entry(name.to_string()).or_default().push(stored);
        Ok(id)
    }

    fn get_updates_since(&self, name: &str, since_id: i64) -> Result<Vec<StoredUpdate>> {
        self.check()?;
        let updates = self.updates.read().unwrap();
        Ok(updates
            .get(name)
            .map(|u| {
                u.iter()
                    .filter(|u| u.update_id > since_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn get_latest_update_id(&self, name: &str) -> Result<i64> {
        self.check()?;
        let updates = self.updates.read().unwrap();
        Ok(updates
            .get(name)
            .and_then(|u| u.last())
            .map(|u| u.update_id)
            .unwrap_or(0))
    }

    fn compact(&self, name: &str, keep_updates: usize) -> Result<()> {
        self.check()?;

        let snapshot = self.load_doc(name)?;
        let log = self.get_all_updates(name)?;
        if snapshot.is_none() && log.is_empty() {
            return Ok(());
        }
        if log.len() <= keep_updates {
            return Ok(());
        }

        let cutoff = log.len() - keep_updates;
        let (old, kept) = log.split_at(cutoff);

        // Fold the snapshot and old updates into a fresh doc.
        let doc = Doc::new();
        {
            let mut txn = doc.transact_mut();
            if let Some(state) = &snapshot
                && let Ok(update) = Update::decode_v1(state)
            {
                let _ = txn.apply_update(update);
            }
            for stored in old {
                if let Ok(update) = Update::decode_v1(&stored.data) {
                    let _ = txn.apply_update(update);
                }
            }
        }
        let state = {
            let txn = doc.transact();
            txn.encode_state_as_update_v1(&StateVector::default())
        };

        // Snapshot first, then trim the log.
        self.save_doc(name, &state)?;
        let mut updates = self.updates.write().unwrap();
        updates.insert(name.to_string(), kept.to_vec());
        Ok(())
    }
}

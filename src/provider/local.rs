//! Durable local persistence provider.
//!
//! Always-on storage of the document's update log over an [`UpdateStorage`]
//! backend. `connect()` installs the outbound write path immediately and
//! spawns an asynchronous catch-up load; readiness is surfaced through a
//! [`CallbackSet`] that fires exactly once when the initial load lands.
//!
//! An intentional disconnect while the load is still in flight is swallowed
//! (the provider was told to stand down, there is nothing to report); any
//! other load failure is surfaced once through [`LocalStoreProvider::last_error`]
//! and the log.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::task::JoinHandle;

use super::{Provider, ProviderFlavour};
use crate::callback::CallbackSet;
use crate::doc::{DocHandle, OriginTag};
use crate::error::{Result, SyncError};
use crate::storage::UpdateStorage;

struct LocalSession {
    /// Outbound log append path; dropping it stops forwarding
    _doc_sub: yrs::Subscription,
    load_task: JoinHandle<()>,
}

/// Provider persisting the update log to local durable storage.
pub struct LocalStoreProvider {
    doc: Arc<DocHandle>,
    storage: Arc<dyn UpdateStorage>,
    callbacks: Arc<CallbackSet>,
    session: Mutex<Option<LocalSession>>,

    /// Connect cycle counter. A load task only reports for the cycle it was
    /// started in; disconnect bumps the epoch so a stale load goes quiet.
    epoch: Arc<AtomicU64>,

    /// Last surfaced load failure, cleared on the next connect.
    last_error: Arc<RwLock<Option<String>>>,
}

impl LocalStoreProvider {
    /// Create a provider over the given storage backend.
    pub fn new(doc: Arc<DocHandle>, storage: Arc<dyn UpdateStorage>) -> Self {
        Self {
            doc,
            storage,
            callbacks: Arc::new(CallbackSet::new()),
            session: Mutex::new(None),
            epoch: Arc::new(AtomicU64::new(0)),
            last_error: Arc::new(RwLock::new(None)),
        }
    }

    /// Register a callback fired once the initial catch-up load completes.
    ///
    /// If the load already completed, the callback fires immediately.
    pub fn on_synced<F: FnOnce() + Send + 'static>(&self, callback: F) {
        self.callbacks.add(callback);
    }

    /// Whether the initial catch-up load has completed for this connect cycle.
    pub fn is_synced(&self) -> bool {
        self.callbacks.is_ready()
    }

    /// The load failure from the current connect cycle, if any.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().unwrap().clone()
    }

    /// Fold old log entries into the snapshot, keeping the most recent
    /// `keep_updates`.
    pub fn compact(&self, keep_updates: usize) -> Result<()> {
        self.storage.compact(self.doc.workspace_id(), keep_updates)
    }

    fn run_catch_up(
        doc: &DocHandle,
        storage: &dyn UpdateStorage,
        epoch: &AtomicU64,
        this_epoch: u64,
    ) -> Result<bool> {
        let name = doc.workspace_id();
        let snapshot = storage.load_doc(name)?;
        let log = storage.get_all_updates(name)?;

        // Told to disconnect while we were reading: stand down quietly.
        if epoch.load(Ordering::SeqCst) != this_epoch {
            return Ok(false);
        }

        if let Some(state) = snapshot {
            doc.apply_update(&state, OriginTag::LocalStore)?;
        }
        for stored in log {
            doc.apply_update(&stored.data, OriginTag::LocalStore)?;
        }

        // Write the merged state back as the new baseline, so edits the
        // in-memory document had before this load are durable too.
        storage.save_doc(name, &doc.encode_full_state())?;
        Ok(true)
    }
}

impl Provider for LocalStoreProvider {
    fn flavour(&self) -> ProviderFlavour {
        ProviderFlavour::LocalStore
    }

    fn background(&self) -> bool {
        true
    }

    fn connect(&self) -> Result<()> {
        let mut session = self.session.lock().unwrap();
        if session.is_some() {
            return Err(SyncError::AlreadyConnected(self.flavour().to_string()));
        }

        let workspace_id = self.doc.workspace_id().to_string();
        log::info!("[LocalStore] connect {}", workspace_id);
        *self.last_error.write().unwrap() = None;
        let this_epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;

        // Outbound path first: updates arriving during catch-up are appended
        // too. Catch-up replays carry our own origin and are skipped here.
        let storage = Arc::clone(&self.storage);
        let name = workspace_id.clone();
        let doc_sub = self.doc.on_update(move |update, origin| {
            if origin == Some(OriginTag::LocalStore) {
                return;
            }
            let origin = origin.unwrap_or(OriginTag::Local);
            if let Err(e) = storage.append_update(&name, update, origin) {
                log::error!("[LocalStore] failed to append update: {}", e);
            }
        });

        let doc = Arc::clone(&self.doc);
        let storage = Arc::clone(&self.storage);
        let epoch = Arc::clone(&self.epoch);
        let callbacks = Arc::clone(&self.callbacks);
        let last_error = Arc::clone(&self.last_error);
        let load_task = tokio::spawn(async move {
            match Self::run_catch_up(&doc, storage.as_ref(), &epoch, this_epoch) {
                Ok(true) => {
                    // The epoch is re-read under the gate lock: a disconnect
                    // landing after the load finished but before this point
                    // keeps the gate closed and the callbacks queued.
                    let opened =
                        callbacks.set_ready_if(|| epoch.load(Ordering::SeqCst) == this_epoch);
                    if opened {
                        log::debug!("[LocalStore] catch-up complete for {}", workspace_id);
                    } else {
                        log::debug!(
                            "[LocalStore] disconnected as catch-up finished for {}",
                            workspace_id
                        );
                    }
                }
                Ok(false) => {
                    log::debug!(
                        "[LocalStore] disconnected before catch-up finished for {}",
                        workspace_id
                    );
                }
                Err(e) => {
                    if epoch.load(Ordering::SeqCst) == this_epoch {
                        log::error!("[LocalStore] catch-up failed for {}: {}", workspace_id, e);
                        *last_error.write().unwrap() = Some(e.to_string());
                    }
                }
            }
        });

        *session = Some(LocalSession {
            _doc_sub: doc_sub,
            load_task,
        });
        Ok(())
    }

    fn disconnect(&self) -> Result<()> {
        let mut session = self.session.lock().unwrap();
        let Some(active) = session.take() else {
            return Err(SyncError::NotConnected(self.flavour().to_string()));
        };
        log::info!("[LocalStore] disconnect {}", self.doc.workspace_id());

        // Invalidate any in-flight load, then stop it. Readiness flips back
        // to loading; callbacks not yet fired stay queued for the next
        // successful connect.
        self.epoch.fetch_add(1, Ordering::SeqCst);
        active.load_task.abort();
        self.callbacks.reset();
        Ok(())
    }

    fn cleanup(&self) -> Result<()> {
        if self.is_connected() {
            self.disconnect()?;
        }
        // Persisted data is deliberately left in place; permanent document
        // deletion is owned by the workspace layer, not the sync layer.
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.session.lock().unwrap().is_some()
    }
}

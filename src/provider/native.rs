//! Native out-of-process store provider (desktop).
//!
//! On desktop the document is additionally persisted by a native service
//! living outside this process, reached over the [`NativeService`] RPC
//! boundary. On connect the provider pulls the service's persisted log,
//! pushes the merged state back once as a baseline, then forwards every
//! update that did not itself come from the service. Blob reconciliation
//! runs alongside: local blob keys minus service-known keys are pushed
//! independently, and one blob's failure never stops the rest.
//!
//! The native store's lifecycle is owned by the host process: `disconnect`
//! is a no-op placeholder and `cleanup` is unsupported.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use futures_util::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{Provider, ProviderFlavour};
use crate::blob::BlobStore;
use crate::doc::{DocHandle, OriginTag};
use crate::error::{Result, SyncError};
use crate::transport::BoxFuture;

/// RPC boundary to the native store service.
pub trait NativeService: Send + Sync {
    /// Full persisted update log for a document, or `None` if unknown.
    fn get_doc(&self, id: &str) -> BoxFuture<'_, Result<Option<Vec<u8>>>>;

    /// Apply an update to the persisted document.
    fn apply_doc_update<'a>(&'a self, id: &'a str, update: &'a [u8]) -> BoxFuture<'a, Result<()>>;

    /// Keys of the blobs the service already has for a document.
    fn get_persisted_blob_keys(&self, id: &str) -> BoxFuture<'_, Result<HashSet<String>>>;

    /// Persist one blob's raw bytes.
    fn add_blob<'a>(
        &'a self,
        id: &'a str,
        key: &'a str,
        data: &'a [u8],
    ) -> BoxFuture<'a, Result<()>>;
}

struct NativeSession {
    /// Outbound forwarding; kept for the life of the provider
    _doc_sub: yrs::Subscription,
    sync_task: JoinHandle<()>,
    blob_task: JoinHandle<()>,
}

/// Provider delegating persistence to the native desktop service.
pub struct NativeStoreProvider {
    doc: Arc<DocHandle>,
    service: Arc<dyn NativeService>,
    session: Mutex<Option<NativeSession>>,
}

impl NativeStoreProvider {
    /// Create a provider for a desktop runtime.
    ///
    /// The desktop capability is injected by the caller (the registry only
    /// constructs this provider when it holds a service handle); invoking
    /// this without the capability is a configuration error.
    pub fn new(
        doc: Arc<DocHandle>,
        service: Arc<dyn NativeService>,
        desktop: bool,
    ) -> Result<Self> {
        if !desktop {
            return Err(SyncError::Precondition(
                "native store provider requires a desktop runtime".to_string(),
            ));
        }
        Ok(Self {
            doc,
            service,
            session: Mutex::new(None),
        })
    }

    async fn run_sync(
        doc: Arc<DocHandle>,
        service: Arc<dyn NativeService>,
        mut out_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        let id = doc.workspace_id().to_string();

        // Pull whatever the service has persisted. The private origin keeps
        // these updates from being forwarded straight back.
        match service.get_doc(&id).await {
            Ok(Some(bytes)) => {
                if let Err(e) = doc.apply_update(&bytes, OriginTag::NativeStore) {
                    log::warn!("[NativeStore] failed to apply persisted state: {}", e);
                }
            }
            Ok(None) => {}
            Err(e) => {
                log::error!("[NativeStore] get_doc failed: {}", e);
                return;
            }
        }

        // Push the merged state back once, so updates the in-memory document
        // had and the service lacked become durable.
        if let Err(e) = service.apply_doc_update(&id, &doc.encode_full_state()).await {
            log::error!("[NativeStore] baseline push failed: {}", e);
            return;
        }

        log::info!("[NativeStore] connected {}", id);
        while let Some(update) = out_rx.recv().await {
            if let Err(e) = service.apply_doc_update(&id, &update).await {
                log::warn!("[NativeStore] forward failed: {}", e);
            }
        }
    }

    /// Push every local blob the service does not have yet.
    ///
    /// Each missing blob is handled independently; a read or push failure is
    /// logged and skipped.
    async fn reconcile_blobs(doc: &DocHandle, service: &dyn NativeService) {
        let id = doc.workspace_id();

        let persisted = match service.get_persisted_blob_keys(id).await {
            Ok(keys) => keys,
            Err(e) => {
                log::error!("[NativeStore] listing persisted blobs failed: {}", e);
                return;
            }
        };
        let local = match doc.blobs().list() {
            Ok(keys) => keys,
            Err(e) => {
                log::error!("[NativeStore] listing local blobs failed: {}", e);
                return;
            }
        };

        let missing: Vec<String> = local
            .into_iter()
            .filter(|k| !persisted.contains(k))
            .collect();
        if missing.is_empty() {
            return;
        }
        log::info!("[NativeStore] persisting {} blobs for {}", missing.len(), id);

        let pushes = missing.iter().map(|key| async move {
            match doc.blobs().get(key) {
                Ok(Some(data)) => {
                    if let Err(e) = service.add_blob(id, key, &data).await {
                        log::warn!("[NativeStore] blob push failed for '{}': {}", key, e);
                    }
                }
                Ok(None) => log::warn!("[NativeStore] blob not found: {}", key),
                Err(e) => log::warn!("[NativeStore] blob read failed for '{}': {}", key, e),
            }
        });
        join_all(pushes).await;
    }
}

impl std::fmt::Debug for NativeStoreProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeStoreProvider")
            .field("workspace_id", &self.doc.workspace_id())
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl Provider for NativeStoreProvider {
    fn flavour(&self) -> ProviderFlavour {
        ProviderFlavour::NativeStore
    }

    fn background(&self) -> bool {
        true
    }

    fn connect(&self) -> Result<()> {
        let mut session = self.session.lock().unwrap();
        if session.is_some() {
            return Err(SyncError::AlreadyConnected(self.flavour().to_string()));
        }

        // Outbound path first: anything applied while the catch-up runs is
        // queued and drained after the baseline push.
        let (out_tx, out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let doc_sub = self.doc.on_update(move |update, origin| {
            if origin == Some(OriginTag::NativeStore) {
                return;
            }
            let _ = out_tx.send(update.to_vec());
        });

        let sync_task = tokio::spawn(Self::run_sync(
            Arc::clone(&self.doc),
            Arc::clone(&self.service),
            out_rx,
        ));

        let doc = Arc::clone(&self.doc);
        let service = Arc::clone(&self.service);
        let blob_task = tokio::spawn(async move {
            Self::reconcile_blobs(&doc, service.as_ref()).await;
        });

        *session = Some(NativeSession {
            _doc_sub: doc_sub,
            sync_task,
            blob_task,
        });
        Ok(())
    }

    fn disconnect(&self) -> Result<()> {
        // Placeholder: the process boundary outlives the document view, so
        // there is no native teardown to perform.
        log::debug!("[NativeStore] disconnect is a no-op");
        Ok(())
    }

    fn cleanup(&self) -> Result<()> {
        // The native store's lifecycle belongs to the host process.
        Err(SyncError::Unsupported(
            "native store cleanup is managed by the host process".to_string(),
        ))
    }

    fn is_connected(&self) -> bool {
        self.session.lock().unwrap().is_some()
    }
}

impl Drop for NativeStoreProvider {
    fn drop(&mut self) {
        if let Some(session) = self.session.lock().unwrap().take() {
            session.sync_task.abort();
            session.blob_task.abort();
        }
    }
}

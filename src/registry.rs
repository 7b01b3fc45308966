//! Provider assembly.
//!
//! The registry owns the process-wide sync dependencies (broadcast hub,
//! update storage, remote transport, native service handle) and assembles the
//! provider set for a document from the runtime configuration. Assembly is
//! pure filtering: which providers exist is decided entirely by the
//! configuration and the injected capabilities, never by probing at connect
//! time.

use std::sync::Arc;

use tokio::sync::watch;

use crate::config::SyncConfig;
use crate::doc::DocHandle;
use crate::error::Result;
use crate::provider::{
    BroadcastHub, BroadcastProvider, LocalStoreProvider, NativeService, NativeStoreProvider,
    Provider, RemoteOptions, RemoteProvider,
};
use crate::storage::{MemoryStorage, SqliteStorage, UpdateStorage};
use crate::transport::RemoteTransport;

/// Process-wide factory for per-document provider sets.
pub struct ProviderRegistry {
    config: SyncConfig,
    hub: Arc<BroadcastHub>,
    storage: Arc<dyn UpdateStorage>,
    remote: Option<RemoteDeps>,
    native: Option<Arc<dyn NativeService>>,
}

struct RemoteDeps {
    transport: Arc<dyn RemoteTransport>,
    token: watch::Receiver<String>,
}

impl ProviderRegistry {
    /// Create a registry with the always-available dependencies.
    pub fn new(config: SyncConfig, hub: Arc<BroadcastHub>, storage: Arc<dyn UpdateStorage>) -> Self {
        Self {
            config,
            hub,
            storage,
            remote: None,
            native: None,
        }
    }

    /// Create a registry with the storage backend chosen by the
    /// configuration: the SQLite update log when `db_path` is set, in-memory
    /// storage otherwise.
    pub fn from_config(config: SyncConfig, hub: Arc<BroadcastHub>) -> Result<Self> {
        let storage: Arc<dyn UpdateStorage> = match &config.db_path {
            Some(path) => {
                log::info!("[Registry] opening update log at {}", path.display());
                Arc::new(SqliteStorage::open(path)?)
            }
            None => Arc::new(MemoryStorage::new()),
        };
        Ok(Self::new(config, hub, storage))
    }

    /// Enable remote sync. The provider is only assembled when the
    /// configuration also carries a remote endpoint.
    pub fn with_remote(
        mut self,
        transport: Arc<dyn RemoteTransport>,
        token: watch::Receiver<String>,
    ) -> Self {
        self.remote = Some(RemoteDeps { transport, token });
        self
    }

    /// Inject the native store service handle. The provider is only
    /// assembled when the configuration marks a desktop runtime.
    pub fn with_native_service(mut self, service: Arc<dyn NativeService>) -> Self {
        self.native = Some(service);
        self
    }

    /// Assemble the provider set for one document.
    ///
    /// Order is fixed: broadcast, local store, remote, native store. The
    /// local store provider is always present; it is the durability floor.
    pub fn assemble(&self, doc: &Arc<DocHandle>) -> Result<ProviderSet> {
        let mut providers: Vec<Box<dyn Provider>> = Vec::new();

        if self.config.enable_broadcast {
            providers.push(Box::new(BroadcastProvider::new(
                Arc::clone(doc),
                Arc::clone(&self.hub),
            )));
        }

        providers.push(Box::new(LocalStoreProvider::new(
            Arc::clone(doc),
            Arc::clone(&self.storage),
        )));

        if let Some(remote) = &self.remote
            && let Some(endpoint) = &self.config.remote_endpoint
        {
            providers.push(Box::new(RemoteProvider::new(
                Arc::clone(doc),
                Arc::clone(&remote.transport),
                RemoteOptions {
                    endpoint: endpoint.clone(),
                    token: remote.token.clone(),
                },
            )));
        }

        if self.config.desktop
            && let Some(service) = &self.native
        {
            providers.push(Box::new(NativeStoreProvider::new(
                Arc::clone(doc),
                Arc::clone(service),
                true,
            )?));
        }

        log::info!(
            "[Registry] assembled {} providers for {}",
            providers.len(),
            doc.workspace_id()
        );
        Ok(ProviderSet { providers })
    }
}

/// The providers assembled for one document, connected and disconnected as a
/// unit.
pub struct ProviderSet {
    providers: Vec<Box<dyn Provider>>,
}

impl ProviderSet {
    /// Providers in assembly order.
    pub fn providers(&self) -> &[Box<dyn Provider>] {
        &self.providers
    }

    /// Connect every provider. Fails on the first provider that refuses,
    /// leaving earlier ones connected; callers tear down with
    /// [`disconnect_all`](ProviderSet::disconnect_all).
    pub fn connect_all(&self) -> Result<()> {
        for provider in &self.providers {
            provider.connect()?;
        }
        Ok(())
    }

    /// Disconnect every connected provider, keeping going past failures.
    pub fn disconnect_all(&self) {
        for provider in &self.providers {
            if !provider.is_connected() {
                continue;
            }
            if let Err(e) = provider.disconnect() {
                log::warn!("[Registry] disconnect {} failed: {}", provider.flavour(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use crate::doc::Presence;
    use crate::error::SyncError;
    use crate::provider::ProviderFlavour;
    use crate::storage::MemoryStorage;
    use crate::transport::{BoxFuture, ConnectParams, RemoteConnection};
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::time::Duration;
    use yrs::{GetString, Text, Transact};

    fn test_doc(id: &str) -> Arc<DocHandle> {
        Arc::new(DocHandle::new(id, Arc::new(MemoryBlobStore::new())))
    }

    fn insert_text(doc: &DocHandle, text: &str) {
        let body = doc.doc().get_or_insert_text("body");
        let mut txn = doc.transact_local();
        let len = body.get_string(&txn).len() as u32;
        body.insert(&mut txn, len, text);
    }

    fn body_text(doc: &DocHandle) -> String {
        let body = doc.doc().get_or_insert_text("body");
        let txn = doc.doc().transact();
        body.get_string(&txn)
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met within timeout");
    }

    #[derive(Default)]
    struct RecordingTransport {
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    struct RecordingConnection {
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl RemoteConnection for RecordingConnection {
        fn send<'a>(&'a self, update: &'a [u8]) -> BoxFuture<'a, crate::error::Result<()>> {
            let sent = Arc::clone(&self.sent);
            let update = update.to_vec();
            Box::pin(async move {
                sent.lock().unwrap().push(update);
                Ok(())
            })
        }

        fn recv(&self) -> BoxFuture<'_, crate::error::Result<Option<Vec<u8>>>> {
            Box::pin(async move {
                // Keep the connection open without delivering anything.
                std::future::pending::<()>().await;
                Ok(None)
            })
        }

        fn close(&self) -> BoxFuture<'_, crate::error::Result<()>> {
            Box::pin(async move { Ok(()) })
        }
    }

    impl RemoteTransport for RecordingTransport {
        fn open<'a>(
            &'a self,
            _params: &'a ConnectParams,
        ) -> BoxFuture<'a, crate::error::Result<Box<dyn RemoteConnection>>> {
            let sent = Arc::clone(&self.sent);
            Box::pin(async move { Ok(Box::new(RecordingConnection { sent }) as Box<dyn RemoteConnection>) })
        }
    }

    #[derive(Default)]
    struct RecordingNativeService {
        applied: Mutex<Vec<Vec<u8>>>,
    }

    impl NativeService for RecordingNativeService {
        fn get_doc(&self, _id: &str) -> BoxFuture<'_, crate::error::Result<Option<Vec<u8>>>> {
            Box::pin(async move { Ok(None) })
        }

        fn apply_doc_update<'a>(
            &'a self,
            _id: &'a str,
            update: &'a [u8],
        ) -> BoxFuture<'a, crate::error::Result<()>> {
            Box::pin(async move {
                self.applied.lock().unwrap().push(update.to_vec());
                Ok(())
            })
        }

        fn get_persisted_blob_keys(
            &self,
            _id: &str,
        ) -> BoxFuture<'_, crate::error::Result<HashSet<String>>> {
            Box::pin(async move { Ok(HashSet::new()) })
        }

        fn add_blob<'a>(
            &'a self,
            _id: &'a str,
            _key: &'a str,
            _data: &'a [u8],
        ) -> BoxFuture<'a, crate::error::Result<()>> {
            Box::pin(async move { Ok(()) })
        }
    }

    fn flavours(set: &ProviderSet) -> Vec<ProviderFlavour> {
        set.providers().iter().map(|p| p.flavour()).collect()
    }

    #[test]
    fn test_default_config_assembles_broadcast_and_local() {
        let registry = ProviderRegistry::new(
            SyncConfig::default(),
            Arc::new(BroadcastHub::new()),
            Arc::new(MemoryStorage::new()),
        );
        let set = registry.assemble(&test_doc("ws-1")).unwrap();
        assert_eq!(
            flavours(&set),
            vec![ProviderFlavour::Broadcast, ProviderFlavour::LocalStore]
        );
    }

    #[test]
    fn test_broadcast_disabled_still_has_local_floor() {
        let config = SyncConfig {
            enable_broadcast: false,
            ..SyncConfig::default()
        };
        let registry = ProviderRegistry::new(
            config,
            Arc::new(BroadcastHub::new()),
            Arc::new(MemoryStorage::new()),
        );
        let set = registry.assemble(&test_doc("ws-1")).unwrap();
        assert_eq!(flavours(&set), vec![ProviderFlavour::LocalStore]);
    }

    #[test]
    fn test_remote_requires_endpoint_and_transport() {
        let (_tx, rx) = watch::channel("tok".to_string());

        // Transport without endpoint: no remote provider.
        let registry = ProviderRegistry::new(
            SyncConfig::default(),
            Arc::new(BroadcastHub::new()),
            Arc::new(MemoryStorage::new()),
        )
        .with_remote(Arc::new(RecordingTransport::default()), rx.clone());
        let set = registry.assemble(&test_doc("ws-1")).unwrap();
        assert!(!flavours(&set).contains(&ProviderFlavour::Remote));

        // Endpoint without transport: no remote provider.
        let config = SyncConfig {
            remote_endpoint: Some("wss://sync.example/api/sync".to_string()),
            ..SyncConfig::default()
        };
        let registry = ProviderRegistry::new(
            config.clone(),
            Arc::new(BroadcastHub::new()),
            Arc::new(MemoryStorage::new()),
        );
        let set = registry.assemble(&test_doc("ws-1")).unwrap();
        assert!(!flavours(&set).contains(&ProviderFlavour::Remote));

        // Both: remote provider assembled.
        let registry = ProviderRegistry::new(
            config,
            Arc::new(BroadcastHub::new()),
            Arc::new(MemoryStorage::new()),
        )
        .with_remote(Arc::new(RecordingTransport::default()), rx);
        let set = registry.assemble(&test_doc("ws-1")).unwrap();
        assert!(flavours(&set).contains(&ProviderFlavour::Remote));
    }

    #[test]
    fn test_native_requires_desktop() {
        let service = Arc::new(RecordingNativeService::default());

        let registry = ProviderRegistry::new(
            SyncConfig::default(),
            Arc::new(BroadcastHub::new()),
            Arc::new(MemoryStorage::new()),
        )
        .with_native_service(Arc::clone(&service) as Arc<dyn NativeService>);
        let set = registry.assemble(&test_doc("ws-1")).unwrap();
        assert!(!flavours(&set).contains(&ProviderFlavour::NativeStore));

        let config = SyncConfig {
            desktop: true,
            ..SyncConfig::default()
        };
        let registry = ProviderRegistry::new(
            config,
            Arc::new(BroadcastHub::new()),
            Arc::new(MemoryStorage::new()),
        )
        .with_native_service(service);
        let set = registry.assemble(&test_doc("ws-1")).unwrap();
        assert!(flavours(&set).contains(&ProviderFlavour::NativeStore));
    }

    #[tokio::test]
    async fn test_connect_all_and_double_connect() {
        let registry = ProviderRegistry::new(
            SyncConfig::default(),
            Arc::new(BroadcastHub::new()),
            Arc::new(MemoryStorage::new()),
        );
        let set = registry.assemble(&test_doc("ws-1")).unwrap();
        set.connect_all().unwrap();
        assert!(set.providers().iter().all(|p| p.is_connected()));

        let err = set.connect_all().unwrap_err();
        assert!(matches!(err, SyncError::AlreadyConnected(_)));

        set.disconnect_all();
        assert!(set.providers().iter().all(|p| !p.is_connected()));
    }

    /// A broadcast-origin update fans out to the remote service and the
    /// native store, while each backend is shielded from its own writes.
    #[tokio::test]
    async fn test_cross_backend_fan_out() {
        let hub = Arc::new(BroadcastHub::new());
        let transport = Arc::new(RecordingTransport::default());
        let service = Arc::new(RecordingNativeService::default());
        let (_token_tx, token_rx) = watch::channel("tok".to_string());

        let config = SyncConfig {
            desktop: true,
            remote_endpoint: Some("wss://sync.example/api/sync".to_string()),
            ..SyncConfig::default()
        };
        let registry = ProviderRegistry::new(
            config,
            Arc::clone(&hub),
            Arc::new(MemoryStorage::new()),
        )
        .with_remote(
            Arc::clone(&transport) as Arc<dyn RemoteTransport>,
            token_rx,
        )
        .with_native_service(Arc::clone(&service) as Arc<dyn NativeService>);

        let doc = test_doc("ws-1");
        let set = registry.assemble(&doc).unwrap();
        assert_eq!(set.providers().len(), 4);
        set.connect_all().unwrap();

        // Both remote and native push one baseline on connect.
        wait_until(|| !transport.sent.lock().unwrap().is_empty()).await;
        wait_until(|| !service.applied.lock().unwrap().is_empty()).await;
        let remote_baseline = transport.sent.lock().unwrap().len();
        let native_baseline = service.applied.lock().unwrap().len();

        // A second view of the same workspace publishes an edit on the bus.
        let peer_doc = test_doc("ws-1");
        let peer = BroadcastProvider::new(Arc::clone(&peer_doc), Arc::clone(&hub));
        peer.connect().unwrap();
        insert_text(&peer_doc, "from another view");

        wait_until(|| body_text(&doc) == "from another view").await;
        wait_until(|| transport.sent.lock().unwrap().len() > remote_baseline).await;
        wait_until(|| service.applied.lock().unwrap().len() > native_baseline).await;

        // Each backend saw the broadcast edit exactly once; nothing bounced
        // back and forth between them.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.sent.lock().unwrap().len(), remote_baseline + 1);
        assert_eq!(service.applied.lock().unwrap().len(), native_baseline + 1);

        set.disconnect_all();
    }

    #[test]
    fn test_from_config_opens_sqlite_when_db_path_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notelet.db");
        let config = SyncConfig {
            db_path: Some(path.clone()),
            ..SyncConfig::default()
        };
        let registry =
            ProviderRegistry::from_config(config, Arc::new(BroadcastHub::new())).unwrap();
        assert!(path.exists());
        let set = registry.assemble(&test_doc("ws-1")).unwrap();
        assert!(flavours(&set).contains(&ProviderFlavour::LocalStore));
    }

    #[test]
    fn test_from_config_falls_back_to_memory() {
        let registry =
            ProviderRegistry::from_config(SyncConfig::default(), Arc::new(BroadcastHub::new()))
                .unwrap();
        let set = registry.assemble(&test_doc("ws-1")).unwrap();
        assert_eq!(
            flavours(&set),
            vec![ProviderFlavour::Broadcast, ProviderFlavour::LocalStore]
        );
    }

    #[test]
    fn test_presence_travels_with_doc() {
        let doc = test_doc("ws-1");
        doc.set_presence(Presence::new(Some("alice".to_string())));
        assert_eq!(doc.presence().name.as_deref(), Some("alice"));
    }
}

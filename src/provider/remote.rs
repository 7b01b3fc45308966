//! Remote real-time sync provider.
//!
//! Keeps the document in two-way sync with the remote authority over a
//! persistent [`RemoteTransport`] connection, carrying the auth token and
//! presence. On connect, the full local state is pushed once as a baseline;
//! afterwards every non-remote update flows out and every inbound update is
//! applied with the `Remote` origin.
//!
//! The provider watches the credential signal: a token change triggers
//! exactly one disconnect followed by one reconnect with the new token. This
//! is the one lifecycle transition not driven by the registry; the provider
//! self-heals. Connection failures are not retried here; the transport owns
//! reconnection policy, and this provider only tears down and allows a
//! future `connect()`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::{Provider, ProviderFlavour};
use crate::doc::{DocHandle, OriginTag};
use crate::error::{Result, SyncError};
use crate::transport::{ConnectParams, RemoteTransport};

/// Connection settings for the remote provider.
#[derive(Debug, Clone)]
pub struct RemoteOptions {
    /// Sync service endpoint
    pub endpoint: String,

    /// Credential signal. The current value is the token to present; a new
    /// value triggers a reconnect.
    pub token: watch::Receiver<String>,
}

struct RemoteSession {
    /// Outbound forwarding; dropping it stops the flow
    _doc_sub: yrs::Subscription,
    io_task: JoinHandle<()>,
    credential_task: JoinHandle<()>,
}

struct RemoteShared {
    doc: Arc<DocHandle>,
    transport: Arc<dyn RemoteTransport>,
    options: RemoteOptions,
    session: Mutex<Option<RemoteSession>>,

    /// Connect cycle counter. The io task only tears down the session of the
    /// cycle it belongs to; disconnect and reconnect bump the epoch so a
    /// stale task cannot touch a newer session.
    epoch: AtomicU64,

    /// Last connection failure, cleared on the next connect.
    last_error: RwLock<Option<String>>,
}

/// Provider syncing with the remote authority in real time.
pub struct RemoteProvider {
    shared: Arc<RemoteShared>,
}

impl RemoteProvider {
    /// Create a provider over the given transport.
    pub fn new(
        doc: Arc<DocHandle>,
        transport: Arc<dyn RemoteTransport>,
        options: RemoteOptions,
    ) -> Self {
        Self {
            shared: Arc::new(RemoteShared {
                doc,
                transport,
                options,
                session: Mutex::new(None),
                epoch: AtomicU64::new(0),
                last_error: RwLock::new(None),
            }),
        }
    }

    /// The connection failure from the current connect cycle, if any.
    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.read().unwrap().clone()
    }
}

impl RemoteShared {
    fn connect(self: &Arc<Self>) -> Result<()> {
        let mut session = self.session.lock().unwrap();
        if session.is_some() {
            return Err(SyncError::AlreadyConnected(
                ProviderFlavour::Remote.to_string(),
            ));
        }

        let params = ConnectParams {
            endpoint: self.options.endpoint.clone(),
            workspace_id: self.doc.workspace_id().to_string(),
            auth_token: self.options.token.borrow().clone(),
            presence: self.doc.presence(),
            // The document handle deduplicates by origin; any transport-side
            // echo prevention would only hide updates from other providers.
            disable_local_echo: true,
        };
        log::info!("[Remote] connect {} -> {}", params.workspace_id, params.endpoint);
        *self.last_error.write().unwrap() = None;
        let this_epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;

        // Outbound: queue every update we did not receive from the service.
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let doc_sub = self.doc.on_update(move |update, origin| {
            if origin == Some(OriginTag::Remote) {
                return;
            }
            let _ = out_tx.send(update.to_vec());
        });

        let shared = Arc::clone(self);
        let io_task = tokio::spawn(async move {
            let conn = match shared.transport.open(&params).await {
                Ok(conn) => conn,
                Err(e) => {
                    shared.teardown(this_epoch, Some(e.to_string()));
                    return;
                }
            };

            // Baseline push; the authority merges and deduplicates.
            if let Err(e) = conn.send(&shared.doc.encode_full_state()).await {
                let _ = conn.close().await;
                shared.teardown(this_epoch, Some(e.to_string()));
                return;
            }

            loop {
                tokio::select! {
                    outbound = out_rx.recv() => match outbound {
                        Some(update) => {
                            if let Err(e) = conn.send(&update).await {
                                log::warn!("[Remote] send failed: {}", e);
                                break;
                            }
                        }
                        None => break,
                    },
                    inbound = conn.recv() => match inbound {
                        Ok(Some(bytes)) => {
                            if let Err(e) = shared.doc.apply_update(&bytes, OriginTag::Remote) {
                                log::warn!("[Remote] failed to apply update: {}", e);
                            }
                        }
                        Ok(None) => {
                            log::info!("[Remote] connection closed by service");
                            break;
                        }
                        Err(e) => {
                            log::warn!("[Remote] receive failed: {}", e);
                            break;
                        }
                    },
                }
            }
            let _ = conn.close().await;
            shared.teardown(this_epoch, None);
        });

        // Credential watcher: one rotation per connect cycle; the reconnect
        // installs a fresh watcher.
        let shared = Arc::clone(self);
        let mut token_rx = self.options.token.clone();
        let credential_task = tokio::spawn(async move {
            token_rx.borrow_and_update();
            if token_rx.changed().await.is_err() {
                return;
            }
            log::info!("[Remote] credentials changed, reconnecting");
            match shared.disconnect() {
                Ok(()) => {
                    if let Err(e) = shared.connect() {
                        log::error!("[Remote] reconnect after rotation failed: {}", e);
                    }
                }
                Err(e) => log::warn!("[Remote] rotation disconnect skipped: {}", e),
            }
        });

        *session = Some(RemoteSession {
            _doc_sub: doc_sub,
            io_task,
            credential_task,
        });
        Ok(())
    }

    fn disconnect(&self) -> Result<()> {
        let mut session = self.session.lock().unwrap();
        let Some(active) = session.take() else {
            return Err(SyncError::NotConnected(
                ProviderFlavour::Remote.to_string(),
            ));
        };
        // Invalidate the cycle so a teardown from its io task is a no-op.
        self.epoch.fetch_add(1, Ordering::SeqCst);
        log::info!("[Remote] disconnect {}", self.doc.workspace_id());
        active.io_task.abort();
        active.credential_task.abort();
        Ok(())
    }

    /// Tear down the session belonging to `this_epoch`, recording the failure
    /// that ended it. Called by the io task itself; a task from a superseded
    /// cycle finds the epoch moved on and leaves the newer session alone.
    fn teardown(&self, this_epoch: u64, error: Option<String>) {
        let mut session = self.session.lock().unwrap();
        if self.epoch.load(Ordering::SeqCst) != this_epoch {
            return;
        }
        if let Some(reason) = error {
            log::error!("[Remote] connection failed: {}", reason);
            *self.last_error.write().unwrap() = Some(reason);
        }
        if let Some(active) = session.take() {
            active.credential_task.abort();
        }
    }
}

impl Provider for RemoteProvider {
    fn flavour(&self) -> ProviderFlavour {
        ProviderFlavour::Remote
    }

    fn background(&self) -> bool {
        false
    }

    fn connect(&self) -> Result<()> {
        self.shared.connect()
    }

    fn disconnect(&self) -> Result<()> {
        self.shared.disconnect()
    }

    fn cleanup(&self) -> Result<()> {
        // Closes the connection and stops the credential watcher, so no
        // reconnect can leak after teardown.
        if self.is_connected() {
            self.disconnect()?;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared.session.lock().unwrap().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use crate::transport::{BoxFuture, RemoteConnection};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use yrs::{GetString, Text, Transact};

    fn handle(id: &str) -> Arc<DocHandle> {
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

    /// Transport recording opened connections and captured traffic.
    #[derive(Default)]
    struct FakeTransport {
        opened: Mutex<Vec<ConnectParams>>,
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
        /// Handle for pushing service-side updates to the latest connection
        inbound: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
        dropped_connections: Arc<AtomicUsize>,
        /// When set, `open` refuses the connection
        fail_opens: std::sync::atomic::AtomicBool,
    }

    impl FakeTransport {
        fn opened_tokens(&self) -> Vec<String> {
            self.opened
                .lock()
                .unwrap()
                .iter()
                .map(|p| p.auth_token.clone())
                .collect()
        }

        fn push_inbound(&self, bytes: Vec<u8>) {
            self.inbound
                .lock()
                .unwrap()
                .as_ref()
                .expect("no open connection")
                .send(bytes)
                .unwrap();
        }
    }

    struct FakeConnection {
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
        rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
        dropped: Arc<AtomicUsize>,
    }

    impl Drop for FakeConnection {
        fn drop(&mut self) {
            self.dropped.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl RemoteConnection for FakeConnection {
        fn send<'a>(&'a self, update: &'a [u8]) -> BoxFuture<'a, Result<()>> {
            Box::pin(async move {
                self.sent.lock().unwrap().push(update.to_vec());
                Ok(())
            })
        }

        fn recv(&self) -> BoxFuture<'_, Result<Option<Vec<u8>>>> {
            Box::pin(async move { Ok(self.rx.lock().await.recv().await) })
        }

        fn close(&self) -> BoxFuture<'_, Result<()>> {
            Box::pin(async move { Ok(()) })
        }
    }

    impl RemoteTransport for FakeTransport {
        fn open<'a>(
            &'a self,
            params: &'a ConnectParams,
        ) -> BoxFuture<'a, Result<Box<dyn RemoteConnection>>> {
            Box::pin(async move {
                if self.fail_opens.load(Ordering::SeqCst) {
                    return Err(SyncError::Transport("connection refused".into()));
                }
                self.opened.lock().unwrap().push(params.clone());
                let (tx, rx) = mpsc::unbounded_channel();
                *self.inbound.lock().unwrap() = Some(tx);
                Ok(Box::new(FakeConnection {
                    sent: Arc::clone(&self.sent),
                    rx: tokio::sync::Mutex::new(rx),
                    dropped: Arc::clone(&self.dropped_connections),
                }) as Box<dyn RemoteConnection>)
            })
        }
    }

    fn provider_with(
        doc: &Arc<DocHandle>,
        token: &str,
    ) -> (RemoteProvider, Arc<FakeTransport>, watch::Sender<String>) {
        let transport = Arc::new(FakeTransport::default());
        let (token_tx, token_rx) = watch::channel(token.to_string());
        let provider = RemoteProvider::new(
            Arc::clone(doc),
            Arc::clone(&transport) as Arc<dyn RemoteTransport>,
            RemoteOptions {
                endpoint: "wss://sync.example.com/api/sync".to_string(),
                token: token_rx,
            },
        );
        (provider, transport, token_tx)
    }

    #[tokio::test]
    async fn test_connect_pushes_baseline_and_forwards_edits() {
        let doc = handle("ws-1");
        insert_text(&doc, "existing");
        let (provider, transport, _token_tx) = provider_with(&doc, "tok-1");

        provider.connect().unwrap();
        wait_until(|| !transport.sent.lock().unwrap().is_empty()).await;
        assert_eq!(transport.sent.lock().unwrap().len(), 1); // baseline

        insert_text(&doc, " and new");
        wait_until(|| transport.sent.lock().unwrap().len() == 2).await;

        let params = transport.opened.lock().unwrap();
        assert_eq!(params.len(), 1);
        assert_eq!(params[0].workspace_id, "ws-1");
        assert!(params[0].disable_local_echo);
    }

    #[tokio::test]
    async fn test_inbound_updates_apply_with_remote_origin_and_no_echo() {
        let doc = handle("ws-1");
        let (provider, transport, _token_tx) = provider_with(&doc, "tok-1");
        provider.connect().unwrap();
        wait_until(|| transport.sent.lock().unwrap().len() == 1).await;

        let peer = handle("ws-1");
        insert_text(&peer, "from the service");
        transport.push_inbound(peer.encode_full_state());

        wait_until(|| body_text(&doc) == "from the service").await;
        // The inbound update must not be sent back to the service.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(transport.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_credential_rotation_reconnects_once() {
        let doc = handle("ws-1");
        let (provider, transport, token_tx) = provider_with(&doc, "tok-1");

        provider.connect().unwrap();
        wait_until(|| transport.opened.lock().unwrap().len() == 1).await;

        token_tx.send("tok-2".to_string()).unwrap();
        wait_until(|| transport.opened.lock().unwrap().len() == 2).await;

        // Exactly one disconnect and one reconnect with the new token.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.opened_tokens(), vec!["tok-1", "tok-2"]);
        assert_eq!(transport.dropped_connections.load(Ordering::SeqCst), 1);
        assert!(provider.is_connected());
    }

    #[tokio::test]
    async fn test_cleanup_stops_credential_watcher() {
        let doc = handle("ws-1");
        let (provider, transport, token_tx) = provider_with(&doc, "tok-1");

        provider.connect().unwrap();
        wait_until(|| transport.opened.lock().unwrap().len() == 1).await;
        provider.cleanup().unwrap();

        // A rotation after teardown must not leak a reconnect.
        token_tx.send("tok-2".to_string()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.opened.lock().unwrap().len(), 1);
        assert!(!provider.is_connected());
    }

    #[tokio::test]
    async fn test_failed_open_tears_down_and_surfaces_error() {
        let doc = handle("ws-1");
        let (provider, transport, token_tx) = provider_with(&doc, "tok-1");
        transport.fail_opens.store(true, Ordering::SeqCst);

        provider.connect().unwrap();
        wait_until(|| !provider.is_connected()).await;
        assert!(provider.last_error().unwrap().contains("connection refused"));

        // The dead cycle's credential watcher is gone; a rotation must not
        // resurrect the connection.
        token_tx.send("tok-2".to_string()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(transport.opened.lock().unwrap().is_empty());
        assert!(!provider.is_connected());

        // A later connect against a healthy transport starts clean.
        transport.fail_opens.store(false, Ordering::SeqCst);
        provider.connect().unwrap();
        wait_until(|| transport.opened.lock().unwrap().len() == 1).await;
        assert!(provider.is_connected());
        assert!(provider.last_error().is_none());
    }

    #[tokio::test]
    async fn test_lifecycle_preconditions() {
        let doc = handle("ws-1");
        let (provider, _transport, _token_tx) = provider_with(&doc, "tok-1");

        assert!(matches!(
            provider.disconnect(),
            Err(SyncError::NotConnected(_))
        ));
        provider.connect().unwrap();
        assert!(matches!(
            provider.connect(),
            Err(SyncError::AlreadyConnected(_))
        ));
        provider.disconnect().unwrap();
        provider.connect().unwrap();
        provider.disconnect().unwrap();
    }
}

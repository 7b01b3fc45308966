//! Cross-view broadcast provider.
//!
//! Propagates updates between open views of the same document on the same
//! device without a server round-trip. Views share a [`BroadcastHub`], a
//! per-process pub/sub bus keyed by workspace id; the hub is owned by the
//! registry and passed in explicitly so provider lifecycles stay testable in
//! isolation.
//!
//! Delivery guarantees are the channel's own: order of publication, possible
//! duplicates under lag. Both are safe because CRDT apply is idempotent and
//! convergent.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{Provider, ProviderFlavour};
use crate::doc::{DocHandle, OriginTag};
use crate::error::{Result, SyncError};

/// Channel capacity per workspace. Slow views drop old messages (lag) rather
/// than stalling publishers; a lagged view resynchronizes from the store.
const CHANNEL_CAPACITY: usize = 256;

/// One update published on the local bus.
#[derive(Debug, Clone)]
pub struct BroadcastMessage {
    /// Publishing provider instance, so a provider can skip its own messages
    source: Uuid,
    /// Binary yrs update
    update: Vec<u8>,
}

/// Per-process pub/sub bus, one channel per workspace id.
#[derive(Debug, Default)]
pub struct BroadcastHub {
    channels: RwLock<HashMap<String, broadcast::Sender<BroadcastMessage>>>,
}

impl BroadcastHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the channel for a workspace.
    fn channel(&self, workspace_id: &str) -> broadcast::Sender<BroadcastMessage> {
        if let Some(tx) = self.channels.read().unwrap().get(workspace_id) {
            return tx.clone();
        }
        let mut channels = self.channels.write().unwrap();
        channels
            .entry(workspace_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

struct BroadcastSession {
    /// Outbound document subscription; dropping it stops forwarding
    _doc_sub: yrs::Subscription,
    /// Inbound receive loop
    recv_task: JoinHandle<()>,
}

/// Provider that mirrors updates across views via the [`BroadcastHub`].
pub struct BroadcastProvider {
    doc: Arc<DocHandle>,
    hub: Arc<BroadcastHub>,
    /// Identity of this provider instance on the bus
    source: Uuid,
    session: Mutex<Option<BroadcastSession>>,
}

impl BroadcastProvider {
    /// Create a provider for one document view.
    pub fn new(doc: Arc<DocHandle>, hub: Arc<BroadcastHub>) -> Self {
        Self {
            doc,
            hub,
            source: Uuid::new_v4(),
            session: Mutex::new(None),
        }
    }
}

impl Provider for BroadcastProvider {
    fn flavour(&self) -> ProviderFlavour {
        ProviderFlavour::Broadcast
    }

    fn background(&self) -> bool {
        false
    }

    fn connect(&self) -> Result<()> {
        let mut session = self.session.lock().unwrap();
        if session.is_some() {
            return Err(SyncError::AlreadyConnected(self.flavour().to_string()));
        }

        let workspace_id = self.doc.workspace_id().to_string();
        log::info!("[Broadcast] connect {}", workspace_id);

        let tx = self.hub.channel(&workspace_id);
        let mut rx = tx.subscribe();

        // Inbound: apply every message published by other views.
        let doc = Arc::clone(&self.doc);
        let source = self.source;
        let recv_task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(msg) if msg.source == source => {
                        // Our own publication; the document already has it.
                    }
                    Ok(msg) => {
                        if let Err(e) = doc.apply_update(&msg.update, OriginTag::Broadcast) {
                            log::warn!("[Broadcast] failed to apply update: {}", e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("[Broadcast] lagged, skipped {} messages", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        // Outbound: publish every update we did not receive from the bus.
        let source = self.source;
        let doc_sub = self.doc.on_update(move |update, origin| {
            if origin == Some(OriginTag::Broadcast) {
                return;
            }
            // Send fails only when no other view is listening; that is fine.
            let _ = tx.send(BroadcastMessage {
                source,
                update: update.to_vec(),
            });
        });

        *session = Some(BroadcastSession {
            _doc_sub: doc_sub,
            recv_task,
        });
        Ok(())
    }

    fn disconnect(&self) -> Result<()> {
        let mut session = self.session.lock().unwrap();
        let Some(active) = session.take() else {
            return Err(SyncError::NotConnected(self.flavour().to_string()));
        };
        log::info!("[Broadcast] disconnect {}", self.doc.workspace_id());
        active.recv_task.abort();
        Ok(())
    }

    fn cleanup(&self) -> Result<()> {
        if self.is_connected() {
            self.disconnect()?;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.session.lock().unwrap().is_some()
    }
}

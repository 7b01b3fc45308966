//! Shared workspace document handle.
//!
//! [`DocHandle`] wraps a yrs [`Doc`] for one workspace document together with
//! its blob store and the local presence value. All update traffic between
//! providers flows through the handle:
//!
//! - a provider applies inbound bytes with [`DocHandle::apply_update`],
//!   tagged with its own [`OriginTag`];
//! - every provider subscribes with [`DocHandle::on_update`] and receives the
//!   update bytes plus the tag of whichever party produced them.
//!
//! Echo suppression falls out of the tags: a provider forwards every update
//! whose origin is not its own, so an update received from provider X is
//! rebroadcast to all providers except X. Because the underlying state is a
//! CRDT, applying the same updates in any order converges, and the handle
//! never assumes delivery order.

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use yrs::updates::decoder::Decode;
use yrs::{Doc, Origin, ReadTxn, StateVector, Transact, TransactionMut, Update};

use crate::blob::BlobStore;
use crate::error::{Result, SyncError};

/// Origin of a document update, used to distinguish which provider (or the
/// local editor) produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OriginTag {
    /// Update originated from a local user action
    Local,

    /// Update received over the cross-view broadcast channel
    Broadcast,

    /// Update replayed from the durable local store during catch-up
    LocalStore,

    /// Update received from the remote sync service
    Remote,

    /// Update pulled from the native out-of-process store.
    /// Private to the native provider; never echoed back to the service.
    NativeStore,
}

impl OriginTag {
    /// Stable string form, used as the yrs transaction origin.
    pub fn as_str(&self) -> &'static str {
        match self {
            OriginTag::Local => "local",
            OriginTag::Broadcast => "broadcast",
            OriginTag::LocalStore => "local-store",
            OriginTag::Remote => "remote",
            OriginTag::NativeStore => "native-store",
        }
    }

    /// Recover a tag from a yrs transaction origin.
    ///
    /// Returns `None` for transactions without an origin (plain local
    /// transactions) or with an origin this crate did not set.
    pub fn from_origin(origin: &Origin) -> Option<Self> {
        std::str::from_utf8(origin.as_ref())
            .ok()
            .and_then(|s| s.parse().ok())
    }
}

impl From<OriginTag> for Origin {
    fn from(tag: OriginTag) -> Self {
        Origin::from(tag.as_str())
    }
}

impl std::fmt::Display for OriginTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OriginTag {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "local" => Ok(OriginTag::Local),
            "broadcast" => Ok(OriginTag::Broadcast),
            "local-store" => Ok(OriginTag::LocalStore),
            "remote" => Ok(OriginTag::Remote),
            "native-store" => Ok(OriginTag::NativeStore),
            _ => Err(format!("Unknown origin tag: {}", s)),
        }
    }
}

/// Ephemeral per-connection presence metadata.
///
/// Carried to the remote service at connect time so other participants see
/// who is online and where their cursor is. Never persisted; discarded at
/// disconnect.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Presence {
    /// Stable id for this peer/device within the session
    pub peer_id: String,

    /// Display name shown to other participants
    pub name: Option<String>,

    /// Opaque cursor/selection payload owned by the editor layer
    pub cursor: Option<serde_json::Value>,
}

impl Presence {
    /// Create a presence value with a fresh random peer id.
    pub fn new(name: Option<String>) -> Self {
        Self {
            peer_id: uuid::Uuid::new_v4().to_string(),
            name,
            cursor: None,
        }
    }
}

/// Handle for one shared workspace document.
pub struct DocHandle {
    /// Stable workspace/document id
    workspace_id: String,

    /// The underlying yrs document
    doc: Doc,

    /// Content-addressed binary attachments
    blobs: Arc<dyn BlobStore>,

    /// Presence advertised by this instance when a provider connects
    presence: RwLock<Presence>,
}

impl DocHandle {
    /// Create a handle for a freshly opened workspace document.
    pub fn new(workspace_id: impl Into<String>, blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            doc: Doc::new(),
            blobs,
            presence: RwLock::new(Presence::new(None)),
        }
    }

    /// The stable workspace/document id.
    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    /// The underlying yrs document.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    /// The blob store attached to this document.
    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    /// Snapshot of the local presence value.
    pub fn presence(&self) -> Presence {
        self.presence.read().unwrap().clone()
    }

    /// Replace the local presence value (e.g., on cursor movement).
    pub fn set_presence(&self, presence: Presence) {
        *self.presence.write().unwrap() = presence;
    }

    /// Apply an inbound update, tagged with the applying provider's origin.
    ///
    /// Applying the same update twice is harmless (CRDT apply is idempotent),
    /// so providers may tolerate duplicate delivery.
    pub fn apply_update(&self, bytes: &[u8], origin: OriginTag) -> Result<()> {
        let update = Update::decode_v1(bytes)
            .map_err(|e| SyncError::Decode(format!("malformed update: {}", e)))?;
        let mut txn = self.doc.transact_mut_with(origin);
        txn.apply_update(update)
            .map_err(|e| SyncError::Decode(format!("failed to apply update: {}", e)))?;
        Ok(())
    }

    /// Open a write transaction tagged as a local edit.
    ///
    /// Local mutations are applied synchronously here before any provider
    /// observes them, so every provider sees a consistent, monotonically
    /// growing update log.
    pub fn transact_local(&self) -> TransactionMut<'_> {
        self.doc.transact_mut_with(OriginTag::Local)
    }

    /// Subscribe to document updates.
    ///
    /// The callback receives the binary update and the origin tag of the
    /// transaction that produced it (`None` for untagged transactions).
    /// Dropping the returned subscription unsubscribes.
    ///
    /// # Panics
    ///
    /// Panics if unable to acquire a transaction for observing.
    pub fn on_update<F>(&self, callback: F) -> yrs::Subscription
    where
        F: Fn(&[u8], Option<OriginTag>) + Send + Sync + 'static,
    {
        self.doc
            .observe_update_v1(move |txn, event| {
                let tag = txn.origin().and_then(OriginTag::from_origin);
                callback(&event.update, tag);
            })
            .expect("Failed to observe document updates")
    }

    /// Encode the full document state as a single update.
    pub fn encode_full_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Encode the current state vector (for sync handshakes).
    pub fn state_vector(&self) -> StateVector {
        let txn = self.doc.transact();
        txn.state_vector()
    }
}

impl std::fmt::Debug for DocHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocHandle")
            .field("workspace_id", &self.workspace_id)
            .finish()
    }
}

//! Provider lifecycle interface.
//!
//! A provider keeps the shared document consistent with one backend: the
//! cross-view broadcast channel, the durable local store, the remote sync
//! service, or the native out-of-process store on desktop. All providers
//! share one lifecycle contract; the registry connects and disconnects them
//! uniformly.

mod broadcast;
mod local;
mod native;
mod remote;

pub use broadcast::{BroadcastHub, BroadcastProvider};
pub use local::LocalStoreProvider;
pub use native::{NativeService, NativeStoreProvider};
pub use remote::{RemoteOptions, RemoteProvider};

use serde::{Deserialize, Serialize};

use crate::doc::OriginTag;
use crate::error::Result;

/// Identifies which backend a provider speaks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderFlavour {
    /// Cross-view pub/sub on the same device
    Broadcast,

    /// Durable on-device update log
    LocalStore,

    /// Remote real-time sync service
    Remote,

    /// Native out-of-process store (desktop only)
    NativeStore,
}

impl ProviderFlavour {
    /// The origin tag this provider stamps on its inbound writes.
    pub fn origin(&self) -> OriginTag {
        match self {
            ProviderFlavour::Broadcast => OriginTag::Broadcast,
            ProviderFlavour::LocalStore => OriginTag::LocalStore,
            ProviderFlavour::Remote => OriginTag::Remote,
            ProviderFlavour::NativeStore => OriginTag::NativeStore,
        }
    }

    /// Stable string form, used in logs and errors.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderFlavour::Broadcast => "broadcast",
            ProviderFlavour::LocalStore => "local-store",
            ProviderFlavour::Remote => "remote",
            ProviderFlavour::NativeStore => "native-store",
        }
    }
}

impl std::fmt::Display for ProviderFlavour {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Uniform lifecycle for every sync backend.
///
/// # Contract
///
/// - [`connect`](Provider::connect) never blocks the caller; long-running
///   setup continues on spawned tasks and readiness is surfaced through the
///   provider's own signal. Connecting while already connected is a
///   precondition error; connecting again after a disconnect must work.
/// - [`disconnect`](Provider::disconnect) fails loudly when not connected.
///   It releases the channel/session but keeps in-memory structures so the
///   provider can reconnect.
/// - [`cleanup`](Provider::cleanup) releases resources permanently.
///   Providers that cannot support in-place cleanup return
///   [`SyncError::Unsupported`](crate::error::SyncError::Unsupported).
/// - Every inbound write is tagged with the provider's own origin so the
///   document handle can suppress echo.
pub trait Provider: Send + Sync {
    /// Which backend this provider speaks to.
    fn flavour(&self) -> ProviderFlavour;

    /// Whether this provider keeps syncing while the document is not being
    /// actively viewed.
    fn background(&self) -> bool;

    /// Establish the backend channel/session.
    fn connect(&self) -> Result<()>;

    /// Release the channel/session, keeping in-memory state for reconnect.
    fn disconnect(&self) -> Result<()>;

    /// Permanently release all resources.
    fn cleanup(&self) -> Result<()>;

    /// Whether the provider currently holds a connection.
    fn is_connected(&self) -> bool;
}

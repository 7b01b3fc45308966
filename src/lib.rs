#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

/// Configuration options
pub mod config;

/// Content-addressed blob storage
pub mod blob;

/// Readiness callback gate
pub mod callback;

/// Shared document handle and transaction origins
pub mod doc;

/// Snapshot download pipeline
pub mod download;

/// Switch-latest retrying effect
pub mod effect;

/// Error (common error types)
pub mod error;

/// Provider lifecycle and backend implementations
pub mod provider;

/// Provider assembly from configuration
pub mod registry;

/// Durable update storage (SQLite or in-memory)
pub mod storage;

/// Remote transport abstraction
pub mod transport;

pub use blob::{BlobStore, MemoryBlobStore, blob_key};
pub use callback::CallbackSet;
pub use config::SyncConfig;
pub use doc::{DocHandle, OriginTag, Presence};
pub use error::{Result, SerializableError, SyncError};
pub use provider::{
    BroadcastHub, BroadcastProvider, LocalStoreProvider, NativeService, NativeStoreProvider,
    Provider, ProviderFlavour, RemoteOptions, RemoteProvider,
};
pub use registry::{ProviderRegistry, ProviderSet};
pub use transport::{BoxFuture, ConnectParams, RemoteConnection, RemoteTransport};

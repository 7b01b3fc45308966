//! Configuration for the sync layer.
//!
//! [`SyncConfig`] carries the runtime capabilities and feature flags that
//! decide which providers the registry assembles for a workspace. Capabilities
//! are injected here at construction time; providers never probe the runtime
//! themselves.
//!
//! Configuration is persisted as TOML by the host application:
//!
//! ```toml
//! enable_broadcast = true
//! desktop = false
//! remote_endpoint = "wss://sync.notelet.app/api/sync"
//! db_path = "notelet.db"
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::Result;

/// Runtime capabilities and feature flags consumed by the provider registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Enable the cross-view broadcast provider.
    #[serde(default = "default_true")]
    pub enable_broadcast: bool,

    /// Whether the host runtime is a desktop shell with access to the native
    /// out-of-process store. The native provider is only constructed when
    /// this is set.
    #[serde(default)]
    pub desktop: bool,

    /// Remote sync endpoint (e.g., "wss://sync.notelet.app/api/sync").
    /// When unset, no remote provider is assembled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_endpoint: Option<String>,

    /// Path to the local SQLite update-log database. Consulted by
    /// [`ProviderRegistry::from_config`](crate::registry::ProviderRegistry::from_config);
    /// when unset, the local store provider runs on in-memory storage.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_path: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enable_broadcast: true,
            desktop: false,
            remote_endpoint: None,
            db_path: None,
        }
    }
}

impl SyncConfig {
    /// Parse a config from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Serialize the config to a TOML string.
    pub fn to_toml_string(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }
}

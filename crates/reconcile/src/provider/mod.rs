//! Provider protocol: the engine's only window onto remote objects.
//!
//! A provider handles opaque CRUD calls; everything it learns about an
//! object comes back as a [`RemoteObject`] (external identity plus the full
//! attribute set, including computed attributes). The engine never assumes
//! anything about how the store works, only how its errors classify.

mod http;
mod memory;

pub use http::HttpProvider;
pub use memory::MemoryProvider;

use crate::error::ProviderError;
use crate::manifest::ProviderConfig;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Credentials resolved from the environment and user config, passed
/// explicitly into provider construction.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub token: Option<String>,
}

impl Session {
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
        }
    }
}

/// A remote object as the provider reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteObject {
    /// Provider-assigned external identity
    pub id: String,
    /// Full attribute set, computed attributes included
    pub attrs: BTreeMap<String, Value>,
}

/// Blocking CRUD against one remote store. Implementations must be safe to
/// call from multiple executor workers at once.
pub trait Provider: Send + Sync {
    fn create(
        &self,
        kind: &str,
        attrs: &BTreeMap<String, Value>,
    ) -> Result<RemoteObject, ProviderError>;

    fn read(&self, kind: &str, id: &str) -> Result<RemoteObject, ProviderError>;

    fn update(
        &self,
        kind: &str,
        id: &str,
        attrs: &BTreeMap<String, Value>,
    ) -> Result<RemoteObject, ProviderError>;

    fn delete(&self, kind: &str, id: &str) -> Result<(), ProviderError>;
}

/// Construct the provider selected by the manifest's `[provider]` block.
pub fn build(config: &ProviderConfig, session: &Session) -> Arc<dyn Provider> {
    match config {
        ProviderConfig::Memory => Arc::new(MemoryProvider::new()),
        ProviderConfig::Http { endpoint, .. } => {
            Arc::new(HttpProvider::new(endpoint, session.token.clone()))
        }
    }
}

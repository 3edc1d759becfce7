//! Coordination store abstraction.
//!
//! The discovery components only need a handful of primitives from the store:
//! key/value put and delete, prefix reads, prefix watches and TTL leases with
//! keepalive. Backends implement [`CoordinationStore`]; a [`StoreConnector`] dials a
//! fresh client so every component owns (and eventually closes) its own connection.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tracing::Instrument;

use crate::config::{StoreBackend, StoreConfig};
use crate::error::{DiscoveryError, StoreError};
use crate::model::{LeaseId, Snapshot, WatchEvent};

pub mod memory;

#[cfg(feature = "etcd")]
pub mod etcd;

pub use memory::{InMemoryConnector, InMemoryStore};

/// Ordered batches of watch events. The stream ends (or yields an error) when the
/// store drops the watch.
pub type WatchStream = BoxStream<'static, Result<Vec<WatchEvent>, StoreError>>;

/// Client-side handle to one coordination store connection.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Create a lease that expires after `ttl_secs` without renewal.
    async fn grant(&self, ttl_secs: i64) -> Result<LeaseId, StoreError>;

    /// Open a renewal channel for `lease`.
    async fn keep_alive(&self, lease: LeaseId) -> Result<Box<dyn LeaseRenewer>, StoreError>;

    /// Write `key = value`, optionally bound to a lease.
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<(), StoreError>;

    /// Read every key under `prefix`, sorted by key.
    async fn get_prefix(&self, prefix: &str) -> Result<Snapshot, StoreError>;

    /// Watch `prefix`, starting at `start_revision` when given.
    async fn watch(&self, prefix: &str, start_revision: Option<i64>)
    -> Result<WatchStream, StoreError>;

    /// Delete `key`, returning how many keys were removed. A missing key is not an error.
    async fn delete(&self, key: &str) -> Result<u64, StoreError>;

    /// Revoke `lease`, deleting every key attached to it.
    async fn revoke(&self, lease: LeaseId) -> Result<(), StoreError>;

    /// Release the connection. Further calls fail with [`StoreError::Closed`].
    async fn close(&self);
}

/// Renewal side of a lease keepalive.
#[async_trait]
pub trait LeaseRenewer: Send {
    /// Send one renewal and wait for the acknowledgement.
    ///
    /// Returns the TTL the store granted. An expired or revoked lease yields
    /// [`StoreError::LeaseNotFound`].
    async fn renew(&mut self) -> Result<i64, StoreError>;
}

/// Dials new store clients.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self, config: &StoreConfig) -> Result<Arc<dyn CoordinationStore>, StoreError>;
}

/// Dial a store client, mapping failures to [`DiscoveryError::StoreUnreachable`].
pub(crate) async fn dial(
    connector: &dyn StoreConnector,
    config: &StoreConfig,
) -> Result<Arc<dyn CoordinationStore>, DiscoveryError> {
    let span = tracing::debug_span!("store_connect", backend = ?config.backend);
    connector
        .connect(config)
        .instrument(span)
        .await
        .map_err(|e| DiscoveryError::unreachable("connect", e))
}

/// Pick the connector matching `config.backend`.
///
/// The in-memory backend has no shared server to dial from here, so it gets a fresh,
/// private store; use [`InMemoryStore::connector`] to share one between components.
///
/// # Errors
/// Returns `DiscoveryError::InvalidConfig` if the requested backend was not compiled in.
pub fn connector_for(config: &StoreConfig) -> Result<Arc<dyn StoreConnector>, DiscoveryError> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(InMemoryStore::new().connector())),
        #[cfg(feature = "etcd")]
        StoreBackend::Etcd => Ok(Arc::new(etcd::EtcdConnector)),
        #[cfg(not(feature = "etcd"))]
        StoreBackend::Etcd => Err(DiscoveryError::InvalidConfig(
            "etcd backend requested but the `etcd` feature is not enabled".to_owned(),
        )),
    }
}

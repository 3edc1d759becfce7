//! etcd v3 backend built on `etcd-client`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use etcd_client::{
    Client, ConnectOptions, Event, EventType, GetOptions, LeaseKeepAliveStream, LeaseKeeper,
    PutOptions, WatchOptions,
};
use futures::StreamExt;

use super::{CoordinationStore, LeaseRenewer, StoreConnector, WatchStream};
use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::model::{KeyValue, LeaseId, Snapshot, WatchEvent};

fn map_err(e: etcd_client::Error) -> StoreError {
    match e {
        etcd_client::Error::TransportError(t) => StoreError::Unreachable(t.to_string()),
        etcd_client::Error::GRpcStatus(status) => {
            let msg = status.message().to_owned();
            if msg.contains("lease not found") {
                StoreError::Backend(msg)
            } else {
                StoreError::Unreachable(format!("{status}"))
            }
        }
        etcd_client::Error::WatchError(msg) => StoreError::WatchClosed(msg),
        etcd_client::Error::LeaseKeepAliveError(msg) => StoreError::Unreachable(msg),
        other => StoreError::Backend(other.to_string()),
    }
}

fn map_lease_err(e: etcd_client::Error, lease: LeaseId) -> StoreError {
    match map_err(e) {
        StoreError::Backend(msg) if msg.contains("lease not found") => {
            StoreError::LeaseNotFound(lease.0)
        }
        other => other,
    }
}

/// Dials etcd using the endpoints and timeouts from [`StoreConfig`].
#[derive(Debug, Clone, Copy, Default)]
pub struct EtcdConnector;

#[async_trait]
impl StoreConnector for EtcdConnector {
    async fn connect(&self, config: &StoreConfig) -> Result<Arc<dyn CoordinationStore>, StoreError> {
        let mut options = ConnectOptions::new()
            .with_connect_timeout(config.dial_timeout)
            .with_timeout(config.request_timeout);
        if let Some(user) = &config.username {
            let password = config
                .password
                .as_ref()
                .map(|p| p.expose().to_owned())
                .unwrap_or_default();
            options = options.with_user(user.clone(), password);
        }

        let client = tokio::time::timeout(
            config.dial_timeout,
            Client::connect(&config.endpoints, Some(options)),
        )
        .await
        .map_err(|_| {
            StoreError::Unreachable(format!(
                "dial to {:?} timed out after {:?}",
                config.endpoints, config.dial_timeout
            ))
        })?
        .map_err(map_err)?;

        tracing::debug!(endpoints = ?config.endpoints, "connected to etcd");
        Ok(Arc::new(EtcdStore {
            client,
            closed: AtomicBool::new(false),
        }))
    }
}

/// One etcd client connection.
pub struct EtcdStore {
    client: Client,
    closed: AtomicBool,
}

impl EtcdStore {
    fn client(&self) -> Result<Client, StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        // Clones share the underlying channel.
        Ok(self.client.clone())
    }
}

/// Decode raw key (and value) bytes, logging and skipping anything that is not UTF-8.
fn decode_kv(key: &[u8], value: Option<&[u8]>) -> Option<KeyValue> {
    let Ok(key) = std::str::from_utf8(key) else {
        tracing::warn!(raw_key = ?key, "skipping etcd key that is not valid UTF-8");
        return None;
    };
    let value = match value.map(std::str::from_utf8) {
        None => "",
        Some(Ok(value)) => value,
        Some(Err(_)) => {
            tracing::warn!(key, "skipping etcd value that is not valid UTF-8");
            return None;
        }
    };
    Some(KeyValue {
        key: key.to_owned(),
        value: value.to_owned(),
    })
}

fn convert_event(event: &Event) -> Option<WatchEvent> {
    let kv = event.kv()?;
    match event.event_type() {
        EventType::Put => {
            let KeyValue { key, value } = decode_kv(kv.key(), Some(kv.value()))?;
            Some(WatchEvent::Put { key, value })
        }
        EventType::Delete => decode_kv(kv.key(), None).map(|kv| WatchEvent::Delete { key: kv.key }),
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn grant(&self, ttl_secs: i64) -> Result<LeaseId, StoreError> {
        let resp = self
            .client()?
            .lease_grant(ttl_secs, None)
            .await
            .map_err(map_err)?;
        Ok(LeaseId(resp.id()))
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<Box<dyn LeaseRenewer>, StoreError> {
        let (keeper, stream) = self
            .client()?
            .lease_keep_alive(lease.0)
            .await
            .map_err(|e| map_lease_err(e, lease))?;
        Ok(Box::new(EtcdRenewer {
            keeper,
            stream,
            lease,
        }))
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<(), StoreError> {
        let options = lease.map(|id| PutOptions::new().with_lease(id.0));
        self.client()?
            .put(key, value, options)
            .await
            .map_err(|e| match lease {
                Some(id) => map_lease_err(e, id),
                None => map_err(e),
            })?;
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Snapshot, StoreError> {
        let resp = self
            .client()?
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(map_err)?;
        let revision = resp.header().map_or(0, |h| h.revision());
        let kvs = resp
            .kvs()
            .iter()
            .filter_map(|kv| decode_kv(kv.key(), Some(kv.value())))
            .collect();
        Ok(Snapshot { revision, kvs })
    }

    async fn watch(
        &self,
        prefix: &str,
        start_revision: Option<i64>,
    ) -> Result<WatchStream, StoreError> {
        let mut options = WatchOptions::new().with_prefix();
        if let Some(rev) = start_revision {
            options = options.with_start_revision(rev);
        }
        let (watcher, stream) = self
            .client()?
            .watch(prefix, Some(options))
            .await
            .map_err(map_err)?;

        // The watcher handle must outlive the stream or etcd cancels the watch.
        let events = futures::stream::unfold(Some((watcher, stream)), |state| async move {
            let (watcher, mut stream) = state?;
            loop {
                match stream.message().await {
                    Ok(Some(resp)) => {
                        if resp.canceled() {
                            let reason = format!(
                                "watch canceled by server (compact revision {})",
                                resp.compact_revision()
                            );
                            return Some((Err(StoreError::WatchClosed(reason)), None));
                        }
                        let batch: Vec<WatchEvent> =
                            resp.events().iter().filter_map(convert_event).collect();
                        if batch.is_empty() {
                            continue;
                        }
                        return Some((Ok(batch), Some((watcher, stream))));
                    }
                    Ok(None) => return None,
                    Err(e) => return Some((Err(map_err(e)), None)),
                }
            }
        });
        Ok(events.boxed())
    }

    async fn delete(&self, key: &str) -> Result<u64, StoreError> {
        let resp = self.client()?.delete(key, None).await.map_err(map_err)?;
        Ok(u64::try_from(resp.deleted()).unwrap_or(0))
    }

    async fn revoke(&self, lease: LeaseId) -> Result<(), StoreError> {
        self.client()?
            .lease_revoke(lease.0)
            .await
            .map_err(|e| map_lease_err(e, lease))?;
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

struct EtcdRenewer {
    keeper: LeaseKeeper,
    stream: LeaseKeepAliveStream,
    lease: LeaseId,
}

#[async_trait]
impl LeaseRenewer for EtcdRenewer {
    async fn renew(&mut self) -> Result<i64, StoreError> {
        self.keeper
            .keep_alive()
            .await
            .map_err(|e| map_lease_err(e, self.lease))?;
        match self.stream.message().await.map_err(|e| map_lease_err(e, self.lease))? {
            Some(resp) if resp.ttl() > 0 => Ok(resp.ttl()),
            Some(_) => Err(StoreError::LeaseNotFound(self.lease.0)),
            None => Err(StoreError::Unreachable(
                "keepalive stream closed by server".to_owned(),
            )),
        }
    }
}

//! In-process coordination store.
//!
//! Behaves like a single-node etcd for the subset of operations discovery uses:
//! every mutation bumps a global revision, leases expire lazily once their TTL has
//! elapsed without renewal, and prefix watches can replay history from a start
//! revision. It also exposes fault injection hooks so outages can be simulated
//! without a network.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{CoordinationStore, LeaseRenewer, StoreConnector, WatchStream};
use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::model::{KeyValue, LeaseId, Snapshot, WatchEvent};

type WatchSender = mpsc::UnboundedSender<Result<Vec<WatchEvent>, StoreError>>;

struct Entry {
    value: String,
    lease: Option<LeaseId>,
}

struct LeaseEntry {
    ttl_secs: i64,
    deadline: Instant,
    keys: BTreeSet<String>,
}

struct WatcherEntry {
    client: u64,
    prefix: String,
    tx: WatchSender,
}

struct State {
    reachable: bool,
    revision: i64,
    kv: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, LeaseEntry>,
    next_lease: i64,
    history: Vec<(i64, WatchEvent)>,
    watchers: Vec<WatcherEntry>,
    next_client: u64,
    connects: u64,
}

fn ttl_duration(ttl_secs: i64) -> Duration {
    Duration::from_secs(ttl_secs.unsigned_abs())
}

impl State {
    fn new() -> Self {
        Self {
            reachable: true,
            revision: 1,
            kv: BTreeMap::new(),
            leases: HashMap::new(),
            next_lease: 0x1000,
            history: Vec::new(),
            watchers: Vec::new(),
            next_client: 1,
            connects: 0,
        }
    }

    fn ensure_reachable(&self) -> Result<(), StoreError> {
        if self.reachable {
            Ok(())
        } else {
            Err(StoreError::Unreachable("in-memory store is offline".to_owned()))
        }
    }

    fn expire_due(&mut self, now: Instant) {
        let due: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, l)| l.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in due {
            tracing::debug!(lease_id = %id, "in-memory lease expired");
            self.revoke_lease(id);
        }
    }

    fn revoke_lease(&mut self, id: LeaseId) -> bool {
        let Some(lease) = self.leases.remove(&id) else {
            return false;
        };
        let mut events = Vec::new();
        for key in lease.keys {
            if self.kv.get(&key).is_some_and(|e| e.lease == Some(id)) {
                self.kv.remove(&key);
                events.push(self.record(WatchEvent::Delete { key }));
            }
        }
        self.notify(&events);
        true
    }

    fn record(&mut self, event: WatchEvent) -> (i64, WatchEvent) {
        self.revision += 1;
        self.history.push((self.revision, event.clone()));
        (self.revision, event)
    }

    fn apply(&mut self, event: WatchEvent, lease: Option<LeaseId>) -> Option<(i64, WatchEvent)> {
        match &event {
            WatchEvent::Put { key, value } => {
                let old = self.kv.insert(
                    key.clone(),
                    Entry {
                        value: value.clone(),
                        lease,
                    },
                );
                if let Some(prev) = old.and_then(|e| e.lease).filter(|p| Some(*p) != lease) {
                    if let Some(l) = self.leases.get_mut(&prev) {
                        l.keys.remove(key);
                    }
                }
                if let Some(l) = lease.and_then(|id| self.leases.get_mut(&id)) {
                    l.keys.insert(key.clone());
                }
            }
            WatchEvent::Delete { key } => {
                let entry = self.kv.remove(key)?;
                if let Some(l) = entry.lease.and_then(|id| self.leases.get_mut(&id)) {
                    l.keys.remove(key);
                }
            }
        }
        Some(self.record(event))
    }

    fn notify(&mut self, events: &[(i64, WatchEvent)]) {
        if events.is_empty() {
            return;
        }
        self.watchers.retain(|w| {
            let batch: Vec<WatchEvent> = events
                .iter()
                .filter(|(_, e)| e.key().starts_with(&w.prefix))
                .map(|(_, e)| e.clone())
                .collect();
            batch.is_empty() || w.tx.send(Ok(batch)).is_ok()
        });
    }

    fn drop_watchers(&mut self, reason: &StoreError) {
        for w in self.watchers.drain(..) {
            let _ = w.tx.send(Err(reason.clone()));
        }
    }
}

struct Inner {
    state: Mutex<State>,
}

/// Shared in-process store. Cloning yields another handle to the same data.
#[derive(Clone)]
pub struct InMemoryStore {
    inner: Arc<Inner>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("InMemoryStore")
            .field("reachable", &state.reachable)
            .field("revision", &state.revision)
            .field("keys", &state.kv.len())
            .field("leases", &state.leases.len())
            .field("watchers", &state.watchers.len())
            .finish()
    }
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::new()),
            }),
        }
    }

    /// Connector whose clients all talk to this store.
    #[must_use]
    pub fn connector(&self) -> InMemoryConnector {
        InMemoryConnector {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Simulate an outage (`false`) or recovery (`true`).
    ///
    /// Going offline fails every open watch and makes all calls, including new
    /// connections, fail with [`StoreError::Unreachable`]. Leases keep ticking.
    pub fn set_reachable(&self, reachable: bool) {
        let mut state = self.inner.state.lock();
        state.reachable = reachable;
        if !reachable {
            let reason = StoreError::Unreachable("in-memory store went offline".to_owned());
            state.drop_watchers(&reason);
        }
        tracing::debug!(reachable, "in-memory store reachability changed");
    }

    /// Terminate every open watch while staying reachable.
    pub fn close_watches(&self) {
        self.inner
            .state
            .lock()
            .drop_watchers(&StoreError::WatchClosed("closed by store".to_owned()));
    }

    /// Expire a lease immediately, deleting its keys. Returns whether it existed.
    pub fn expire_lease(&self, lease: LeaseId) -> bool {
        self.inner.state.lock().revoke_lease(lease)
    }

    /// Expire every lease, as after a store restart that lost lease state.
    pub fn expire_all_leases(&self) {
        let mut state = self.inner.state.lock();
        let ids: Vec<LeaseId> = state.leases.keys().copied().collect();
        for id in ids {
            state.revoke_lease(id);
        }
    }

    /// Write a key without a lease, bypassing reachability, as another writer would.
    pub fn put(&self, key: impl Into<String>, value: impl Into<String>) {
        self.apply_batch(vec![WatchEvent::Put {
            key: key.into(),
            value: value.into(),
        }]);
    }

    /// Delete a key, bypassing reachability.
    pub fn delete(&self, key: &str) -> bool {
        let mut state = self.inner.state.lock();
        match state.apply(WatchEvent::Delete { key: key.to_owned() }, None) {
            Some(ev) => {
                state.notify(&[ev]);
                true
            }
            None => false,
        }
    }

    /// Apply several mutations atomically and deliver them to watchers as one batch.
    pub fn apply_batch(&self, events: Vec<WatchEvent>) {
        let mut state = self.inner.state.lock();
        let applied: Vec<(i64, WatchEvent)> = events
            .into_iter()
            .filter_map(|e| state.apply(e, None))
            .collect();
        state.notify(&applied);
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        let mut state = self.inner.state.lock();
        state.expire_due(Instant::now());
        state.kv.get(key).map(|e| e.value.clone())
    }

    #[must_use]
    pub fn lease_of(&self, key: &str) -> Option<LeaseId> {
        self.inner.state.lock().kv.get(key).and_then(|e| e.lease)
    }

    #[must_use]
    pub fn lease_count(&self) -> usize {
        self.inner.state.lock().leases.len()
    }

    #[must_use]
    pub fn watcher_count(&self) -> usize {
        self.inner.state.lock().watchers.len()
    }

    /// Number of successful client connections so far.
    #[must_use]
    pub fn connect_count(&self) -> u64 {
        self.inner.state.lock().connects
    }

    #[must_use]
    pub fn revision(&self) -> i64 {
        self.inner.state.lock().revision
    }
}

/// Dials [`InMemoryClient`]s onto a shared [`InMemoryStore`].
#[derive(Clone)]
pub struct InMemoryConnector {
    inner: Arc<Inner>,
}

#[async_trait]
impl StoreConnector for InMemoryConnector {
    async fn connect(&self, _config: &StoreConfig) -> Result<Arc<dyn CoordinationStore>, StoreError> {
        let mut state = self.inner.state.lock();
        state.ensure_reachable()?;
        state.connects += 1;
        let id = state.next_client;
        state.next_client += 1;
        Ok(Arc::new(InMemoryClient {
            inner: Arc::clone(&self.inner),
            id,
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

/// One client connection to an [`InMemoryStore`].
pub struct InMemoryClient {
    inner: Arc<Inner>,
    id: u64,
    closed: Arc<AtomicBool>,
}

impl InMemoryClient {
    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> Result<T, StoreError>) -> Result<T, StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        let mut state = self.inner.state.lock();
        state.ensure_reachable()?;
        state.expire_due(Instant::now());
        f(&mut state)
    }
}

#[async_trait]
impl CoordinationStore for InMemoryClient {
    async fn grant(&self, ttl_secs: i64) -> Result<LeaseId, StoreError> {
        if ttl_secs <= 0 {
            return Err(StoreError::Backend(format!("invalid ttl {ttl_secs}")));
        }
        self.with_state(|state| {
            let id = LeaseId(state.next_lease);
            state.next_lease += 1;
            state.leases.insert(
                id,
                LeaseEntry {
                    ttl_secs,
                    deadline: Instant::now() + ttl_duration(ttl_secs),
                    keys: BTreeSet::new(),
                },
            );
            Ok(id)
        })
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<Box<dyn LeaseRenewer>, StoreError> {
        self.with_state(|state| {
            if state.leases.contains_key(&lease) {
                Ok(())
            } else {
                Err(StoreError::LeaseNotFound(lease.0))
            }
        })?;
        Ok(Box::new(InMemoryRenewer {
            inner: Arc::clone(&self.inner),
            closed: Arc::clone(&self.closed),
            lease,
        }))
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<(), StoreError> {
        self.with_state(|state| {
            if let Some(id) = lease {
                if !state.leases.contains_key(&id) {
                    return Err(StoreError::LeaseNotFound(id.0));
                }
            }
            let event = WatchEvent::Put {
                key: key.to_owned(),
                value: value.to_owned(),
            };
            if let Some(ev) = state.apply(event, lease) {
                state.notify(&[ev]);
            }
            Ok(())
        })
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Snapshot, StoreError> {
        self.with_state(|state| {
            let kvs = state
                .kv
                .range(prefix.to_owned()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, e)| KeyValue {
                    key: k.clone(),
                    value: e.value.clone(),
                })
                .collect();
            Ok(Snapshot {
                revision: state.revision,
                kvs,
            })
        })
    }

    async fn watch(
        &self,
        prefix: &str,
        start_revision: Option<i64>,
    ) -> Result<WatchStream, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.with_state(|state| {
            if let Some(start) = start_revision {
                let replay: Vec<WatchEvent> = state
                    .history
                    .iter()
                    .filter(|(rev, e)| *rev >= start && e.key().starts_with(prefix))
                    .map(|(_, e)| e.clone())
                    .collect();
                if !replay.is_empty() {
                    let _ = tx.send(Ok(replay));
                }
            }
            state.watchers.push(WatcherEntry {
                client: self.id,
                prefix: prefix.to_owned(),
                tx,
            });
            Ok(())
        })?;
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn delete(&self, key: &str) -> Result<u64, StoreError> {
        self.with_state(|state| {
            match state.apply(WatchEvent::Delete { key: key.to_owned() }, None) {
                Some(ev) => {
                    state.notify(&[ev]);
                    Ok(1)
                }
                None => Ok(0),
            }
        })
    }

    async fn revoke(&self, lease: LeaseId) -> Result<(), StoreError> {
        self.with_state(|state| {
            if state.revoke_lease(lease) {
                Ok(())
            } else {
                Err(StoreError::LeaseNotFound(lease.0))
            }
        })
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut state = self.inner.state.lock();
        state.watchers.retain(|w| w.client != self.id);
    }
}

struct InMemoryRenewer {
    inner: Arc<Inner>,
    closed: Arc<AtomicBool>,
    lease: LeaseId,
}

#[async_trait]
impl LeaseRenewer for InMemoryRenewer {
    async fn renew(&mut self) -> Result<i64, StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        let mut state = self.inner.state.lock();
        state.ensure_reachable()?;
        let now = Instant::now();
        state.expire_due(now);
        let lease = state
            .leases
            .get_mut(&self.lease)
            .ok_or(StoreError::LeaseNotFound(self.lease.0))?;
        lease.deadline = now + ttl_duration(lease.ttl_secs);
        Ok(lease.ttl_secs)
    }
}

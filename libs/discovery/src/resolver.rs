//! Watch-driven address resolution.
//!
//! A [`Resolver`] reads the service prefix once, publishes the initial address list
//! synchronously, then follows the prefix watch from the snapshot revision onward in a
//! background task. If the watch fails (or the optional liveness probe does), the task
//! rebuilds its client, re-reads the prefix and reconciles against the list it already
//! has. The published list is never emptied because of an outage.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::StreamExt;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::address_list::{AddressList, AddressPublisher, AddressTracker, AddressUpdater};
use crate::config::{ReconnectPolicy, ResolverConfig, StoreConfig};
use crate::error::{DiscoveryError, StoreError};
use crate::model::{SCHEME, ServiceKey, Snapshot, WatchEvent};
use crate::store::{self, CoordinationStore, StoreConnector, WatchStream};
use crate::supervisor::ReconnectSupervisor;

/// Why the watch phase ended.
enum WatchExit {
    Cancelled,
    Resync,
    Lost(DiscoveryError),
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Await a store call for at most `limit`. Expiry counts as the store being unreachable.
async fn within<T>(
    op: &'static str,
    limit: Duration,
    call: impl Future<Output = Result<T, StoreError>>,
) -> Result<T, DiscoveryError> {
    match tokio::time::timeout(limit, call).await {
        Ok(res) => res.map_err(|e| DiscoveryError::unreachable(op, e)),
        Err(_) => Err(DiscoveryError::unreachable(
            op,
            StoreError::Unreachable(format!("no response within {limit:?}")),
        )),
    }
}

/// Dial a client and take a prefix snapshot with it.
async fn connect_and_read(
    connector: &dyn StoreConnector,
    config: &StoreConfig,
    prefix: &str,
) -> Result<(Arc<dyn CoordinationStore>, Snapshot), DiscoveryError> {
    let client = store::dial(connector, config).await?;
    match within("get", config.request_timeout, client.get_prefix(prefix)).await {
        Ok(snapshot) => Ok((client, snapshot)),
        Err(e) => {
            client.close().await;
            Err(e)
        }
    }
}

fn log_rejected(rejected: &[DiscoveryError]) {
    for e in rejected {
        tracing::warn!(error = %e, "skipping undecodable key in snapshot");
    }
}

/// Single writer of the address list.
struct WatchLoop {
    connector: Arc<dyn StoreConnector>,
    store: StoreConfig,
    prefix: String,
    tracker: AddressTracker,
    publisher: AddressPublisher,
    health_check: Option<Duration>,
    resync: Arc<Notify>,
    cancel: CancellationToken,
}

impl WatchLoop {
    /// Run one store call bounded by `request_timeout`. `None` means the loop was
    /// cancelled while the call was in flight.
    async fn bounded<T>(
        &self,
        op: &'static str,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Option<Result<T, DiscoveryError>> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => None,
            res = within(op, self.store.request_timeout, call) => Some(res),
        }
    }

    fn publish_if(&self, changed: bool) {
        if changed {
            let list = self.publisher.publish(&self.tracker);
            tracing::debug!(
                version = list.version(),
                addresses = ?list.to_strings(),
                "address list updated"
            );
        }
    }

    /// Apply one batch in order and publish at most once for it.
    fn apply_batch(&mut self, batch: &[WatchEvent]) {
        let before = self.tracker.addresses().to_vec();
        for event in batch {
            if let Err(e) = self.tracker.apply(event) {
                tracing::warn!(key = event.key(), error = %e, "skipping undecodable watch event");
            }
        }
        let changed = self.tracker.addresses() != before.as_slice();
        self.publish_if(changed);
    }

    fn reconcile(&mut self, snapshot: &Snapshot) {
        let (fresh, rejected) = AddressTracker::from_snapshot(&snapshot.kvs);
        log_rejected(&rejected);
        let changed = self.tracker.reconcile(fresh);
        self.publish_if(changed);
    }

    /// Consume `stream` until it fails, a resync is requested or the loop is cancelled.
    async fn follow(&mut self, client: &dyn CoordinationStore, mut stream: WatchStream) -> WatchExit {
        let mut probe = self.health_check.map(|period| {
            let mut t = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            t.set_missed_tick_behavior(MissedTickBehavior::Delay);
            t
        });

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return WatchExit::Cancelled,
                () = self.resync.notified() => return WatchExit::Resync,
                next = stream.next() => match next {
                    Some(Ok(batch)) => self.apply_batch(&batch),
                    Some(Err(e)) => return WatchExit::Lost(DiscoveryError::WatchStreamClosed(e.to_string())),
                    None => {
                        return WatchExit::Lost(DiscoveryError::WatchStreamClosed(
                            "stream ended".to_owned(),
                        ));
                    }
                },
                () = tick(&mut probe) => {
                    match self.bounded("health_check", client.get_prefix(&self.prefix)).await {
                        None => return WatchExit::Cancelled,
                        Some(Ok(_)) => tracing::trace!("store liveness probe ok"),
                        Some(Err(e)) => return WatchExit::Lost(e),
                    }
                }
            }
        }
    }

    async fn run(
        mut self,
        mut client: Arc<dyn CoordinationStore>,
        mut revision: i64,
        policy: ReconnectPolicy,
    ) {
        let mut supervisor = ReconnectSupervisor::new("resolver", policy, self.cancel.clone());

        loop {
            let opened = self
                .bounded("watch", client.watch(&self.prefix, Some(revision + 1)))
                .await;
            let exit = match opened {
                None => WatchExit::Cancelled,
                Some(Ok(stream)) => self.follow(client.as_ref(), stream).await,
                Some(Err(e)) => WatchExit::Lost(e),
            };

            let reason = match exit {
                WatchExit::Cancelled => break,
                WatchExit::Resync => {
                    let read = self.bounded("get", client.get_prefix(&self.prefix)).await;
                    match read {
                        None => break,
                        Some(Ok(snapshot)) => {
                            tracing::debug!(revision = snapshot.revision, "resynced on request");
                            self.reconcile(&snapshot);
                            revision = snapshot.revision;
                            continue;
                        }
                        Some(Err(e)) => e,
                    }
                }
                WatchExit::Lost(reason) => reason,
            };

            tracing::warn!(error = %reason, "watch lost, reconnecting");
            client.close().await;

            let Some((fresh, snapshot)) = supervisor
                .retry("watch", || {
                    connect_and_read(self.connector.as_ref(), &self.store, &self.prefix)
                })
                .await
            else {
                return;
            };

            tracing::info!(revision = snapshot.revision, "watch re-established");
            client = fresh;
            self.reconcile(&snapshot);
            revision = snapshot.revision;
        }

        client.close().await;
    }
}

/// Keeps the address list of one service up to date.
///
/// Dropping a `Resolver` stops its background task.
pub struct Resolver {
    service: ServiceKey,
    current: Arc<ArcSwap<AddressList>>,
    resync: Arc<Notify>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
    span: tracing::Span,
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("service", &self.service.name())
            .field("addresses", &self.current.load().to_strings())
            .finish_non_exhaustive()
    }
}

impl Resolver {
    /// Resolve using a default `resolver` span.
    ///
    /// # Errors
    /// See [`Resolver::resolve_with_span`].
    pub async fn resolve(
        connector: Arc<dyn StoreConnector>,
        config: ResolverConfig,
        updater: Arc<dyn AddressUpdater>,
    ) -> Result<Self, DiscoveryError> {
        let span = tracing::info_span!("resolver", service = %config.service);
        Self::resolve_with_span(connector, config, updater, span).await
    }

    /// Read the current instances, hand them to `updater` and start watching.
    ///
    /// `updater` has been called with the initial list by the time this returns.
    ///
    /// # Errors
    /// - `DiscoveryError::InvalidConfig` for bad settings
    /// - `DiscoveryError::StoreUnreachable` if the store cannot be dialled or read
    pub async fn resolve_with_span(
        connector: Arc<dyn StoreConnector>,
        config: ResolverConfig,
        updater: Arc<dyn AddressUpdater>,
        span: tracing::Span,
    ) -> Result<Self, DiscoveryError> {
        let service = config.validated()?;
        let prefix = service.prefix();

        let (client, snapshot) = connect_and_read(connector.as_ref(), &config.store, &prefix)
            .instrument(span.clone())
            .await?;

        let (tracker, rejected) = AddressTracker::from_snapshot(&snapshot.kvs);
        let publisher = AddressPublisher::new(updater);
        let current = publisher.shared();
        let initial = span.in_scope(|| {
            log_rejected(&rejected);
            publisher.publish(&tracker)
        });
        span.in_scope(|| {
            tracing::info!(
                revision = snapshot.revision,
                addresses = ?initial.to_strings(),
                "initial address list published"
            );
        });

        let resync = Arc::new(Notify::new());
        let cancel = CancellationToken::new();
        let watch_loop = WatchLoop {
            connector,
            store: config.store,
            prefix,
            tracker,
            publisher,
            health_check: config.health_check_interval,
            resync: Arc::clone(&resync),
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(
            watch_loop
                .run(client, snapshot.revision, config.reconnect)
                .instrument(span.clone()),
        );

        Ok(Self {
            service,
            current,
            resync,
            cancel,
            worker: Mutex::new(Some(handle)),
            span,
        })
    }

    #[must_use]
    pub fn service(&self) -> &ServiceKey {
        &self.service
    }

    /// Latest published list. Never blocks the watch task.
    #[must_use]
    pub fn addresses(&self) -> Arc<AddressList> {
        self.current.load_full()
    }

    /// URI scheme resolvers of this kind are registered under.
    #[must_use]
    pub fn scheme(&self) -> &'static str {
        SCHEME
    }

    /// Dial target for this service, e.g. `svc:///helloworld.Greeter`.
    #[must_use]
    pub fn target(&self) -> String {
        self.service.target()
    }

    /// Ask the background task to re-read the prefix and reconcile right away.
    pub fn resolve_now(&self) {
        self.resync.notify_one();
    }

    /// Stop watching and release the store client. Safe to call more than once.
    pub async fn close(&self) {
        let Some(handle) = self.worker.lock().await.take() else {
            return;
        };
        self.cancel.cancel();
        if let Err(e) = handle.await {
            self.span
                .in_scope(|| tracing::warn!(error = %e, "watch task ended abnormally"));
        }
        self.span.in_scope(|| tracing::info!("resolver closed"));
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

//! Lease-backed self-registration.
//!
//! A [`Registrar`] writes `"<service>/<host>:<port>" = "<host>:<port>"` under a TTL
//! lease and renews that lease from a background task. When a renewal fails (store
//! unreachable, lease expired or revoked, renewal hung) the task drops the client,
//! switches to [`RegistrarState::Recovering`] and re-creates the whole session
//! (connect, grant, put) through a [`ReconnectSupervisor`] until it succeeds or the
//! registrar is deregistered.
//!
//! ```text
//! Unregistered -> Registering -> Active <-> Recovering
//!                       any state -> Deregistered
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::{ReconnectPolicy, RegistrarConfig, StoreConfig};
use crate::error::{DiscoveryError, StoreError};
use crate::model::{InstanceAddress, Lease, LeaseId, Registration, ServiceKey};
use crate::store::{self, CoordinationStore, StoreConnector};
use crate::supervisor::ReconnectSupervisor;

/// Lifecycle of a registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegistrarState {
    Unregistered,
    Registering,
    Active,
    Recovering,
    Deregistered,
}

/// State plus the lease currently backing the registration, if any.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegistrarStatus {
    pub state: RegistrarState,
    pub lease: Option<Lease>,
}

impl RegistrarStatus {
    const fn new(state: RegistrarState, lease: Option<Lease>) -> Self {
        Self { state, lease }
    }
}

/// Live store connection holding the registration.
struct Session {
    client: Arc<dyn CoordinationStore>,
    lease: Lease,
}

/// Everything the background task needs to rebuild a session.
#[derive(Clone)]
struct SessionSpec {
    connector: Arc<dyn StoreConnector>,
    store: StoreConfig,
    registration: Registration,
    ttl_secs: i64,
}

impl SessionSpec {
    async fn establish(&self) -> Result<Session, DiscoveryError> {
        let client = store::dial(self.connector.as_ref(), &self.store).await?;
        match self.grant_and_put(client.as_ref()).await {
            Ok(lease) => Ok(Session { client, lease }),
            Err(e) => {
                client.close().await;
                Err(e)
            }
        }
    }

    async fn grant_and_put(&self, client: &dyn CoordinationStore) -> Result<Lease, DiscoveryError> {
        let id = client.grant(self.ttl_secs).await.map_err(|e| {
            if e.is_transient() {
                DiscoveryError::unreachable("grant", e)
            } else {
                DiscoveryError::LeaseGrantFailed(e)
            }
        })?;

        let value = self.registration.value.to_string();
        if let Err(e) = client.put(&self.registration.key, &value, Some(id)).await {
            // Leave nothing behind: the lease would otherwise linger until its TTL.
            if let Err(revoke_err) = client.revoke(id).await {
                tracing::debug!(lease_id = %id, error = %revoke_err, "revoke after failed put");
            }
            return Err(DiscoveryError::unreachable("put", e));
        }

        Ok(Lease {
            id,
            ttl_secs: self.ttl_secs,
        })
    }
}

fn keepalive_error(lease: LeaseId, e: StoreError) -> DiscoveryError {
    match e {
        StoreError::LeaseNotFound(_) => DiscoveryError::LeaseExpired(lease.0),
        other => DiscoveryError::unreachable("keepalive", other),
    }
}

fn renewal_timeout(interval: Duration) -> DiscoveryError {
    DiscoveryError::unreachable(
        "keepalive",
        StoreError::Unreachable(format!("renewal not acknowledged within {interval:?}")),
    )
}

/// Renew `session`'s lease every `interval` until something goes wrong.
///
/// Every round-trip is bounded by `interval` so a hung store cannot hold the lease past
/// its TTL unnoticed. Returns the reason the lease can no longer be trusted.
async fn hold_lease(session: &Session, interval: Duration) -> DiscoveryError {
    let lease = session.lease.id;
    let mut renewer = match tokio::time::timeout(interval, session.client.keep_alive(lease)).await {
        Ok(Ok(renewer)) => renewer,
        Ok(Err(e)) => return keepalive_error(lease, e),
        Err(_) => return renewal_timeout(interval),
    };

    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match tokio::time::timeout(interval, renewer.renew()).await {
            Ok(Ok(ttl)) => tracing::trace!(lease_id = %lease, ttl, "lease renewed"),
            Ok(Err(e)) => return keepalive_error(lease, e),
            Err(_) => return renewal_timeout(interval),
        }
    }
}

/// Background keepalive loop. Returns the live session (if any) once cancelled so
/// `deregister` can clean up through it.
async fn run_keepalive(
    spec: SessionSpec,
    mut session: Session,
    interval: Duration,
    policy: ReconnectPolicy,
    status: Arc<watch::Sender<RegistrarStatus>>,
    cancel: CancellationToken,
) -> Option<Session> {
    let mut supervisor = ReconnectSupervisor::new("registrar", policy, cancel.clone());

    loop {
        let reason = tokio::select! {
            biased;
            () = cancel.cancelled() => return Some(session),
            reason = hold_lease(&session, interval) => reason,
        };

        tracing::warn!(
            lease_id = %session.lease.id,
            error = %reason,
            "registration lost, recovering"
        );
        status.send_replace(RegistrarStatus::new(RegistrarState::Recovering, None));
        session.client.close().await;

        session = supervisor.retry("register", || spec.establish()).await?;

        tracing::info!(lease_id = %session.lease.id, key = %spec.registration.key, "registration restored");
        status.send_replace(RegistrarStatus::new(RegistrarState::Active, Some(session.lease)));
    }
}

/// Delete the registration and release `client`.
async fn remove(
    client: &dyn CoordinationStore,
    key: &str,
    lease: Option<LeaseId>,
) -> Result<(), DiscoveryError> {
    let deleted = client
        .delete(key)
        .await
        .map_err(|e| DiscoveryError::unreachable("delete", e));
    if let Ok(n) = &deleted {
        tracing::debug!(key, deleted = n, "registration key removed");
    }

    if let Some(id) = lease {
        if let Err(e) = client.revoke(id).await {
            tracing::debug!(lease_id = %id, error = %e, "lease revoke failed");
        }
    }

    client.close().await;
    deleted.map(|_| ())
}

/// Advertises one instance address and keeps it alive until deregistered.
///
/// Dropping a `Registrar` without calling [`Registrar::deregister`] stops the keepalive
/// loop; the key then disappears once its lease expires.
pub struct Registrar {
    registration: Registration,
    service: ServiceKey,
    spec: SessionSpec,
    status: Arc<watch::Sender<RegistrarStatus>>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<Option<Session>>>>,
    span: tracing::Span,
}

impl std::fmt::Debug for Registrar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registrar")
            .field("key", &self.registration.key)
            .field("status", &*self.status.borrow())
            .finish_non_exhaustive()
    }
}

impl Registrar {
    /// Register using a default `registrar` span.
    ///
    /// # Errors
    /// See [`Registrar::register_with_span`].
    pub async fn register(
        connector: Arc<dyn StoreConnector>,
        config: RegistrarConfig,
    ) -> Result<Self, DiscoveryError> {
        let span = tracing::info_span!(
            "registrar",
            service = %config.service,
            addr = %format_args!("{}:{}", config.host, config.port)
        );
        Self::register_with_span(connector, config, span).await
    }

    /// Connect, grant a lease, write the registration key and start the keepalive task.
    ///
    /// Returns once the key is in the store. All logging of this registrar, including
    /// the background task, happens inside `span`.
    ///
    /// # Errors
    /// - `DiscoveryError::InvalidConfig` / `InvalidAddress` for bad settings
    /// - `DiscoveryError::StoreUnreachable` if connect, grant or put fails
    /// - `DiscoveryError::LeaseGrantFailed` if the store rejects the lease
    ///
    /// No lease or key is left behind on failure.
    pub async fn register_with_span(
        connector: Arc<dyn StoreConnector>,
        config: RegistrarConfig,
        span: tracing::Span,
    ) -> Result<Self, DiscoveryError> {
        let validated = config.validated()?;
        let registration = Registration::new(&validated.service, validated.address);
        let spec = SessionSpec {
            connector,
            store: config.store,
            registration: registration.clone(),
            ttl_secs: validated.ttl_secs,
        };

        let (tx, _) = watch::channel(RegistrarStatus::new(RegistrarState::Unregistered, None));
        let status = Arc::new(tx);
        status.send_replace(RegistrarStatus::new(RegistrarState::Registering, None));

        let session = spec.establish().instrument(span.clone()).await?;
        let lease = session.lease;
        span.in_scope(|| {
            tracing::info!(
                key = %registration.key,
                lease_id = %lease.id,
                ttl_secs = lease.ttl_secs,
                keepalive_ms = u64::try_from(validated.keepalive_interval.as_millis()).unwrap_or(u64::MAX),
                "instance registered"
            );
        });
        status.send_replace(RegistrarStatus::new(RegistrarState::Active, Some(lease)));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(
            run_keepalive(
                spec.clone(),
                session,
                validated.keepalive_interval,
                config.reconnect,
                Arc::clone(&status),
                cancel.clone(),
            )
            .instrument(span.clone()),
        );

        Ok(Self {
            registration,
            service: validated.service,
            spec,
            status,
            cancel,
            worker: Mutex::new(Some(handle)),
            span,
        })
    }

    #[must_use]
    pub fn service(&self) -> &ServiceKey {
        &self.service
    }

    /// Store key holding the registration.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.registration.key
    }

    #[must_use]
    pub fn address(&self) -> &InstanceAddress {
        &self.registration.value
    }

    #[must_use]
    pub fn state(&self) -> RegistrarState {
        self.status.borrow().state
    }

    /// Lease currently backing the key. `None` while recovering or after deregistration.
    #[must_use]
    pub fn lease(&self) -> Option<Lease> {
        self.status.borrow().lease
    }

    /// Receiver that observes every status change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<RegistrarStatus> {
        self.status.subscribe()
    }

    /// Wait until the registrar reaches `state` and return the matching status.
    pub async fn wait_for(&self, state: RegistrarState) -> RegistrarStatus {
        let mut rx = self.status.subscribe();
        let reached = rx.wait_for(|s| s.state == state).await.map(|s| *s);
        reached.unwrap_or_else(|_| *rx.borrow())
    }

    /// Stop renewing, delete the key, revoke the lease and close the store client.
    ///
    /// A key that is already gone counts as success. Only the first call does any work;
    /// later calls return `Ok(())` straight away.
    ///
    /// # Errors
    /// Returns `DiscoveryError::StoreUnreachable` if the key could not be deleted. The
    /// registrar is still marked deregistered and the key will expire with its lease.
    pub async fn deregister(&self) -> Result<(), DiscoveryError> {
        let mut worker = self.worker.lock().await;
        let Some(handle) = worker.take() else {
            return Ok(());
        };

        self.cancel.cancel();
        let session = match handle.await {
            Ok(session) => session,
            Err(e) => {
                self.span
                    .in_scope(|| tracing::warn!(error = %e, "keepalive task ended abnormally"));
                None
            }
        };

        let key = self.registration.key.as_str();
        let result = async {
            match session {
                Some(session) => remove(session.client.as_ref(), key, Some(session.lease.id)).await,
                None => {
                    // Mid-recovery: no live client, dial one just to delete the key.
                    let client = store::dial(self.spec.connector.as_ref(), &self.spec.store).await?;
                    remove(client.as_ref(), key, None).await
                }
            }
        }
        .instrument(self.span.clone())
        .await;

        self.status
            .send_replace(RegistrarStatus::new(RegistrarState::Deregistered, None));
        self.span.in_scope(|| match &result {
            Ok(()) => tracing::info!(key, "instance deregistered"),
            Err(e) => tracing::warn!(key, error = %e, "deregistration incomplete, key will expire with its lease"),
        });
        result
    }
}

impl Drop for Registrar {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

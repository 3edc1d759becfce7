#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

//! Client-side service discovery over a lease/watch coordination store.
//!
//! - [`Registrar`] advertises `"<service>/<host>:<port>"` under a TTL lease and keeps
//!   it alive, recovering from store outages on its own.
//! - [`Resolver`] turns a prefix snapshot plus the prefix watch into an
//!   [`AddressList`] pushed to an [`AddressUpdater`] (typically a load balancer).
//!
//! Both own their store client and background task. Construction fails only if the
//! store cannot be reached up front; later failures are retried through a
//! [`ReconnectSupervisor`] and show up in the logs.

pub mod address_list;
pub mod config;
pub mod error;
pub mod model;
pub mod registrar;
pub mod resolver;
pub mod store;
pub mod supervisor;

pub use address_list::{AddressList, AddressTracker, AddressUpdater};
pub use config::{
    DEFAULT_TTL_SECS, ReconnectPolicy, RegistrarConfig, ResolverConfig, StoreBackend,
    StoreConfig, StorePassword,
};
pub use error::{DiscoveryError, StoreError};
pub use model::{InstanceAddress, Lease, LeaseId, Registration, SCHEME, ServiceKey, WatchEvent};
pub use registrar::{Registrar, RegistrarState, RegistrarStatus};
pub use resolver::Resolver;
pub use store::{CoordinationStore, InMemoryStore, StoreConnector, connector_for};
pub use supervisor::ReconnectSupervisor;

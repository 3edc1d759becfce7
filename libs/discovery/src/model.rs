//! Discovery data model: service keys, instance addresses, leases and watch events.
//!
//! Key layout in the coordination store:
//!
//! ```text
//! <service>/<host>:<port>  ->  <host>:<port>
//! ```
//!
//! The prefix `<service>/` is used for both the snapshot read and the watch.

use std::fmt;
use std::str::FromStr;

use crate::error::DiscoveryError;

/// Scheme under which resolvers are addressed by channel builders.
pub const SCHEME: &str = "svc";

/// Separator between the service prefix and the per-instance suffix.
pub const KEY_SEPARATOR: char = '/';

/// Validated service name and the store prefix derived from it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ServiceKey {
    name: String,
}

impl ServiceKey {
    /// # Errors
    /// Returns `DiscoveryError::InvalidConfig` if the name is empty or contains whitespace
    /// or the key separator. A name with a separator would share its prefix with
    /// another service.
    pub fn new(name: impl Into<String>) -> Result<Self, DiscoveryError> {
        let name = name.into();
        if name.is_empty() {
            return Err(DiscoveryError::InvalidConfig(
                "service name must not be empty".to_owned(),
            ));
        }
        if name.chars().any(char::is_whitespace) {
            return Err(DiscoveryError::InvalidConfig(format!(
                "service name '{name}' must not contain whitespace"
            )));
        }
        if name.contains(KEY_SEPARATOR) {
            return Err(DiscoveryError::InvalidConfig(format!(
                "service name '{name}' must not contain '{KEY_SEPARATOR}'"
            )));
        }
        Ok(Self { name })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Prefix shared by every instance key of this service.
    #[must_use]
    pub fn prefix(&self) -> String {
        format!("{}{KEY_SEPARATOR}", self.name)
    }

    /// Store key under which `addr` is registered.
    #[must_use]
    pub fn key_for(&self, addr: &InstanceAddress) -> String {
        format!("{}{KEY_SEPARATOR}{addr}", self.name)
    }

    /// Dial target understood by channel builders, e.g. `svc:///helloworld.Greeter`.
    #[must_use]
    pub fn target(&self) -> String {
        format!("{SCHEME}:///{}", self.name)
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Network address of one service instance, serialized as `host:port`.
///
/// IPv6 hosts are bracketed (`[::1]:8080`) so the port stays unambiguous.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct InstanceAddress {
    host: String,
    port: u16,
}

impl InstanceAddress {
    /// # Errors
    /// Returns `DiscoveryError::InvalidAddress` if the host is empty or contains the key separator.
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, DiscoveryError> {
        let host = host.into();
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .map_or(host.clone(), str::to_owned);
        if host.is_empty() || host.contains(KEY_SEPARATOR) || host.chars().any(char::is_whitespace)
        {
            return Err(DiscoveryError::InvalidAddress(format!("{host}:{port}")));
        }
        Ok(Self { host, port })
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for InstanceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for InstanceAddress {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DiscoveryError::InvalidAddress(s.to_owned());
        let (host, port) = s.rsplit_once(':').ok_or_else(invalid)?;
        // An unbracketed host with colons is an IPv6 literal missing its brackets.
        if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
            return Err(invalid());
        }
        let port: u16 = port.parse().map_err(|_| invalid())?;
        Self::new(host, port).map_err(|_| invalid())
    }
}

/// Derive the instance address from the suffix of a store key.
///
/// # Errors
/// Returns `DiscoveryError::KeyDecode` if the key has no separator or the suffix
/// is not a valid `host:port`.
pub fn instance_from_key(key: &str) -> Result<InstanceAddress, DiscoveryError> {
    let idx = key
        .rfind(KEY_SEPARATOR)
        .ok_or_else(|| DiscoveryError::KeyDecode(key.to_owned()))?;
    key[idx + 1..]
        .parse()
        .map_err(|_| DiscoveryError::KeyDecode(key.to_owned()))
}

/// Store-assigned lease identifier. Opaque to callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LeaseId(pub i64);

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// Time-bounded lease held by one registrar.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Lease {
    pub id: LeaseId,
    pub ttl_secs: i64,
}

/// The key/value pair a registrar keeps alive.
///
/// The lease it is bound to changes on every recovery, so it is tracked in
/// [`RegistrarStatus::lease`](crate::registrar::RegistrarStatus) rather than here.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Registration {
    pub key: String,
    pub value: InstanceAddress,
}

impl Registration {
    #[must_use]
    pub fn new(service: &ServiceKey, value: InstanceAddress) -> Self {
        Self {
            key: service.key_for(&value),
            value,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

/// Result of a prefix read, tagged with the store revision it was taken at.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub revision: i64,
    pub kvs: Vec<KeyValue>,
}

/// A single change delivered by a prefix watch, in store order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchEvent {
    Put { key: String, value: String },
    Delete { key: String },
}

impl WatchEvent {
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Put { key, .. } | Self::Delete { key } => key,
        }
    }
}

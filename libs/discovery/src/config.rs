//! Configuration for store connections, registrars and resolvers.
//!
//! All durations are written in human form (`"5s"`, `"250ms"`, `"5m"`).

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::DiscoveryError;
use crate::model::{InstanceAddress, ServiceKey};

/// Lease TTL used when none is configured.
pub const DEFAULT_TTL_SECS: i64 = 10;

/// Which coordination store implementation a host process should dial.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// In-process store; useful for local runs and tests.
    #[default]
    Memory,
    Etcd,
}

/// Connection settings for the coordination store.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub backend: StoreBackend,

    pub endpoints: Vec<String>,

    /// Timeout for establishing the connection.
    #[serde(with = "humantime_duration")]
    pub dial_timeout: Duration,

    /// Timeout applied to individual unary requests.
    #[serde(with = "humantime_duration")]
    pub request_timeout: Duration,

    pub username: Option<String>,

    pub password: Option<StorePassword>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            endpoints: vec!["127.0.0.1:2379".to_owned()],
            dial_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
            username: None,
            password: None,
        }
    }
}

impl StoreConfig {
    #[must_use]
    pub fn new(backend: StoreBackend) -> Self {
        Self {
            backend,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_endpoints<I, S>(mut self, endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.endpoints = endpoints.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_credentials(mut self, user: impl Into<String>, password: StorePassword) -> Self {
        self.username = Some(user.into());
        self.password = Some(password);
        self
    }

    /// # Errors
    /// Returns `DiscoveryError::InvalidConfig` if no endpoint is configured or a timeout is zero.
    pub fn validate(&self) -> Result<(), DiscoveryError> {
        if self.backend == StoreBackend::Etcd && self.endpoints.is_empty() {
            return Err(DiscoveryError::InvalidConfig(
                "store.endpoints must not be empty".to_owned(),
            ));
        }
        if self.dial_timeout.is_zero() || self.request_timeout.is_zero() {
            return Err(DiscoveryError::InvalidConfig(
                "store timeouts must be positive".to_owned(),
            ));
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(DiscoveryError::InvalidConfig(
                "store.password requires store.username".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Store password. Formatting and serialization never reveal it, and the buffer is
/// zeroed on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct StorePassword(String);

impl StorePassword {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Callers must not log or persist the returned slice.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl Clone for StorePassword {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl fmt::Debug for StorePassword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl Serialize for StorePassword {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str("[REDACTED]")
    }
}

impl<'de> Deserialize<'de> for StorePassword {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        String::deserialize(d).map(Self)
    }
}

/// Backoff discipline shared by the registrar and the resolver.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconnectPolicy {
    /// Delay after the first failed attempt. Doubles on every further failure.
    #[serde(with = "humantime_duration")]
    pub initial_backoff: Duration,

    #[serde(with = "humantime_duration")]
    pub max_backoff: Duration,

    /// Lower bound between two consecutive attempts.
    #[serde(with = "humantime_duration")]
    pub min_interval: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            min_interval: Duration::from_secs(1),
        }
    }
}

impl ReconnectPolicy {
    #[must_use]
    pub fn with_initial_backoff(mut self, d: Duration) -> Self {
        self.initial_backoff = d;
        self
    }

    #[must_use]
    pub fn with_max_backoff(mut self, d: Duration) -> Self {
        self.max_backoff = d;
        self
    }

    #[must_use]
    pub fn with_min_interval(mut self, d: Duration) -> Self {
        self.min_interval = d;
        self
    }

    /// # Errors
    /// Returns `DiscoveryError::InvalidConfig` when the floor is zero or the cap is below it.
    pub fn validate(&self) -> Result<(), DiscoveryError> {
        if self.min_interval.is_zero() {
            return Err(DiscoveryError::InvalidConfig(
                "reconnect.min_interval must be positive".to_owned(),
            ));
        }
        if self.max_backoff < self.min_interval {
            return Err(DiscoveryError::InvalidConfig(
                "reconnect.max_backoff must be >= reconnect.min_interval".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Settings for advertising one instance.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RegistrarConfig {
    #[serde(default)]
    pub store: StoreConfig,

    pub service: String,

    pub host: String,

    pub port: u16,

    /// Lease TTL in seconds. Defaults to 10.
    #[serde(default)]
    pub ttl_secs: Option<i64>,

    /// Renewal cadence. Defaults to a third of the TTL.
    #[serde(default, with = "humantime_duration_opt")]
    pub keepalive_interval: Option<Duration>,

    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

impl RegistrarConfig {
    #[must_use]
    pub fn new(service: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            store: StoreConfig::default(),
            service: service.into(),
            host: host.into(),
            port,
            ttl_secs: None,
            keepalive_interval: None,
            reconnect: ReconnectPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    #[must_use]
    pub fn with_ttl_secs(mut self, ttl: i64) -> Self {
        self.ttl_secs = Some(ttl);
        self
    }

    #[must_use]
    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = Some(interval);
        self
    }

    #[must_use]
    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    #[must_use]
    pub fn ttl_secs(&self) -> i64 {
        self.ttl_secs.unwrap_or(DEFAULT_TTL_SECS)
    }

    pub(crate) fn validated(&self) -> Result<ValidatedRegistrar, DiscoveryError> {
        self.store.validate()?;
        self.reconnect.validate()?;

        let ttl_secs = self.ttl_secs();
        if ttl_secs <= 0 {
            return Err(DiscoveryError::InvalidConfig(format!(
                "ttl_secs must be positive, got {ttl_secs}"
            )));
        }
        let ttl = Duration::from_secs(ttl_secs.unsigned_abs());
        let keepalive_interval = self.keepalive_interval.unwrap_or(ttl / 3);
        if keepalive_interval.is_zero() || keepalive_interval >= ttl {
            return Err(DiscoveryError::InvalidConfig(format!(
                "keepalive_interval must be within (0, {ttl:?})"
            )));
        }

        Ok(ValidatedRegistrar {
            service: ServiceKey::new(self.service.clone())?,
            address: InstanceAddress::new(self.host.clone(), self.port)?,
            ttl_secs,
            keepalive_interval,
        })
    }
}

pub(crate) struct ValidatedRegistrar {
    pub service: ServiceKey,
    pub address: InstanceAddress,
    pub ttl_secs: i64,
    pub keepalive_interval: Duration,
}

/// Settings for watching one service.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ResolverConfig {
    #[serde(default)]
    pub store: StoreConfig,

    pub service: String,

    /// Period of the store liveness probe. `None` relies on the watch stream alone.
    #[serde(default = "default_health_check", with = "humantime_duration_opt")]
    pub health_check_interval: Option<Duration>,

    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

#[allow(clippy::unnecessary_wraps)]
fn default_health_check() -> Option<Duration> {
    Some(Duration::from_secs(10))
}

impl ResolverConfig {
    #[must_use]
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            store: StoreConfig::default(),
            service: service.into(),
            health_check_interval: default_health_check(),
            reconnect: ReconnectPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    #[must_use]
    pub fn with_health_check_interval(mut self, interval: Option<Duration>) -> Self {
        self.health_check_interval = interval;
        self
    }

    #[must_use]
    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub(crate) fn validated(&self) -> Result<ServiceKey, DiscoveryError> {
        self.store.validate()?;
        self.reconnect.validate()?;
        if self.health_check_interval.is_some_and(|d| d.is_zero()) {
            return Err(DiscoveryError::InvalidConfig(
                "health_check_interval must be positive".to_owned(),
            ));
        }
        ServiceKey::new(self.service.clone())
    }
}

/// `serde(with)` adapter for `Duration` in humantime notation.
pub mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serializer, de};
    use std::time::Duration;

    /// # Errors
    /// Fails when the string is not a humantime duration.
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(d)?;
        humantime::parse_duration(&s).map_err(de::Error::custom)
    }

    /// # Errors
    /// Propagates serializer errors.
    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&humantime::format_duration(*value))
    }
}

/// `serde(with)` adapter for `Option<Duration>` in humantime notation.
pub mod humantime_duration_opt {
    use serde::{Deserialize, Deserializer, Serializer, de};
    use std::time::Duration;

    /// # Errors
    /// Fails when the string is not a humantime duration.
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<String>::deserialize(d)?
            .map(|s| humantime::parse_duration(&s).map_err(de::Error::custom))
            .transpose()
    }

    /// # Errors
    /// Propagates serializer errors.
    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.collect_str(&humantime::format_duration(*d)),
            None => s.serialize_none(),
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn store_defaults_are_sane() {
        let cfg = StoreConfig::default();
        assert_eq!(cfg.backend, StoreBackend::Memory);
        assert_eq!(cfg.endpoints, vec!["127.0.0.1:2379".to_owned()]);
        assert_eq!(cfg.dial_timeout, Duration::from_secs(5));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn store_config_from_json_with_humantime() {
        let cfg: StoreConfig = serde_json::from_value(json!({
            "backend": "etcd",
            "endpoints": ["10.0.0.1:2379", "10.0.0.2:2379"],
            "dial_timeout": "250ms",
            "username": "root",
            "password": "hunter2"
        }))
        .unwrap();

        assert_eq!(cfg.backend, StoreBackend::Etcd);
        assert_eq!(cfg.endpoints.len(), 2);
        assert_eq!(cfg.dial_timeout, Duration::from_millis(250));
        assert_eq!(cfg.request_timeout, Duration::from_secs(5));
        assert_eq!(cfg.password.as_ref().unwrap().expose(), "hunter2");
    }

    #[test]
    fn password_never_printed() {
        let cfg = StoreConfig::default().with_credentials("root", StorePassword::new("hunter2"));
        let dbg = format!("{cfg:?}");
        let ser = serde_json::to_string(&cfg).unwrap();
        assert!(!dbg.contains("hunter2"));
        assert!(!ser.contains("hunter2"));
    }

    #[test]
    fn etcd_requires_endpoints() {
        let cfg = StoreConfig::new(StoreBackend::Etcd).with_endpoints(Vec::<String>::new());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn registrar_ttl_defaults_and_interval() {
        let cfg = RegistrarConfig::new("svc", "127.0.0.1", 8080);
        let v = cfg.validated().unwrap();
        assert_eq!(v.ttl_secs, DEFAULT_TTL_SECS);
        assert_eq!(v.keepalive_interval, Duration::from_secs(10) / 3);
        assert_eq!(v.service.prefix(), "svc/");
    }

    #[test]
    fn registrar_rejects_bad_ttl_and_interval() {
        let zero = RegistrarConfig::new("svc", "h", 1).with_ttl_secs(0);
        assert!(matches!(zero.validated(), Err(DiscoveryError::InvalidConfig(_))));

        let slow = RegistrarConfig::new("svc", "h", 1)
            .with_ttl_secs(2)
            .with_keepalive_interval(Duration::from_secs(2));
        assert!(matches!(slow.validated(), Err(DiscoveryError::InvalidConfig(_))));
    }

    #[test]
    fn reconnect_policy_floor_must_be_positive() {
        let p = ReconnectPolicy::default().with_min_interval(Duration::ZERO);
        assert!(p.validate().is_err());
        let p = ReconnectPolicy::default()
            .with_min_interval(Duration::from_secs(2))
            .with_max_backoff(Duration::from_secs(1));
        assert!(p.validate().is_err());
    }

    #[test]
    fn resolver_config_from_json() {
        let cfg: ResolverConfig = serde_json::from_value(json!({
            "service": "helloworld.Greeter",
            "reconnect": { "initial_backoff": "100ms", "max_backoff": "2s", "min_interval": "50ms" }
        }))
        .unwrap();
        assert_eq!(cfg.health_check_interval, Some(Duration::from_secs(10)));
        assert_eq!(cfg.reconnect.initial_backoff, Duration::from_millis(100));
        assert_eq!(cfg.validated().unwrap().name(), "helloworld.Greeter");
    }
}

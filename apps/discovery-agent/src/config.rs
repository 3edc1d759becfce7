use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use discovery::config::humantime_duration_opt;
use discovery::{ReconnectPolicy, RegistrarConfig, ResolverConfig, StoreBackend, StoreConfig};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use serde::{Deserialize, Serialize};

/// Environment prefix; nested keys are separated by `__`, e.g. `DISCOVERY__STORE__BACKEND`.
pub const ENV_PREFIX: &str = "DISCOVERY__";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info` or `discovery=debug,info`. `RUST_LOG` wins when set.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistrarSection {
    pub ttl_secs: Option<i64>,
    #[serde(with = "humantime_duration_opt")]
    pub keepalive_interval: Option<Duration>,
    pub reconnect: ReconnectPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResolverSection {
    #[serde(with = "humantime_duration_opt")]
    pub health_check_interval: Option<Duration>,
    pub reconnect: ReconnectPolicy,
}

impl Default for ResolverSection {
    fn default() -> Self {
        let defaults = ResolverConfig::new("");
        Self {
            health_check_interval: defaults.health_check_interval,
            reconnect: defaults.reconnect,
        }
    }
}

/// Effective agent configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    pub store: StoreConfig,
    pub logging: LoggingConfig,
    pub registrar: RegistrarSection,
    pub resolver: ResolverSection,
}

/// Command-line values that take precedence over every other layer.
#[derive(Debug, Default)]
pub struct CliOverrides {
    pub verbose: u8,
    pub backend: Option<StoreBackend>,
    pub endpoints: Vec<String>,
}

impl AgentConfig {
    /// Layered load: defaults, then the YAML file (if any), then `DISCOVERY__*` env vars.
    ///
    /// # Errors
    /// Fails if a layer cannot be read or the merged result does not deserialize.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new().merge(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .context("invalid configuration")
    }

    pub fn apply_cli_overrides(&mut self, cli: &CliOverrides) {
        match cli.verbose {
            0 => {}
            1 => "info".clone_into(&mut self.logging.level),
            2 => "debug".clone_into(&mut self.logging.level),
            _ => "trace".clone_into(&mut self.logging.level),
        }
        if let Some(backend) = cli.backend {
            self.store.backend = backend;
        }
        if !cli.endpoints.is_empty() {
            self.store.endpoints.clone_from(&cli.endpoints);
        }
    }

    /// # Errors
    /// Fails if the store or reconnect settings are inconsistent.
    pub fn validate(&self) -> Result<()> {
        self.store.validate()?;
        self.registrar.reconnect.validate()?;
        self.resolver.reconnect.validate()?;
        discovery::connector_for(&self.store)?;
        Ok(())
    }

    #[must_use]
    pub fn registrar_config(
        &self,
        service: &str,
        host: &str,
        port: u16,
        ttl: Option<i64>,
    ) -> RegistrarConfig {
        RegistrarConfig {
            store: self.store.clone(),
            service: service.to_owned(),
            host: host.to_owned(),
            port,
            ttl_secs: ttl.or(self.registrar.ttl_secs),
            keepalive_interval: self.registrar.keepalive_interval,
            reconnect: self.registrar.reconnect.clone(),
        }
    }

    #[must_use]
    pub fn resolver_config(&self, service: &str) -> ResolverConfig {
        ResolverConfig::new(service)
            .with_store(self.store.clone())
            .with_health_check_interval(self.resolver.health_check_interval)
            .with_reconnect(self.resolver.reconnect.clone())
    }

    /// # Errors
    /// Propagates serialization errors.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("failed to render configuration")
    }
}

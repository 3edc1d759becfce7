mod config;
mod logging;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use discovery::{AddressList, Registrar, Resolver, StoreBackend};

use crate::config::{AgentConfig, CliOverrides};

/// Discovery agent - register an instance or watch a service in the coordination store
#[derive(Parser)]
#[command(name = "discovery-agent")]
#[command(about = "Register service instances and watch service address lists")]
#[command(version)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print effective configuration (JSON) and exit
    #[arg(long)]
    print_config: bool,

    /// Log verbosity level (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Store backend override
    #[arg(long, value_enum)]
    backend: Option<BackendArg>,

    /// Store endpoint override, may be repeated
    #[arg(long = "endpoint")]
    endpoints: Vec<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, ValueEnum)]
enum BackendArg {
    Memory,
    Etcd,
}

impl From<BackendArg> for StoreBackend {
    fn from(value: BackendArg) -> Self {
        match value {
            BackendArg::Memory => Self::Memory,
            BackendArg::Etcd => Self::Etcd,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Register an instance and keep it alive until Ctrl-C
    Register(RegisterArgs),
    /// Resolve a service and log every address list change until Ctrl-C
    Watch(WatchArgs),
    /// Validate configuration and exit
    Check,
}

#[derive(Args)]
struct RegisterArgs {
    /// Service name, e.g. helloworld.Greeter
    #[arg(long)]
    service: String,

    /// Advertised host
    #[arg(long)]
    host: String,

    /// Advertised port
    #[arg(long)]
    port: u16,

    /// Lease TTL in seconds (overrides config)
    #[arg(long)]
    ttl: Option<i64>,
}

#[derive(Args)]
struct WatchArgs {
    /// Service name, e.g. helloworld.Greeter
    #[arg(long)]
    service: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(path) = &cli.config {
        if !path.is_file() {
            anyhow::bail!("config file does not exist: {}", path.display());
        }
    }

    // 1) defaults -> 2) YAML (if provided) -> 3) env (DISCOVERY__*) -> 4) CLI overrides
    let mut config = AgentConfig::load(cli.config.as_deref())?;
    config.apply_cli_overrides(&CliOverrides {
        verbose: cli.verbose,
        backend: cli.backend.map(Into::into),
        endpoints: cli.endpoints,
    });

    if cli.print_config {
        println!("{}", config.to_json()?);
        return Ok(());
    }

    logging::init(&config.logging);

    match cli.command.unwrap_or(Commands::Check) {
        Commands::Register(args) => register(&config, &args).await,
        Commands::Watch(args) => watch(&config, &args.service).await,
        Commands::Check => check(&config),
    }
}

fn check(config: &AgentConfig) -> Result<()> {
    tracing::info!("checking configuration");
    config.validate()?;
    println!("Configuration is valid");
    println!("{}", config.to_json()?);
    Ok(())
}

async fn register(config: &AgentConfig, args: &RegisterArgs) -> Result<()> {
    config.validate()?;
    let connector = discovery::connector_for(&config.store)?;
    let registrar = Registrar::register(
        connector,
        config.registrar_config(&args.service, &args.host, args.port, args.ttl),
    )
    .await
    .context("registration failed")?;

    tracing::info!(key = registrar.key(), "holding registration, press Ctrl-C to stop");

    let mut status = registrar.subscribe();
    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res.context("failed to listen for Ctrl-C")?;
                break;
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *status.borrow_and_update();
                tracing::info!(
                    state = ?current.state,
                    lease = ?current.lease,
                    "registrar state changed"
                );
            }
        }
    }

    registrar
        .deregister()
        .await
        .context("deregistration failed")?;
    Ok(())
}

async fn watch(config: &AgentConfig, service: &str) -> Result<()> {
    config.validate()?;
    let connector = discovery::connector_for(&config.store)?;
    let updater = Arc::new(|list: &AddressList| {
        tracing::info!(
            version = list.version(),
            addresses = ?list.to_strings(),
            "address list updated"
        );
    });

    let resolver = Resolver::resolve(connector, config.resolver_config(service), updater)
        .await
        .context("resolve failed")?;
    tracing::info!(
        scheme = resolver.scheme(),
        target = %resolver.target(),
        "watching, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    resolver.close().await;
    Ok(())
}

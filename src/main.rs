use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;
use uninuvola_init::config::Settings;
use uninuvola_init::orchestrator::{self, Service};
use uninuvola_init::secrets::{SecretSelector, SecretStore};

#[derive(Parser, Debug)]
#[command(author, version, about = "Bootstrap LDAP and Vault for an identity stack", long_about = None)]
struct Cli {
    /// Log level; `RUST_LOG` takes precedence when set
    #[arg(short, long, value_enum, default_value_t = LogLevel::Info)]
    verbose: LogLevel,

    /// Path to the YAML or TOML configuration file
    config: PathBuf,

    /// Services to deploy (all when omitted)
    #[arg(long, value_enum, num_args = 1.., conflicts_with = "read_secrets")]
    services: Vec<Service>,

    /// Print persisted Vault secrets and exit
    #[arg(long, value_enum, value_name = "WHAT")]
    read_secrets: Option<SecretSelector>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

fn main() {
    if let Err(err) = run() {
        eprintln!("uninuvola-init error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let settings = Settings::load(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    let runtime = tokio::runtime::Runtime::new().context("Failed to initialize async runtime")?;
    if let Some(selector) = cli.read_secrets {
        let store = SecretStore::new(&settings.broker.secrets_file);
        let rendered = runtime.block_on(orchestrator::read_secrets(&store, selector))?;
        println!("{rendered}");
        return Ok(());
    }

    runtime
        .block_on(orchestrator::run(&settings, &cli.services))
        .context("Bootstrap failed")?;
    Ok(())
}

fn init_tracing(level: LogLevel) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.directive()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

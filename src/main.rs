//! cloudbridge daemon
//!
//! Mirrors the readings of one device into a local InfluxDB database.
//!
//! # Usage
//!
//! ```text
//! cloudbridge --device <ID> --db <NAME> --token <TOKEN> [--freq 60] [--norm 1]
//! cloudbridge --group <ID> --db <NAME> --token <TOKEN>
//! ```
//!
//! Settings can also come from a TOML file (`--config`) and `CLOUDBRIDGE_*`
//! environment variables; flags win over both. Run one process per target:
//! two processes sharing a target name would share a state file.

use anyhow::Context;
use clap::Parser;
use cloudbridge::cloud::{CloudClient, CredentialManager};
use cloudbridge::config::{generate_default_config, Config, LoggingConfig};
use cloudbridge::sink::InfluxSink;
use cloudbridge::state::StateStore;
use cloudbridge::sync::SyncEngine;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "cloudbridge")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Synchronize device-cloud readings into InfluxDB")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Device to synchronize
    #[arg(long, conflicts_with = "group")]
    device: Option<String>,

    /// Device group to synchronize, every member device included
    #[arg(long)]
    group: Option<String>,

    /// Target name keying the state file (default: device id)
    #[arg(long)]
    name: Option<String>,

    /// InfluxDB database name
    #[arg(long)]
    db: Option<String>,

    /// InfluxDB host
    #[arg(long)]
    host: Option<String>,

    /// InfluxDB port
    #[arg(long)]
    port: Option<u16>,

    /// Seconds between sync cycles
    #[arg(long)]
    freq: Option<u64>,

    /// Divide every reading by this value
    #[arg(long)]
    norm: Option<f64>,

    /// Bootstrap access token
    #[arg(long)]
    token: Option<String>,

    /// Device cloud API base URL
    #[arg(long)]
    api_url: Option<String>,

    /// Only poll series whose name contains this string
    #[arg(long)]
    series_filter: Option<String>,

    /// First-cycle start position as Unix milliseconds
    #[arg(long, conflicts_with = "start_iso")]
    start_ms: Option<i64>,

    /// First-cycle start position as YYYY-MM-DDTHH:MM:SS.ffffffZ
    #[arg(long)]
    start_iso: Option<String>,

    /// Directory holding checkpoint and token state
    #[arg(long)]
    state_dir: Option<String>,

    /// Print a commented default configuration file and exit
    #[arg(long)]
    print_config: bool,
}

impl Cli {
    /// Flags take precedence over file and environment settings
    fn apply(self, config: &mut Config) {
        // A target on the command line replaces any configured one
        if let Some(device) = self.device {
            config.target.device_id = device;
            config.target.group_id = None;
        }
        if let Some(group) = self.group {
            config.target.device_id.clear();
            config.target.group_id = Some(group);
        }
        if let Some(name) = self.name {
            config.target.name = Some(name);
        }
        if let Some(filter) = self.series_filter {
            config.target.series_filter = Some(filter);
        }
        if let Some(db) = self.db {
            config.database.name = db;
        }
        if let Some(host) = self.host {
            config.database.host = host;
        }
        if let Some(port) = self.port {
            config.database.port = port;
        }
        if let Some(freq) = self.freq {
            config.sync.interval_secs = freq;
        }
        if let Some(norm) = self.norm {
            config.sync.norm_factor = norm;
        }
        if let Some(token) = self.token {
            config.cloud.token = token;
        }
        if let Some(url) = self.api_url {
            config.cloud.api_url = url;
        }
        if let Some(dir) = self.state_dir {
            config.sync.state_dir = dir;
        }
        // A start position on the command line replaces any configured one
        if self.start_ms.is_some() || self.start_iso.is_some() {
            config.sync.start_ms = self.start_ms;
            config.sync.start_iso = self.start_iso;
        }
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("cloudbridge={}", logging.level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.print_config {
        print!("{}", generate_default_config());
        return Ok(());
    }

    let mut config = Config::load_with_env(cli.config.as_deref())?;
    cli.apply(&mut config);
    config.validate().context("invalid configuration")?;

    init_tracing(&config.logging);
    tracing::info!("cloudbridge v{}", env!("CARGO_PKG_VERSION"));

    let store = Arc::new(
        StateStore::open(config.state_dir(), config.target_name())
            .context("cannot open state store")?,
    );
    tracing::info!("State file: {:?}", store.path());

    let api = Arc::new(
        CloudClient::new(config.cloud_config()).context("cannot build API client")?,
    );
    let sink = Arc::new(
        InfluxSink::new(config.influx_config()).context("cannot build database client")?,
    );

    let credentials = CredentialManager::new(
        api.clone(),
        store.clone(),
        config.target()?,
        config.cloud.app_name.clone(),
        config.bootstrap_credential()?,
    );

    let mut engine = SyncEngine::new(config.sync_config()?, api, credentials, sink, store);

    tokio::select! {
        _ = engine.run() => {}
        result = tokio::signal::ctrl_c() => {
            result.context("cannot listen for shutdown signal")?;
            tracing::info!("Shutting down");
        }
    }

    Ok(())
}

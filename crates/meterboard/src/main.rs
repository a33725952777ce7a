//! meterboard - Traffic metering and settlement for proxy relay fleets

mod cli;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use meterboard_core::{run_device_sweep, run_period_sweep, Fingerprint, Meter, MeterConfig};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "meterboard",
    version,
    about = "Traffic metering and settlement for proxy relay fleets",
    long_about = "Accepts traffic, liveness and status pushes from relay nodes, turns raw bytes\n\
                  into billable usage per accounting period, and serves each node the list of\n\
                  subscribers it may carry.\n\
                  \n\
                  Examples:\n\
                    meterboard serve                     # Node API + background sweeps\n\
                    meterboard sweep                     # Roll over expired periods once\n\
                    meterboard usage 42                  # Period history of subscriber 42\n\
                    meterboard devices --json            # Live device counts\n\
                    meterboard ingest --node 3 push.json # Apply a saved traffic push\n\
                    meterboard fingerprint 3             # ETag a node would receive\n\
                  \n\
                  Environment Variables:\n\
                    METERBOARD_CONFIG                    # TOML config file\n\
                    METERBOARD_DB                        # SQLite ledger path\n\
                    METERBOARD_PORT                      # HTTP port for `serve`\n\
                    METERBOARD_NODE_TOKEN                # Shared node token\n\
                    RUST_LOG                             # Log filter (default: info)"
)]
struct Cli {
    #[command(subcommand)]
    mode: Option<Mode>,

    /// TOML configuration file
    #[arg(long, env = "METERBOARD_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite ledger path (overrides the config file)
    #[arg(long, env = "METERBOARD_DB")]
    database: Option<PathBuf>,

    /// HTTP port (overrides the config file)
    #[arg(long, env = "METERBOARD_PORT")]
    port: Option<u16>,

    /// Shared token nodes authenticate with (overrides the config file)
    #[arg(long, env = "METERBOARD_NODE_TOKEN", hide_env_values = true)]
    node_token: Option<String>,

    /// Disable ANSI colors in tables
    #[arg(long, env = "METERBOARD_NO_COLOR")]
    no_color: bool,
}

#[derive(Subcommand)]
enum Mode {
    /// Serve the node API and run background sweeps (default)
    Serve,
    /// Run the period rollover and stale device sweeps once
    Sweep,
    /// Show a subscriber's accounting periods
    Usage {
        subscriber_id: u64,
        /// Number of periods
        #[arg(long, short = 'n', default_value = "12")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show live device counts
    Devices {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Apply a traffic push read from a file
    Ingest {
        /// Reporting node
        #[arg(long)]
        node: u64,
        /// JSON file with the push body
        file: PathBuf,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the ETag of a node's user list or runtime config
    Fingerprint {
        node_id: u64,
        /// Which document to fingerprint
        #[arg(long, value_parser = ["user", "config"], default_value = "user")]
        document: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => MeterConfig::load(path)?,
        None => MeterConfig::default(),
    };
    if let Some(database) = cli.database {
        config.database_path = Some(database);
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(token) = cli.node_token {
        config.node.server_token = token;
    }

    let no_color = cli.no_color;

    match cli.mode.unwrap_or(Mode::Serve) {
        Mode::Serve => run_serve(config).await?,
        Mode::Sweep => run_sweep(config).await?,
        Mode::Usage {
            subscriber_id,
            limit,
            json,
        } => run_usage(config, subscriber_id, limit, json, no_color)?,
        Mode::Devices { json } => run_devices(config, json, no_color)?,
        Mode::Ingest { node, file, json } => run_ingest(config, node, file, json).await?,
        Mode::Fingerprint { node_id, document } => run_fingerprint(config, node_id, &document)?,
    }

    Ok(())
}

/// Logs go to stderr so `--json` output stays clean
fn init_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn run_serve(config: MeterConfig) -> Result<()> {
    let ip: IpAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("Invalid bind address: {}", config.server.bind))?;
    let addr = SocketAddr::new(ip, config.server.port);

    if config.node.server_token.is_empty() {
        bail!("No node token configured (set node.server_token or METERBOARD_NODE_TOKEN)");
    }

    let meter = Arc::new(Meter::open(config)?);
    let scheduler = meter.start_jobs();

    info!(version = env!("CARGO_PKG_VERSION"), %addr, "meterboard starting");
    let served = meterboard_web::run(Arc::clone(&meter), addr, shutdown_signal()).await;

    scheduler.stop().await;
    served
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

async fn run_sweep(config: MeterConfig) -> Result<()> {
    let meter = Meter::open(config)?;
    let report = run_period_sweep(Arc::clone(meter.periods()), Arc::clone(meter.metrics()))
        .await
        .context("Period sweep failed")?;
    let removed = run_device_sweep(Arc::clone(meter.devices()))
        .await
        .context("Device sweep failed")?;

    println!("{}", cli::format_sweep(&report, removed));
    Ok(())
}

fn run_usage(
    config: MeterConfig,
    subscriber_id: u64,
    limit: usize,
    json: bool,
    no_color: bool,
) -> Result<()> {
    let meter = Meter::open(config)?;
    let history = meter
        .periods()
        .history(subscriber_id, limit)
        .with_context(|| format!("Failed to read usage of subscriber {subscriber_id}"))?;

    println!("{}", cli::format_usage(&history, json, no_color));
    Ok(())
}

fn run_devices(config: MeterConfig, json: bool, no_color: bool) -> Result<()> {
    let meter = Meter::open(config)?;
    let counts = meter.devices().all_device_counts(Utc::now())?;

    println!("{}", cli::format_device_counts(&counts, json, no_color));
    Ok(())
}

async fn run_ingest(config: MeterConfig, node_id: u64, file: PathBuf, json: bool) -> Result<()> {
    let content = std::fs::read_to_string(&file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let payload: serde_json::Value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", file.display()))?;

    let meter = Meter::open(config)?;
    let outcome = meter.ingest().ingest(node_id, payload).await?;

    println!("{}", cli::format_ingest_outcome(&outcome, json));
    if outcome.has_fatal() {
        bail!("Ledger consistency alarm while applying the push");
    }
    Ok(())
}

fn run_fingerprint(config: MeterConfig, node_id: u64, document: &str) -> Result<()> {
    let meter = Meter::open(config)?;
    let tag = match document {
        "config" => {
            let node = meter.node(node_id)?;
            Fingerprint::of(&meter.runtime_config(&node))?
        }
        _ => Fingerprint::of(&meter.authorized_users(node_id, Utc::now())?)?,
    };

    println!("{}", tag.header_value());
    Ok(())
}

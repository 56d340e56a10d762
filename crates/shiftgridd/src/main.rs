//! shiftgridd: the Shiftgrid daemon.
//!
//! # Usage
//!
//! ```text
//! shiftgridd run --config /etc/shiftgrid/shiftgrid.toml --data-dir /var/lib/shiftgrid
//! shiftgridd validate --config shiftgrid.toml
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use shiftgrid_core::ShiftgridConfig;

const DEFAULT_LISTEN: &str = "0.0.0.0:8480";
const DEFAULT_DATA_DIR: &str = "/var/lib/shiftgrid";
const DEFAULT_FILTER: &str = "info,shiftgridd=debug,shiftgrid=debug";

#[derive(Parser)]
#[command(name = "shiftgridd", about = "Shiftgrid daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane.
    Run {
        /// Path to shiftgrid.toml.
        #[arg(long, short)]
        config: PathBuf,

        /// API listen address. Overrides `api.listen`.
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// Data directory for persistent state. Overrides `api.data_dir`.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Parse and validate a config file, then exit.
    Validate {
        #[arg(long, short)]
        config: PathBuf,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Run {
            config,
            listen,
            data_dir,
        } => {
            let parsed = ShiftgridConfig::from_file(&config)
                .with_context(|| format!("load {}", config.display()))?;
            info!(path = ?config, tiers = parsed.tiers.len(), "config loaded");

            let listen = match listen {
                Some(addr) => addr,
                None => parsed
                    .api
                    .listen
                    .as_deref()
                    .unwrap_or(DEFAULT_LISTEN)
                    .parse()
                    .context("api.listen")?,
            };
            let data_dir = data_dir
                .or_else(|| parsed.api.data_dir.clone())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));

            shiftgridd::run_control_plane(parsed, listen, &data_dir).await
        }
        Command::Validate { config } => {
            let parsed = ShiftgridConfig::from_file(&config)
                .with_context(|| format!("load {}", config.display()))?;
            println!(
                "{}: ok ({} tiers, pipeline order {}, datastore {})",
                config.display(),
                parsed.tiers.len(),
                parsed.pipeline.order.join(" -> "),
                if parsed.datastore.is_some() { "configured" } else { "none" },
            );
            Ok(())
        }
    }
}

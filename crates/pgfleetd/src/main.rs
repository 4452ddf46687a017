//! pgfleetd — the pgfleet daemon.
//!
//! Single binary that assembles the controller:
//! - Resource store (redb)
//! - One reconcile loop per cluster (planner, replication coordinator,
//!   backup scheduler)
//! - REST API
//!
//! # Usage
//!
//! ```text
//! pgfleetd standalone --config pgfleet.toml --manifests ./clusters
//! pgfleetd validate clusters/orders.toml
//! pgfleetd plan clusters/orders.toml
//! ```

mod manifest;
mod standalone;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use pgfleet_state::ClusterStatus;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,pgfleetd=debug,pgfleet=debug";

#[derive(Parser)]
#[command(name = "pgfleetd", about = "pgfleet PostgreSQL cluster controller")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controller against the in-process simulated platform.
    Standalone {
        /// Controller configuration (TOML).
        #[arg(long)]
        config: Option<PathBuf>,

        /// Directory of cluster manifests (`*.toml`) to apply at start-up.
        #[arg(long)]
        manifests: Option<PathBuf>,

        /// Secrets file: `[secret-name]` tables of `key = "value"`.
        #[arg(long)]
        secrets: Option<PathBuf>,

        /// Data directory for persistent state; overrides the config file.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// API port; overrides the config file.
        #[arg(long)]
        port: Option<u16>,

        /// Keep state in memory only.
        #[arg(long)]
        in_memory: bool,

        #[arg(long, value_enum, default_value = "text")]
        log_format: LogFormat,
    },

    /// Parse and validate a cluster manifest.
    Validate { manifest: PathBuf },

    /// Print the plan that would bootstrap a manifest's cluster from scratch.
    Plan { manifest: PathBuf },
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Standalone {
            config,
            manifests,
            secrets,
            data_dir,
            port,
            in_memory,
            log_format,
        } => {
            init_tracing(log_format);
            standalone::run_standalone(standalone::StandaloneOptions {
                config,
                manifests,
                secrets,
                data_dir,
                port,
                in_memory,
            })
            .await
        }
        Command::Validate { manifest } => {
            let spec = manifest::load_manifest(&manifest)?;
            println!(
                "{}: ok ({} instances, {})",
                spec.id(),
                spec.instances,
                spec.image
            );
            Ok(())
        }
        Command::Plan { manifest } => {
            let spec = manifest::load_manifest(&manifest)?;
            let plan = pgfleet_planner::plan(&spec, &ClusterStatus::new(&spec.id()));
            println!("{}", serde_json::to_string_pretty(&plan)?);
            Ok(())
        }
    }
}

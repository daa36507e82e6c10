//! fleetgated — the fleetgate daemon.
//!
//! # Usage
//!
//! ```text
//! fleetgated run --config /etc/fleetgate/fleetgated.toml
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use fleetgated::{Config, LogFormat};

const DEFAULT_FILTER: &str = "info,fleetgated=debug,fleetgate=debug";

#[derive(Parser)]
#[command(name = "fleetgated", about = "fleetgate workload proxy daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the workload proxy and its API.
    Run {
        /// Path to the TOML configuration file.
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Address to listen on (overrides `server.listen`).
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// Data directory for persistent state (overrides `server.data_dir`).
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            listen,
            data_dir,
        } => {
            let mut config = match config {
                Some(path) => Config::from_file(&path)?,
                None => Config::default(),
            };
            if let Some(listen) = listen {
                config.server.listen = listen;
            }
            if data_dir.is_some() {
                config.server.data_dir = data_dir;
            }

            init_tracing(config.server.log_format);
            fleetgated::daemon::run(config).await
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

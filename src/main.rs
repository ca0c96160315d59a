use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use eventgate::bootstrap::Server;
use eventgate::config::Config;
use eventgate::telemetry::{init_tracing, TracingConfig};

#[derive(Parser, Debug)]
#[command(name = "eventgate")]
#[command(author, version, about = "Socket session gateway onto an in-process event bus")]
struct Args {
    /// Path to config file
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Validate config and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration first (to get log settings)
    let config = Config::load(&args.config)?;

    init_tracing(&TracingConfig::from(&config.telemetry))?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        "starting eventgate"
    );

    info!(
        bridges = config.bridges.len(),
        datagram = config.datagram.len(),
        modules = config.modules.len(),
        "configuration loaded"
    );

    // Validate only mode
    if args.validate {
        info!("configuration is valid");
        return Ok(());
    }

    Server::new(config)?.run().await
}

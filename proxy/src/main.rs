use std::path::PathBuf;

use clap::Parser;
use log::{error, info};
use proxy::{Config, Proxy};

/// Caching proxy for Source engine server queries
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Path to the TOML configuration file
    #[clap(short, long, default_value = "proxy.toml")]
    config: PathBuf,
    /// Log level used when RUST_LOG is not set
    #[clap(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    let config = Config::load(&args.config).map_err(|e| {
        error!("Cannot load {}: {}", args.config.display(), e);
        e
    })?;
    let proxy = Proxy::bind(config).await?;
    info!("Loaded {}", args.config.display());

    tokio::select! {
        result = proxy.run() => {
            if let Err(e) = result {
                error!("Proxy stopped: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}

// node/src/main.rs
use clap::{Parser, Subcommand};
use node::{BlockchainService, NodeConfig};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "wot-node")]
#[command(about = "Web-of-Trust Currency Node", version, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node
    Start {
        /// Configuration file path
        #[arg(short, long, default_value = "./config.toml")]
        config: String,
    },

    /// Write a default configuration file
    Init {
        /// Configuration file path
        #[arg(short, long, default_value = "./config.toml")]
        config: String,

        /// Currency name
        #[arg(long, default_value = "wotcoin")]
        currency: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init { config, currency } => {
            let node_config = NodeConfig {
                currency,
                ..Default::default()
            };
            node_config.to_file(&config)?;
            println!("Configuration written to {config}");
            Ok(())
        }
        Commands::Start { config } => {
            let node_config = NodeConfig::from_file(&config)?;
            init_logging(&node_config, cli.debug);
            run(node_config).await
        }
    }
}

fn init_logging(config: &NodeConfig, debug: bool) {
    let filter = if debug {
        "debug".to_string()
    } else {
        config.logging.filter.clone()
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run(config: NodeConfig) -> anyhow::Result<()> {
    let service = Arc::new(BlockchainService::new(config).await?);

    let generation = if service.config().participate {
        match service.clone().start_generation() {
            Ok(handle) => Some(handle),
            Err(err) => {
                tracing::warn!(error = %err, "generation not started");
                None
            }
        }
    } else {
        None
    };

    tracing::info!("node is up; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    tracing::info!("shutting down");
    if let Ok(stats) = serde_json::to_string(&service.pow_stats()) {
        tracing::info!(%stats, "miner state at shutdown");
    }
    service.stop_proof().await;
    if let Some(handle) = generation {
        let _ = handle.await;
    }
    service.compute_stats().await.ok();
    Ok(())
}

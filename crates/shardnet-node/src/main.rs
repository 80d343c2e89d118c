//! Shardnet node binary.
//!
//! Usage:
//!   shardnet-node                      # run with default config
//!   shardnet-node --config path.toml   # run with custom config
//!   shardnet-node identity             # show node identity
//!   shardnet-node identity generate    # generate a new identity

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use shardnet_crypto::Identity;
use shardnet_node::{Config, Server, ShardId};

#[derive(Parser)]
#[command(name = "shardnet-node", about = "Shardnet P2P node")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.shardnet/config.toml")]
    config: String,

    /// Path to the identity key file
    #[arg(short, long, default_value = "~/.shardnet/node.key")]
    key_file: String,

    /// Shard to join
    #[arg(short, long, default_value_t = 1)]
    shard: ShardId,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node (default)
    Run,
    /// Show or generate the node identity
    Identity {
        #[command(subcommand)]
        action: Option<IdentityAction>,
    },
}

#[derive(Subcommand)]
enum IdentityAction {
    /// Generate a new identity keypair
    Generate,
    /// Show the current node identity
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shardnet_node=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let key_path = expand_tilde(&cli.key_file);

    match cli.command {
        Some(Commands::Identity { action }) => match action {
            Some(IdentityAction::Generate) | None => {
                let identity = Identity::load_or_create(&key_path)?;
                println!("Node ID: {}", identity.node_id());
                println!("Address: {}", identity.node_id().address());
                println!("Key file: {}", key_path.display());
            }
            Some(IdentityAction::Show) => {
                if key_path.exists() {
                    let hex_key = std::fs::read_to_string(&key_path)?;
                    let identity = Identity::from_hex(&hex_key)?;
                    println!("Node ID: {}", identity.node_id());
                    println!("Address: {}", identity.node_id().address());
                } else {
                    eprintln!("No identity found at {}", key_path.display());
                    std::process::exit(1);
                }
            }
        },
        Some(Commands::Run) | None => {
            let config_path = expand_tilde(&cli.config);
            let mut config = Config::load_or_default(&config_path)?;
            if config.private_key.is_none() {
                let identity = Identity::load_or_create(&key_path)?;
                config.private_key = Some(identity.to_hex());
            }
            run_node(config, cli.shard).await?;
        }
    }

    Ok(())
}

async fn run_node(config: Config, shard: ShardId) -> anyhow::Result<()> {
    let server = Server::new(config, Vec::new())?;
    server.start(shard).await?;
    tracing::info!(node = %server.node_id(), shard, "node started");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    server.stop().await;
    Ok(())
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    PathBuf::from(path)
}

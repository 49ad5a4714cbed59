use clap::Parser;
use log::{error, info};
use podoru::config::NodeConfig;
use podoru::genesis::GenesisConfig;
use podoru::node::{Node, NodeError, NullEventSink};
use podoru::storage::RocksStorage;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "podoru", about = "Permissioned PoA key-value chain node")]
struct Args {
    /// Path to the node configuration (YAML)
    #[arg(short, long)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), NodeError> {
    let config = NodeConfig::load(&args.config)?;
    let (genesis, network_id) = GenesisConfig::load(&config.genesis_path)?;
    info!("network id {network_id}");

    std::fs::create_dir_all(&config.data_dir).map_err(podoru::config::ConfigError::Io)?;
    let storage = Arc::new(RocksStorage::open(config.data_dir.join("chain"))?);

    let node = Node::new(config, genesis, network_id, storage, Arc::new(NullEventSink))?;
    node.start().await?;

    tokio::signal::ctrl_c()
        .await
        .map_err(podoru::config::ConfigError::Io)?;
    info!("shutting down");
    node.shutdown();
    Ok(())
}

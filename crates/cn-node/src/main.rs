use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use cn_config::NodeConfig;
use cn_runtime::lifecycle::{ControlNode, wait_for_signal};
use cn_runtime::tracing_init::init_tracing;
use cn_runtime::PassThroughService;

mod distribute;
mod inject;

#[derive(Parser)]
#[command(name = "ctrlnode", about = "Decentralized workflow control node")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a control node in front of the local business service
    Run {
        /// Path to ctrlnode.toml config file
        #[arg(short, long)]
        config: PathBuf,
        /// Attribute names the built-in pass-through service produces
        /// (repeat per attribute; embedders supply a real handler instead)
        #[arg(long = "produce")]
        produce: Vec<String>,
    },
    /// Inject a workflow-root token into a node's ingress port
    Inject(inject::InjectArgs),
    /// Ship a rule-fragment file to control nodes and collect commitment ACKs
    Distribute(distribute::DistributeArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, produce } => run_node(config, produce).await,
        Commands::Inject(args) => inject::run(args).await,
        Commands::Distribute(args) => distribute::run(args).await,
    }
}

async fn run_node(config: PathBuf, produce: Vec<String>) -> Result<()> {
    let config_path = config
        .canonicalize()
        .map_err(|e| anyhow::anyhow!("config path '{}': {e}", config.display()))?;
    let node_config = NodeConfig::load(&config_path)?;
    let base_dir = config_path
        .parent()
        .expect("config path must have a parent directory");

    let _guard = init_tracing(&node_config.logging, base_dir)?;

    let handler = Arc::new(PassThroughService::new(produce));
    let node = ControlNode::start(node_config, base_dir, handler)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    tracing::info!(
        domain = "sys",
        ingress = %node.ingress_addr(),
        rules = %node.rule_addr(),
        "control node running"
    );

    let cancel = node.cancel_token();
    tokio::select! {
        _ = wait_for_signal(cancel.clone()) => {}
        // Internal fatal errors (coordination invariants) cancel the token
        // without a signal.
        _ = cancel.cancelled() => {}
    }
    node.shutdown();
    node.wait().await.map_err(|e| anyhow::anyhow!("{e}"))?;

    Ok(())
}

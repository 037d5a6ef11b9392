use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use spynode_config::{Config, ConfigOverrides};
use spynode_core::crypto::Hash;
use spynode_core::mempool::MemPool;
use spynode_core::transaction::Transaction;
use spynode_node::listeners::{Listener, TxState};
use spynode_node::storage::{MemoryBlockRepository, MemoryPeerRepository};
use spynode_node::{NodeConfig, UntrustedNode};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "spynode")]
#[command(about = "Watches an untrusted peer for transactions and double spends", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the configured peer and report transactions
    Run(RunArgs),

    /// Manage node configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigCommands,
    },
}

#[derive(clap::Args, Default)]
struct RunArgs {
    /// Config file to use instead of ~/.spynode/config.json
    #[arg(long)]
    config: Option<String>,

    #[arg(long, default_value = "info")]
    log_level: String,

    /// Exit after the first connection ends instead of reconnecting
    #[arg(long)]
    once: bool,

    #[command(flatten)]
    overrides: ConfigOverrides,
}

#[derive(Subcommand)]
enum ConfigCommands {
    View,
    Set { key: String, value: String },
    Init,
}

/// Reports mempool activity to the log.
struct LogListener;

impl Listener for LogListener {
    fn handle_tx(&self, tx: &Transaction) {
        info!(
            "tx {} with {} input(s), {} output(s)",
            tx.txid(),
            tx.inputs.len(),
            tx.outputs.len()
        );
    }

    fn handle_tx_state(&self, state: TxState, txid: &Hash) {
        match state {
            TxState::Unconfirmed => info!("tx {} unconfirmed", txid),
            TxState::Cancelled => warn!("tx {} cancelled by a double spend", txid),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Config { subcommand }) => config_command(subcommand),
        Some(Commands::Run(args)) => run(args).await,
        None => run(RunArgs {
            log_level: "info".to_string(),
            ..RunArgs::default()
        })
        .await,
    }
}

fn config_command(subcommand: ConfigCommands) -> Result<()> {
    match subcommand {
        ConfigCommands::View => Config::load().view(),
        ConfigCommands::Set { key, value } => {
            let mut cfg = Config::load();
            cfg.set_value(&key, &value).map_err(anyhow::Error::msg)?;
            let path = Config::default_path();
            cfg.save_to(&path)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("{} updated in {}", key, path.display());
        }
        ConfigCommands::Init => {
            let path = Config::init_default().context("failed to write default config")?;
            println!("config at {}", path.display());
        }
    }
    Ok(())
}

async fn run(args: RunArgs) -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level)).init();

    let mut cfg = match &args.config {
        Some(path) => Config::load_from(path).with_context(|| format!("failed to load config {}", path))?,
        None => Config::load(),
    };
    args.overrides.apply(&mut cfg);

    let genesis: Hash = cfg
        .genesis_hash
        .parse()
        .with_context(|| format!("invalid genesis hash {}", cfg.genesis_hash))?;

    let peers = Arc::new(MemoryPeerRepository::new());
    let blocks = Arc::new(MemoryBlockRepository::new(genesis));
    let mempool = Arc::new(MemPool::new());
    let node_config = NodeConfig::from(&cfg);
    let reconnect_delay = Duration::from_secs(cfg.reconnect_delay_secs);

    info!("spynode starting, peer {}", cfg.node_address);

    loop {
        let node = Arc::new(UntrustedNode::new(
            cfg.node_address.clone(),
            node_config.clone(),
            peers.clone(),
            blocks.clone(),
            mempool.clone(),
            vec![Arc::new(LogListener)],
            vec![],
        ));

        tokio::select! {
            result = node.run() => {
                if let Err(e) = result {
                    warn!("Node for {} ended: {}", cfg.node_address, e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                node.stop();
                return Ok(());
            }
        }

        info!(
            "Mempool holds {} tx(s), peer score {}",
            mempool.len(),
            peers.score(&cfg.node_address).unwrap_or(0)
        );
        if args.once {
            return Ok(());
        }

        tokio::select! {
            _ = tokio::time::sleep(reconnect_delay) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                return Ok(());
            }
        }
    }
}

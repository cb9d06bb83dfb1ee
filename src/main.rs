use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use bully_consensus::config::Config;
use bully_consensus::network::NetworkManager;
use bully_consensus::node::{self, Node};

/// Bully leader election and per-round agreement over UDP multicast.
#[derive(Debug, Parser)]
#[command(name = "bully-node", version)]
struct Args {
    /// This node's unique, totally ordered identifier within the group.
    #[arg(long)]
    id: u64,

    /// Path to a `KEY = VALUE` timing configuration file. Falls back to
    /// compiled-in defaults if missing.
    #[arg(long, default_value = "config/node.conf")]
    config: PathBuf,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let config = if args.config.exists() {
        match Config::load(&args.config) {
            Ok(c) => c,
            Err(e) => {
                log::error!("failed to load {}: {e}", args.config.display());
                return ExitCode::FAILURE;
            }
        }
    } else {
        log::info!(
            "no configuration file at {}, using compiled defaults",
            args.config.display()
        );
        Config::default()
    };

    if let Err(e) = config.validate() {
        log::error!("configuration rejected: {e}");
        return ExitCode::FAILURE;
    }

    let network = match NetworkManager::bind() {
        Ok(n) => n,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    log::info!("[{}] starting", args.id);
    let node: std::sync::Arc<Node> = Node::new(args.id, config, network);
    node::run(node);
    ExitCode::SUCCESS
}

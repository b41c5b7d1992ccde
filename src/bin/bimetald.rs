// bimetald: the node daemon.
//
// Wires config, store, consensus task, network and the query surface
// together, then waits for ctrl-c. Exit codes: 0 clean shutdown, 64
// configuration error, 70 corrupt chain store.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use bimetal::chain::consensus::ChainController;
use bimetal::config::Config;
use bimetal::net::node::P2PNode;
use bimetal::node::{Node, spawn_consensus};
use bimetal::store::ChainStore;

const EXIT_OK: i32 = 0;
const EXIT_CONFIG: i32 = 64;
const EXIT_CORRUPT_STORE: i32 = 70;

fn banner() {
    println!("bimetald: dual-chain proof-of-work node");
    println!("golden and silver ledgers, one process");
    println!();
}

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    banner();

    let config = match Config::load() {
        Ok(c) => c,
        Err(err) => {
            error!(%err, "configuration error");
            return EXIT_CONFIG;
        }
    };
    let p2p_config = match config.p2p() {
        Ok(c) => c,
        Err(err) => {
            error!(%err, "configuration error");
            return EXIT_CONFIG;
        }
    };

    info!(path = %config.chain_data_path.display(), "opening chain store");
    if let Err(err) = std::fs::create_dir_all(&config.chain_data_path) {
        error!(%err, "cannot create data directory");
        return EXIT_CONFIG;
    }
    let store = match ChainStore::open(&config.chain_data_path) {
        Ok(s) => s,
        Err(err) => {
            error!(%err, "chain store unusable; re-sync required");
            return EXIT_CORRUPT_STORE;
        }
    };
    let controller = match ChainController::open(store, config.consensus()) {
        Ok(c) => c,
        Err(err) => {
            error!(%err, "chain state unusable; re-sync required");
            return EXIT_CORRUPT_STORE;
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (consensus, consensus_join) = spawn_consensus(controller, shutdown_rx.clone());

    for chain in bimetal::primitives::coin::ChainTag::ALL {
        if let Some(tip) = consensus.tip(chain) {
            info!(%chain, height = tip.height, tip = %tip.hash, "chain loaded");
        }
    }

    let (p2p, p2p_handle) = P2PNode::new(p2p_config, consensus.clone(), shutdown_rx.clone());
    let node = Arc::new(Node::new(
        consensus,
        p2p_handle,
        config.mining_timeout(),
        config.mining_workers,
    ));

    let mut p2p_join = Some(tokio::spawn(p2p.run()));

    let exit_code = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => info!("shutdown requested"),
                Err(err) => error!(%err, "signal handler failed"),
            }
            EXIT_OK
        }
        result = p2p_join.as_mut().expect("network task spawned") => {
            p2p_join = None;
            match result {
                Ok(Err(err)) if err.is_fatal() => {
                    error!(%err, "network stopped on fatal storage error");
                    EXIT_CORRUPT_STORE
                }
                Ok(Err(err)) => {
                    error!(%err, "network stopped");
                    EXIT_CONFIG
                }
                _ => EXIT_OK,
            }
        }
    };

    // Orderly shutdown: stop miners, flip the flag, drain tasks
    node.stop_all_mining().await;
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), consensus_join).await;
    if let Some(join) = p2p_join {
        let _ = tokio::time::timeout(Duration::from_secs(5), join).await;
    }
    info!("shutdown complete");
    exit_code
}

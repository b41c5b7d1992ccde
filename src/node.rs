// Node surface
//
// The consensus task is the single writer over chain state: every other
// task sends it commands over one serialized queue and reads published
// snapshots. The Node handle wraps that queue as the format-agnostic
// query/command API callers (RPC layers, CLIs) build on.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::chain::consensus::{
    BlockSelector, ChainController, ChainSnapshot, ProcessOutcome, unix_now,
};
use crate::crypto::hash::Hash;
use crate::error::NodeError;
use crate::net::node::{P2pCommand, P2pHandle};
use crate::net::protocol::{InvItem, Message};
use crate::pow::engine::{PowEngine, SearchOutcome, apply_extranonce};
use crate::primitives::block::{Block, BlockHeader};
use crate::primitives::coin::{ChainTag, CoinKind};
use crate::primitives::transaction::Transaction;
use crate::store::{ChainTip, TxLocator};

/// Housekeeping cadence for the consensus task.
const TICK_INTERVAL: Duration = Duration::from_secs(30);

fn consensus_gone() -> NodeError {
    NodeError::ResourceExhausted("consensus task stopped")
}

pub enum ConsensusCommand {
    ProcessBlock {
        block: Block,
        reply: Option<oneshot::Sender<Result<ProcessOutcome, NodeError>>>,
    },
    SubmitTransaction {
        tx: Transaction,
        reply: oneshot::Sender<Result<Hash, NodeError>>,
    },
    BuildTemplate {
        chain: ChainTag,
        kind: CoinKind,
        reward_script: Vec<u8>,
        reply: oneshot::Sender<Result<Block, NodeError>>,
    },
    GetBlock {
        chain: ChainTag,
        selector: BlockSelector,
        reply: oneshot::Sender<Result<Option<Block>, NodeError>>,
    },
    GetTransaction {
        txid: Hash,
        reply: oneshot::Sender<Result<Option<(TxLocator, Transaction)>, NodeError>>,
    },
    GetMempoolTransaction {
        txid: Hash,
        reply: oneshot::Sender<Option<Transaction>>,
    },
    GetBalance {
        lock_script: Vec<u8>,
        kind: CoinKind,
        reply: oneshot::Sender<u64>,
    },
    HasBlock {
        chain: ChainTag,
        hash: Hash,
        reply: oneshot::Sender<bool>,
    },
    HeadersAfter {
        chain: ChainTag,
        locator: Vec<Hash>,
        stop: Hash,
        limit: usize,
        reply: oneshot::Sender<Vec<BlockHeader>>,
    },
    Locator {
        chain: ChainTag,
        reply: oneshot::Sender<Vec<Hash>>,
    },
}

/// Cheaply cloneable handle to the consensus task.
#[derive(Clone)]
pub struct ConsensusHandle {
    commands: mpsc::Sender<ConsensusCommand>,
    snapshot: watch::Receiver<Arc<ChainSnapshot>>,
}

impl ConsensusHandle {
    /// Latest committed snapshot; never blocks on the consensus task.
    pub fn snapshot(&self) -> Arc<ChainSnapshot> {
        self.snapshot.borrow().clone()
    }

    pub fn tip(&self, chain: ChainTag) -> Option<ChainTip> {
        self.snapshot().tips.get(&chain).copied()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> ConsensusCommand,
    ) -> Result<T, NodeError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| consensus_gone())?;
        rx.await.map_err(|_| consensus_gone())
    }

    pub async fn process_block(&self, block: Block) -> Result<ProcessOutcome, NodeError> {
        self.request(|reply| ConsensusCommand::ProcessBlock {
            block,
            reply: Some(reply),
        })
        .await?
    }

    pub async fn submit_transaction(&self, tx: Transaction) -> Result<Hash, NodeError> {
        self.request(|reply| ConsensusCommand::SubmitTransaction { tx, reply })
            .await?
    }

    pub async fn build_template(
        &self,
        chain: ChainTag,
        kind: CoinKind,
        reward_script: Vec<u8>,
    ) -> Result<Block, NodeError> {
        self.request(|reply| ConsensusCommand::BuildTemplate {
            chain,
            kind,
            reward_script,
            reply,
        })
        .await?
    }

    pub async fn get_block(
        &self,
        chain: ChainTag,
        selector: BlockSelector,
    ) -> Result<Option<Block>, NodeError> {
        self.request(|reply| ConsensusCommand::GetBlock {
            chain,
            selector,
            reply,
        })
        .await?
    }

    pub async fn get_transaction(
        &self,
        txid: Hash,
    ) -> Result<Option<(TxLocator, Transaction)>, NodeError> {
        self.request(|reply| ConsensusCommand::GetTransaction { txid, reply })
            .await?
    }

    pub async fn get_mempool_transaction(&self, txid: Hash) -> Result<Option<Transaction>, NodeError> {
        self.request(|reply| ConsensusCommand::GetMempoolTransaction { txid, reply })
            .await
    }

    pub async fn get_balance(&self, lock_script: Vec<u8>, kind: CoinKind) -> Result<u64, NodeError> {
        self.request(|reply| ConsensusCommand::GetBalance {
            lock_script,
            kind,
            reply,
        })
        .await
    }

    pub async fn has_block(&self, chain: ChainTag, hash: Hash) -> Result<bool, NodeError> {
        self.request(|reply| ConsensusCommand::HasBlock { chain, hash, reply })
            .await
    }

    pub async fn headers_after(
        &self,
        chain: ChainTag,
        locator: Vec<Hash>,
        stop: Hash,
        limit: usize,
    ) -> Result<Vec<BlockHeader>, NodeError> {
        self.request(|reply| ConsensusCommand::HeadersAfter {
            chain,
            locator,
            stop,
            limit,
            reply,
        })
        .await
    }

    pub async fn locator(&self, chain: ChainTag) -> Result<Vec<Hash>, NodeError> {
        self.request(|reply| ConsensusCommand::Locator { chain, reply })
            .await
    }
}

/// Spawn the consensus task around a controller. Returns the command
/// handle; the task exits when the shutdown flag flips or every handle
/// is dropped.
pub fn spawn_consensus(
    mut controller: ChainController,
    mut shutdown: watch::Receiver<bool>,
) -> (ConsensusHandle, tokio::task::JoinHandle<()>) {
    let (commands_tx, mut commands_rx) = mpsc::channel::<ConsensusCommand>(256);
    let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(controller.snapshot()));

    let join = tokio::spawn(async move {
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!(target: "consensus", "consensus task shutting down");
                    break;
                }
                _ = tick.tick() => {
                    if let Err(err) = controller.tick(unix_now()) {
                        warn!(target: "consensus", %err, "housekeeping failed");
                        if err.is_fatal() {
                            break;
                        }
                    }
                }
                cmd = commands_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    let mutated = handle_command(&mut controller, cmd);
                    if mutated {
                        let _ = snapshot_tx.send(Arc::new(controller.snapshot()));
                    }
                }
            }
        }
    });

    (
        ConsensusHandle {
            commands: commands_tx,
            snapshot: snapshot_rx,
        },
        join,
    )
}

/// Returns true when the command may have mutated consensus state.
fn handle_command(controller: &mut ChainController, cmd: ConsensusCommand) -> bool {
    match cmd {
        ConsensusCommand::ProcessBlock { block, reply } => {
            let result = controller.process_block(block);
            if let Err(err) = &result {
                debug!(target: "consensus", %err, "block rejected");
            }
            if let Some(reply) = reply {
                let _ = reply.send(result);
            }
            true
        }
        ConsensusCommand::SubmitTransaction { tx, reply } => {
            let _ = reply.send(controller.submit_transaction(tx));
            true
        }
        ConsensusCommand::BuildTemplate {
            chain,
            kind,
            reward_script,
            reply,
        } => {
            let _ = reply.send(controller.build_template(chain, kind, &reward_script, unix_now()));
            false
        }
        ConsensusCommand::GetBlock {
            chain,
            selector,
            reply,
        } => {
            let _ = reply.send(controller.get_block(chain, selector));
            false
        }
        ConsensusCommand::GetTransaction { txid, reply } => {
            let _ = reply.send(controller.get_transaction(&txid));
            false
        }
        ConsensusCommand::GetMempoolTransaction { txid, reply } => {
            let _ = reply.send(controller.mempool().get(&txid).map(|e| e.tx.clone()));
            false
        }
        ConsensusCommand::GetBalance {
            lock_script,
            kind,
            reply,
        } => {
            let _ = reply.send(controller.get_balance(&lock_script, kind));
            false
        }
        ConsensusCommand::HasBlock { chain, hash, reply } => {
            let _ = reply.send(controller.has_block(chain, &hash));
            false
        }
        ConsensusCommand::HeadersAfter {
            chain,
            locator,
            stop,
            limit,
            reply,
        } => {
            let _ = reply.send(controller.headers_after(chain, &locator, &stop, limit));
            false
        }
        ConsensusCommand::Locator { chain, reply } => {
            let _ = reply.send(controller.locator(chain));
            false
        }
    }
}

/// Opaque handle returned by start_mining.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MiningHandle(u64);

struct MinerTask {
    stop: Arc<AtomicBool>,
    join: tokio::task::JoinHandle<()>,
}

/// The format-agnostic query/command surface of a running node.
pub struct Node {
    consensus: ConsensusHandle,
    p2p: P2pHandle,
    engine: Arc<PowEngine>,
    miners: tokio::sync::Mutex<HashMap<u64, MinerTask>>,
    next_miner: AtomicU64,
    mining_timeout: Duration,
    mining_workers: usize,
}

impl Node {
    pub fn new(
        consensus: ConsensusHandle,
        p2p: P2pHandle,
        mining_timeout: Duration,
        mining_workers: usize,
    ) -> Self {
        Node {
            consensus,
            p2p,
            engine: Arc::new(PowEngine::new()),
            miners: tokio::sync::Mutex::new(HashMap::new()),
            next_miner: AtomicU64::new(1),
            mining_timeout,
            mining_workers: mining_workers.max(1),
        }
    }

    pub fn consensus(&self) -> &ConsensusHandle {
        &self.consensus
    }

    pub async fn get_block(
        &self,
        chain: ChainTag,
        selector: BlockSelector,
    ) -> Result<Option<Block>, NodeError> {
        self.consensus.get_block(chain, selector).await
    }

    pub async fn get_transaction(
        &self,
        txid: Hash,
    ) -> Result<Option<(TxLocator, Transaction)>, NodeError> {
        self.consensus.get_transaction(txid).await
    }

    pub async fn get_balance(&self, address: &[u8], kind: CoinKind) -> Result<u64, NodeError> {
        self.consensus.get_balance(address.to_vec(), kind).await
    }

    pub fn get_mempool_size(&self) -> usize {
        self.consensus.snapshot().mempool_size
    }

    /// Decode and admit an encoded transaction, then gossip it.
    pub async fn submit_transaction(&self, encoded: &[u8]) -> Result<Hash, NodeError> {
        let tx = Transaction::decode_all(encoded).map_err(NodeError::Encoding)?;
        let txid = self.consensus.submit_transaction(tx).await?;
        // Gossip on both chains; peers fetch from whichever they track
        for chain in ChainTag::ALL {
            self.p2p
                .broadcast(Message::Inv(vec![InvItem::tx(chain, txid)]))
                .await;
        }
        Ok(txid)
    }

    pub async fn add_peer(&self, address: std::net::SocketAddr) -> Result<(), NodeError> {
        self.p2p
            .command(P2pCommand::Connect(address))
            .await
            .map_err(|_| NodeError::ResourceExhausted("network task stopped"))
    }

    pub async fn list_peers(&self) -> Vec<crate::net::node::PeerSummary> {
        self.p2p.list_peers().await
    }

    /// Launch a mining supervisor for one chain/coin pair. Solved blocks
    /// re-enter consensus exactly like blocks from the network.
    pub async fn start_mining(
        &self,
        chain: ChainTag,
        kind: CoinKind,
        reward_script: Vec<u8>,
    ) -> Result<MiningHandle, NodeError> {
        if !kind.is_mineable() {
            return Err(NodeError::TxInvalid(format!("{kind} is not mineable")));
        }
        let id = self.next_miner.fetch_add(1, Ordering::SeqCst);
        let stop = Arc::new(AtomicBool::new(false));
        let task_stop = Arc::clone(&stop);
        let consensus = self.consensus.clone();
        let p2p = self.p2p.clone();
        let engine = Arc::clone(&self.engine);
        let timeout = self.mining_timeout;
        let workers = self.mining_workers;

        let join = tokio::spawn(async move {
            info!(target: "miner", %chain, %kind, "mining started");
            while !task_stop.load(Ordering::Relaxed) {
                let template = match consensus
                    .build_template(chain, kind, reward_script.clone())
                    .await
                {
                    Ok(t) => t,
                    Err(err) => {
                        warn!(target: "miner", %err, "template build failed");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };

                let multiplier = kind.mining_difficulty_multiplier();
                let search_stop = Arc::clone(&task_stop);
                let search_engine = Arc::clone(&engine);
                let search_template = template.clone();
                let outcome = tokio::task::spawn_blocking(move || {
                    search_engine.mine(
                        &search_template,
                        multiplier,
                        workers,
                        timeout,
                        &search_stop,
                    )
                })
                .await;

                match outcome {
                    Ok(Ok(SearchOutcome::Found {
                        extranonce, nonce, ..
                    })) => {
                        let mut block = template;
                        if apply_extranonce(&mut block, extranonce).is_err() {
                            continue;
                        }
                        block.header.merkle_root =
                            Block::compute_merkle_root(&block.transactions);
                        block.header.nonce = nonce;
                        let hash = block.hash();
                        match consensus.process_block(block).await {
                            Ok(outcome) => {
                                info!(target: "miner", %chain, %hash, disposition = ?outcome.disposition, "mined block submitted");
                                p2p.broadcast(Message::Inv(vec![InvItem::block(chain, hash)]))
                                    .await;
                            }
                            Err(err) => {
                                warn!(target: "miner", %hash, %err, "mined block rejected");
                            }
                        }
                    }
                    Ok(Ok(SearchOutcome::Cancelled)) => break,
                    Ok(Ok(SearchOutcome::Timeout)) => {
                        debug!(target: "miner", %chain, "search timed out; rebuilding template");
                    }
                    Ok(Ok(SearchOutcome::Exhausted)) => {
                        debug!(target: "miner", %chain, "nonce space exhausted; rebuilding template");
                    }
                    Ok(Err(err)) => {
                        warn!(target: "miner", %err, "search failed");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                    Err(_) => break,
                }
            }
            info!(target: "miner", %chain, %kind, "mining stopped");
        });

        self.miners
            .lock()
            .await
            .insert(id, MinerTask { stop, join });
        Ok(MiningHandle(id))
    }

    /// Stop a mining supervisor; waits briefly for the workers to wind
    /// down.
    pub async fn stop_mining(&self, handle: MiningHandle) -> Result<(), NodeError> {
        let Some(task) = self.miners.lock().await.remove(&handle.0) else {
            return Err(NodeError::TxInvalid("unknown mining handle".into()));
        };
        task.stop.store(true, Ordering::Relaxed);
        if tokio::time::timeout(Duration::from_secs(2), task.join)
            .await
            .is_err()
        {
            // Workers observe the flag between hashes; this is a backstop
            warn!(target: "miner", "mining task did not stop in time");
        }
        Ok(())
    }

    /// Stop all miners, e.g. during shutdown.
    pub async fn stop_all_mining(&self) {
        let handles: Vec<u64> = self.miners.lock().await.keys().copied().collect();
        for id in handles {
            let _ = self.stop_mining(MiningHandle(id)).await;
        }
    }
}

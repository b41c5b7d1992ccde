// Consensus orchestrator
//
// Single entry point for new blocks. Everything before the fork-manager
// handoff is side-effect-free; a failure returns a typed error and leaves
// no state behind. Connects and reorgs write one atomic store batch, then
// update the in-memory fork tree, UTXO set and mempool. Only the
// consensus task calls into this type.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use rocksdb::WriteBatch;
use tracing::{debug, info, warn};

use crate::chain::fork::{Acceptance, ChainEvent, ForkManager, OrphanPool};
use crate::chain::genesis::genesis_block;
use crate::chain::reward::subsidy;
use crate::chain::utxo::{BlockUndo, UndoOp, UtxoMap, UtxoSet};
use crate::chain::validate::{
    self, TxContext, TxFees, check_structure, coinbase_mined_kind, validate_coinbase,
    validate_transaction,
};
use crate::crypto::hash::Hash;
use crate::error::NodeError;
use crate::net::mempool::{Mempool, MempoolConfig, MempoolError};
use crate::pow::engine::validate_header_pow;
use crate::pow::retarget::windowed_retarget;
use crate::pow::target::{block_work, compact_to_target, max_target, min_target};
use crate::primitives::block::{Block, BlockHeader, MAX_BLOCK_SIZE, MAX_BLOCK_WEIGHT};
use crate::primitives::coin::{ChainTag, CoinKind};
use crate::primitives::transaction::Transaction;
use crate::store::{ChainStore, ChainTip, StoreError, TxLocator};

pub const DEFAULT_ORPHAN_CAPACITY: usize = 256;
pub const DEFAULT_FINALITY_DEPTH: u64 = 100;
pub const MAX_FUTURE_DRIFT_SECS: i64 = 2 * 60 * 60;

/// Weight reserved for the coinbase when assembling templates.
const COINBASE_WEIGHT_RESERVE: u64 = 4_000;

#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    pub retarget_interval: u64,
    pub target_block_time_secs: u64,
    pub min_fee_per_weight: u64,
    pub finality_depth: u64,
    pub orphan_capacity: usize,
    /// Keep at least this many recent blocks when pruning; 0 disables.
    pub min_retained: u64,
    pub mempool: MempoolConfig,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        ConsensusConfig {
            retarget_interval: crate::pow::retarget::DEFAULT_RETARGET_INTERVAL,
            target_block_time_secs: crate::pow::retarget::DEFAULT_TARGET_BLOCK_TIME_SECS,
            min_fee_per_weight: 0,
            finality_depth: DEFAULT_FINALITY_DEPTH,
            orphan_capacity: DEFAULT_ORPHAN_CAPACITY,
            min_retained: 0,
            mempool: MempoolConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockDisposition {
    Connected,
    SideChained,
    Reorganized {
        disconnected: usize,
        connected: usize,
    },
    Orphaned,
    Duplicate,
}

#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub hash: Hash,
    pub disposition: BlockDisposition,
    /// Connect/Disconnect events in exactly the order they were applied,
    /// including events from orphans released by this block.
    pub events: Vec<(ChainTag, ChainEvent)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSelector {
    Latest,
    Height(u64),
    Id(Hash),
}

/// Read-only view published after every commit.
#[derive(Debug, Clone)]
pub struct ChainSnapshot {
    pub tips: HashMap<ChainTag, ChainTip>,
    pub utxos: Arc<UtxoMap>,
    pub mempool_size: usize,
    pub mempool_bytes: usize,
}

struct JournalEntry {
    undo: BlockUndo,
    /// Net new supply the block's coinbase issued, per capped kind.
    issuance: Vec<(CoinKind, u64)>,
}

struct PerChain {
    forks: ForkManager,
    headers: HashMap<Hash, BlockHeader>,
    /// Full blocks on side branches, kept until promoted or discarded.
    side_blocks: HashMap<Hash, Block>,
    journal: Vec<JournalEntry>,
    /// Outstanding supply per capped kind.
    supply: BTreeMap<CoinKind, u64>,
}

impl PerChain {
    fn outstanding(&self, kind: CoinKind) -> u64 {
        self.supply.get(&kind).copied().unwrap_or(0)
    }
}

pub struct ChainController {
    store: ChainStore,
    config: ConsensusConfig,
    utxo: UtxoSet,
    golden: PerChain,
    silver: PerChain,
    orphans: OrphanPool,
    mempool: Mempool,
}

fn supply_state_key(kind: CoinKind) -> [u8; 7] {
    let mut k = *b"supply\0";
    k[6] = kind.as_u8();
    k
}

impl ChainController {
    /// Open the store, creating per-chain genesis blocks on first start,
    /// and rebuild the in-memory indexes.
    pub fn open(store: ChainStore, config: ConsensusConfig) -> Result<Self, NodeError> {
        let mut utxo = UtxoSet::from_entries(store.load_utxos()?);
        let mut chains = Vec::new();

        for chain in ChainTag::ALL {
            let per_chain = match store.get_tip(chain)? {
                None => Self::init_genesis(&store, &mut utxo, chain)?,
                Some(tip) => Self::reload_chain(&store, chain, tip)?,
            };
            chains.push(per_chain);
        }

        let mut it = chains.into_iter();
        Ok(ChainController {
            store,
            orphans: OrphanPool::new(config.orphan_capacity),
            mempool: Mempool::new(config.mempool),
            config,
            utxo,
            golden: it.next().expect("golden state"),
            silver: it.next().expect("silver state"),
        })
    }

    fn init_genesis(
        store: &ChainStore,
        utxo: &mut UtxoSet,
        chain: ChainTag,
    ) -> Result<PerChain, NodeError> {
        let block = genesis_block(chain);
        let hash = block.hash();
        let target = compact_to_target(block.header.bits)
            .ok_or_else(|| NodeError::StorageCorrupt("bad genesis bits".into()))?;
        let work = block_work(target);

        let undo = utxo
            .apply(&block)
            .ok_or_else(|| NodeError::StorageCorrupt("genesis apply failed".into()))?;

        let mut batch = WriteBatch::default();
        store.put_block_batch(&mut batch, &block)?;
        store.put_tip_batch(
            &mut batch,
            chain,
            &ChainTip {
                hash,
                height: 0,
                work,
            },
        )?;
        Self::stage_utxo_ops(store, &mut batch, utxo, &undo)?;
        store.commit(batch)?;
        info!(target: "consensus", %chain, %hash, "created genesis block");

        let mut headers = HashMap::new();
        headers.insert(hash, block.header);
        Ok(PerChain {
            forks: ForkManager::new(hash, work),
            headers,
            side_blocks: HashMap::new(),
            journal: vec![JournalEntry {
                undo,
                issuance: Vec::new(),
            }],
            supply: BTreeMap::new(),
        })
    }

    fn reload_chain(
        store: &ChainStore,
        chain: ChainTag,
        tip: ChainTip,
    ) -> Result<PerChain, NodeError> {
        let mut hashes = Vec::with_capacity(tip.height as usize + 1);
        let mut works = Vec::with_capacity(tip.height as usize + 1);
        let mut headers = HashMap::new();
        let mut cumulative = primitive_types::U256::zero();

        for height in 0..=tip.height {
            let block = store.get_block_by_height(chain, height)?.ok_or_else(|| {
                NodeError::StorageCorrupt(format!("missing {chain} block at height {height}"))
            })?;
            let target = compact_to_target(block.header.bits).ok_or_else(|| {
                NodeError::StorageCorrupt(format!("bad bits in stored {chain} block {height}"))
            })?;
            cumulative = cumulative.saturating_add(block_work(target));
            let hash = block.hash();
            hashes.push(hash);
            works.push(cumulative);
            headers.insert(hash, block.header);
        }

        let last = *hashes.last().expect("tip height checked");
        if last != tip.hash {
            return Err(NodeError::StorageCorrupt(format!(
                "{chain} tip {} does not match block at height {}",
                tip.hash, tip.height
            )));
        }

        let mut supply = BTreeMap::new();
        for kind in CoinKind::ALL {
            if kind.supply_cap().is_none() {
                continue;
            }
            if let Some(raw) = store.get_state(chain, &supply_state_key(kind))? {
                let arr: [u8; 8] = raw
                    .as_slice()
                    .try_into()
                    .map_err(|_| NodeError::StorageCorrupt("bad supply record".into()))?;
                supply.insert(kind, u64::from_le_bytes(arr));
            }
        }

        Ok(PerChain {
            forks: ForkManager::from_main_chain(hashes, works),
            headers,
            side_blocks: HashMap::new(),
            journal: Vec::new(),
            supply,
        })
    }

    fn chain(&self, tag: ChainTag) -> &PerChain {
        match tag {
            ChainTag::Golden => &self.golden,
            ChainTag::Silver => &self.silver,
        }
    }

    fn chain_mut(&mut self, tag: ChainTag) -> &mut PerChain {
        match tag {
            ChainTag::Golden => &mut self.golden,
            ChainTag::Silver => &mut self.silver,
        }
    }

    // ========== QUERIES ==========

    pub fn tip(&self, chain: ChainTag) -> ChainTip {
        let state = self.chain(chain);
        ChainTip {
            hash: state.forks.tip(),
            height: state.forks.tip_height(),
            work: state.forks.tip_work(),
        }
    }

    pub fn snapshot(&self) -> ChainSnapshot {
        let mut tips = HashMap::new();
        for chain in ChainTag::ALL {
            tips.insert(chain, self.tip(chain));
        }
        ChainSnapshot {
            tips,
            utxos: self.utxo.snapshot(),
            mempool_size: self.mempool.len(),
            mempool_bytes: self.mempool.total_bytes(),
        }
    }

    pub fn get_block(
        &self,
        chain: ChainTag,
        selector: BlockSelector,
    ) -> Result<Option<Block>, NodeError> {
        let block = match selector {
            BlockSelector::Latest => {
                let height = self.chain(chain).forks.tip_height();
                self.store.get_block_by_height(chain, height)?
            }
            BlockSelector::Height(height) => self.store.get_block_by_height(chain, height)?,
            BlockSelector::Id(hash) => self.store.get_block_by_id(chain, &hash)?,
        };
        Ok(block)
    }

    pub fn get_transaction(
        &self,
        txid: &Hash,
    ) -> Result<Option<(TxLocator, Transaction)>, NodeError> {
        Ok(self.store.get_transaction(txid)?)
    }

    pub fn get_balance(&self, lock_script: &[u8], kind: CoinKind) -> u64 {
        self.utxo.balance(lock_script, kind)
    }

    pub fn mempool_size(&self) -> usize {
        self.mempool.len()
    }

    pub fn utxo_set(&self) -> &UtxoSet {
        &self.utxo
    }

    pub fn mempool(&self) -> &Mempool {
        &self.mempool
    }

    /// Hashes the sync protocol serves for a getheaders locator.
    pub fn headers_after(
        &self,
        chain: ChainTag,
        locator: &[Hash],
        stop: &Hash,
        limit: usize,
    ) -> Vec<BlockHeader> {
        let state = self.chain(chain);
        // First locator hash found on our main chain wins
        let mut start_height = 0;
        for hash in locator {
            if state.forks.is_on_main(hash) {
                start_height = state.forks.height_of(hash).unwrap_or(0) + 1;
                break;
            }
        }
        let mut out = Vec::new();
        for height in start_height..=state.forks.tip_height() {
            let Some(hash) = state.forks.main_hash_at(height) else {
                break;
            };
            let Some(header) = state.headers.get(&hash) else {
                break;
            };
            out.push(*header);
            if out.len() >= limit || hash == *stop {
                break;
            }
        }
        out
    }

    pub fn locator(&self, chain: ChainTag) -> Vec<Hash> {
        self.chain(chain).forks.locator()
    }

    pub fn has_block(&self, chain: ChainTag, hash: &Hash) -> bool {
        self.chain(chain).forks.contains(hash) || self.orphans.contains(hash)
    }

    // ========== BLOCK PROCESSING ==========

    pub fn process_block(&mut self, block: Block) -> Result<ProcessOutcome, NodeError> {
        self.process_block_at(block, unix_now())
    }

    pub fn process_block_at(&mut self, block: Block, now: i64) -> Result<ProcessOutcome, NodeError> {
        let hash = block.hash();
        let chain = block.header.chain;

        if self.chain(chain).forks.contains(&hash) || self.orphans.contains(&hash) {
            return Ok(ProcessOutcome {
                hash,
                disposition: BlockDisposition::Duplicate,
                events: Vec::new(),
            });
        }

        // Side-effect-free validation pipeline
        self.check_block_sanity(&block, now)?;

        let parent = block.header.previous_hash;
        if !self.chain(chain).forks.contains(&parent) {
            debug!(target: "consensus", %chain, %hash, %parent, "orphan buffered");
            self.orphans.insert(block);
            return Ok(ProcessOutcome {
                hash,
                disposition: BlockDisposition::Orphaned,
                events: Vec::new(),
            });
        }

        let (disposition, mut events) = self.accept_block(&block, now)?;

        // Release any orphans waiting on the newly accepted block; each
        // recursive call releases its own descendants in turn.
        if !matches!(disposition, BlockDisposition::Duplicate) {
            for child in self.orphans.take_children(&hash) {
                let child_hash = child.hash();
                match self.process_block_at(child, now) {
                    Ok(outcome) => events.extend(outcome.events),
                    Err(err) => {
                        warn!(target: "consensus", %child_hash, %err, "released orphan rejected");
                    }
                }
            }
        }

        Ok(ProcessOutcome {
            hash,
            disposition,
            events,
        })
    }

    fn check_block_sanity(&self, block: &Block, now: i64) -> Result<(), NodeError> {
        let hash = block.hash();
        let invalid = |reason: &str| NodeError::BlockInvalid {
            hash,
            reason: reason.to_string(),
        };

        if block.transactions.is_empty() {
            return Err(invalid("no transactions"));
        }
        if !block.transactions[0].is_coinbase() {
            return Err(invalid("first transaction is not a coinbase"));
        }
        if block.transactions[1..].iter().any(Transaction::is_coinbase) {
            return Err(invalid("more than one coinbase"));
        }

        let mut txids = HashSet::with_capacity(block.transactions.len());
        for tx in &block.transactions {
            if !txids.insert(tx.txid()) {
                return Err(invalid("duplicate transaction"));
            }
        }

        if block.serialized_size() > MAX_BLOCK_SIZE {
            return Err(invalid("block exceeds maximum size"));
        }
        if block.weight() > MAX_BLOCK_WEIGHT {
            return Err(invalid("block exceeds maximum weight"));
        }

        if block.header.timestamp > now + MAX_FUTURE_DRIFT_SECS {
            return Err(invalid("timestamp too far in the future"));
        }

        if block.header.merkle_root != Block::compute_merkle_root(&block.transactions) {
            return Err(invalid("merkle root mismatch"));
        }

        let target = compact_to_target(block.header.bits).ok_or_else(|| invalid("bad bits"))?;
        if target > max_target() || target < min_target() {
            return Err(invalid("target out of range"));
        }

        let mined = coinbase_mined_kind(&block.transactions[0])
            .map_err(|e| invalid(&e.to_string()))?;
        let multiplier = mined.map_or(1, CoinKind::mining_difficulty_multiplier);
        if !validate_header_pow(&block.header, multiplier) {
            return Err(invalid("proof of work below required difficulty"));
        }
        Ok(())
    }

    fn required_bits_at(&self, chain: ChainTag, parent: &Hash, height: u64) -> Result<u32, NodeError> {
        let state = self.chain(chain);
        let parent_header = state
            .headers
            .get(parent)
            .ok_or_else(|| NodeError::StorageCorrupt("parent header missing".into()))?;
        if height == 0 || !height.is_multiple_of(self.config.retarget_interval) {
            return Ok(parent_header.bits);
        }
        // Walk back to the first block of the closed window
        let first_height = height - self.config.retarget_interval;
        let mut cursor = *parent_header;
        while cursor.height > first_height {
            cursor = *state
                .headers
                .get(&cursor.previous_hash)
                .ok_or_else(|| NodeError::StorageCorrupt("window header missing".into()))?;
        }
        Ok(windowed_retarget(
            parent_header.bits,
            cursor.timestamp,
            parent_header.timestamp,
            self.config.retarget_interval,
            self.config.target_block_time_secs,
        ))
    }

    fn accept_block(
        &mut self,
        block: &Block,
        now: i64,
    ) -> Result<(BlockDisposition, Vec<(ChainTag, ChainEvent)>), NodeError> {
        let hash = block.hash();
        let chain = block.header.chain;
        let parent = block.header.previous_hash;
        let invalid = |reason: &str| NodeError::BlockInvalid {
            hash,
            reason: reason.to_string(),
        };

        let state = self.chain(chain);
        let parent_height = state
            .forks
            .height_of(&parent)
            .ok_or_else(|| invalid("unknown parent"))?;
        if block.header.height != parent_height + 1 {
            return Err(invalid("height does not follow parent"));
        }

        let required = self.required_bits_at(chain, &parent, block.header.height)?;
        if block.header.bits != required {
            return Err(invalid("difficulty does not match retarget schedule"));
        }

        let target = compact_to_target(block.header.bits).ok_or_else(|| invalid("bad bits"))?;
        let work = block_work(target);

        match self.chain(chain).forks.classify(&hash, &parent, work) {
            Acceptance::Duplicate => Ok((BlockDisposition::Duplicate, Vec::new())),
            Acceptance::UnknownParent => Err(invalid("unknown parent")),
            Acceptance::Extended => {
                self.connect_extend(block, work)?;
                info!(target: "consensus", %chain, %hash, height = block.header.height, "block connected");
                Ok((
                    BlockDisposition::Connected,
                    vec![(chain, ChainEvent::Connect(hash))],
                ))
            }
            Acceptance::SideChain => {
                let state = self.chain_mut(chain);
                state.forks.record_side(hash, parent, work);
                state.headers.insert(hash, block.header);
                state.side_blocks.insert(hash, block.clone());
                debug!(target: "consensus", %chain, %hash, "side-chain block recorded");
                Ok((BlockDisposition::SideChained, Vec::new()))
            }
            Acceptance::Reorg {
                disconnect,
                connect,
            } => {
                let (d, c) = (disconnect.len(), connect.len());
                let events = self.execute_reorg(block, work, disconnect, connect, now)?;
                info!(target: "consensus", %chain, %hash, disconnected = d, connected = c, "reorganized");
                Ok((
                    BlockDisposition::Reorganized {
                        disconnected: d,
                        connected: c,
                    },
                    events,
                ))
            }
        }
    }

    /// Validate a block's transactions in order against the evolving
    /// UTXO set and apply them. On failure the set is restored and the
    /// error returned. Nothing is written to the store here; the caller
    /// owns the batch.
    fn validate_and_apply(&mut self, block: &Block) -> Result<JournalEntry, NodeError> {
        let hash = block.hash();
        let chain = block.header.chain;
        let height = block.header.height;
        let ctx = TxContext {
            chain,
            height,
            timestamp: block.header.timestamp,
            min_fee_per_weight: self.config.min_fee_per_weight,
        };

        let mut undo = BlockUndo::new(hash, chain, height);
        let mut fees = TxFees::default();

        for tx in &block.transactions[1..] {
            let tx_fees = match validate_transaction(tx, &self.utxo, &ctx) {
                Ok(f) => f,
                Err(err) => {
                    self.utxo.undo(&undo);
                    return Err(NodeError::TxInvalid(err.to_string()));
                }
            };
            fees.absorb(&tx_fees);
            if !self.utxo.apply_tx(tx, chain, height, &mut undo) {
                self.utxo.undo(&undo);
                return Err(NodeError::TxInvalid("input vanished mid-block".into()));
            }
        }

        let coinbase = &block.transactions[0];
        let state = self.chain(chain);
        if let Err(err) = validate_coinbase(coinbase, height, &fees, |k| state.outstanding(k)) {
            self.utxo.undo(&undo);
            return Err(NodeError::BlockInvalid {
                hash,
                reason: err.to_string(),
            });
        }
        if !self.utxo.apply_tx(coinbase, chain, height, &mut undo) {
            self.utxo.undo(&undo);
            return Err(NodeError::BlockInvalid {
                hash,
                reason: "coinbase application failed".into(),
            });
        }

        // Net new supply per capped kind
        let mut issuance = Vec::new();
        for kind in CoinKind::ALL {
            if kind.supply_cap().is_none() {
                continue;
            }
            let minted: u64 = coinbase
                .outputs
                .iter()
                .filter(|o| o.kind == kind)
                .map(|o| o.value)
                .sum();
            let net = minted.saturating_sub(fees.of(kind));
            if net > 0 {
                issuance.push((kind, net));
            }
        }

        Ok(JournalEntry { undo, issuance })
    }

    /// Mirror the final in-memory state of every outpoint a journal entry
    /// touched into the batch. Called only after the in-memory set
    /// reflects the outcome, so one rule covers connects and disconnects:
    /// present → put, absent → delete.
    fn stage_utxo_ops(
        store: &ChainStore,
        batch: &mut WriteBatch,
        utxo: &UtxoSet,
        undo: &BlockUndo,
    ) -> Result<(), StoreError> {
        for op in &undo.ops {
            let outpoint = match op {
                UndoOp::Created(outpoint) => outpoint,
                UndoOp::Spent(outpoint, _) => outpoint,
            };
            match utxo.get(outpoint) {
                Some(entry) => store.put_utxo_batch(batch, outpoint, entry)?,
                None => store.delete_utxo_batch(batch, outpoint)?,
            }
        }
        Ok(())
    }

    fn stage_supply(
        &self,
        batch: &mut WriteBatch,
        chain: ChainTag,
        supply: &BTreeMap<CoinKind, u64>,
    ) -> Result<(), StoreError> {
        for (kind, amount) in supply {
            self.store
                .put_state_batch(batch, chain, &supply_state_key(*kind), &amount.to_le_bytes())?;
        }
        Ok(())
    }

    fn connect_extend(&mut self, block: &Block, work: primitive_types::U256) -> Result<(), NodeError> {
        let hash = block.hash();
        let chain = block.header.chain;
        let entry = self.validate_and_apply(block)?;

        let mut batch = WriteBatch::default();
        if let Err(e) = self.stage_connect(&mut batch, block, &entry, work) {
            self.utxo.undo(&entry.undo);
            return Err(e.into());
        }
        if let Err(e) = self.store.commit(batch) {
            self.utxo.undo(&entry.undo);
            return Err(e.into());
        }

        let finality_depth = self.config.finality_depth;
        let state = self.chain_mut(chain);
        for (kind, net) in &entry.issuance {
            *state.supply.entry(*kind).or_insert(0) += net;
        }
        state.forks.record_extend(hash, work);
        state.headers.insert(hash, block.header);
        state.journal.push(entry);
        Self::prune_journal(state, finality_depth);

        self.mempool.block_connected(&block.transactions);
        Ok(())
    }

    /// Stage block rows, utxo deltas, supply and tip into `batch`.
    fn stage_connect(
        &self,
        batch: &mut WriteBatch,
        block: &Block,
        entry: &JournalEntry,
        work: primitive_types::U256,
    ) -> Result<(), StoreError> {
        let chain = block.header.chain;
        self.store.put_block_batch(batch, block)?;
        Self::stage_utxo_ops(&self.store, batch, &self.utxo, &entry.undo)?;

        let mut supply = self.chain(chain).supply.clone();
        for (kind, net) in &entry.issuance {
            *supply.entry(*kind).or_insert(0) += net;
        }
        self.stage_supply(batch, chain, &supply)?;

        let parent_work = self
            .chain(chain)
            .forks
            .work_of(&block.header.previous_hash)
            .unwrap_or_default();
        self.store.put_tip_batch(
            batch,
            chain,
            &ChainTip {
                hash: block.hash(),
                height: block.header.height,
                work: parent_work.saturating_add(work),
            },
        )?;
        Ok(())
    }

    fn prune_journal(state: &mut PerChain, finality_depth: u64) {
        let tip_height = state.forks.tip_height();
        while let Some(first) = state.journal.first() {
            if tip_height.saturating_sub(first.undo.height) > finality_depth {
                state.journal.remove(0);
            } else {
                break;
            }
        }
    }

    fn execute_reorg(
        &mut self,
        new_block: &Block,
        new_work: primitive_types::U256,
        disconnect: Vec<Hash>,
        connect: Vec<Hash>,
        now: i64,
    ) -> Result<Vec<(ChainTag, ChainEvent)>, NodeError> {
        let chain = new_block.header.chain;
        let new_hash = new_block.hash();

        // Record the triggering block on its branch first so the branch
        // lists and promote() see a consistent tree.
        {
            let state = self.chain_mut(chain);
            state
                .forks
                .record_side(new_hash, new_block.header.previous_hash, new_work);
            state.headers.insert(new_hash, new_block.header);
            state.side_blocks.insert(new_hash, new_block.clone());
        }

        // Fetch everything we are about to detach before touching state
        let mut detached: Vec<(Block, JournalEntry)> = Vec::new();
        for d in &disconnect {
            let block = self
                .store
                .get_block_by_id(chain, d)?
                .ok_or_else(|| NodeError::StorageCorrupt(format!("missing main block {d}")))?;
            let entry = match self.chain_mut(chain).journal.pop() {
                Some(e) if e.undo.block_hash == *d => e,
                _ => {
                    // Re-push nothing; a reorg deeper than the journal
                    // cannot be unwound.
                    self.rollback_reorg(chain, &mut detached, &mut Vec::new());
                    self.chain_mut(chain).forks.remove_branch(&new_hash);
                    return Err(NodeError::StorageCorrupt(
                        "reorganization deeper than the spend journal".into(),
                    ));
                }
            };
            self.utxo.undo(&entry.undo);
            for (kind, net) in &entry.issuance {
                if let Some(v) = self.chain_mut(chain).supply.get_mut(kind) {
                    *v = v.saturating_sub(*net);
                }
            }
            detached.push((block, entry));
        }

        // Connect the branch ancestor-first
        let mut applied: Vec<(Block, JournalEntry)> = Vec::new();
        for c in &connect {
            let block = if *c == new_hash {
                new_block.clone()
            } else {
                match self.chain(chain).side_blocks.get(c) {
                    Some(b) => b.clone(),
                    None => {
                        self.rollback_reorg(chain, &mut detached, &mut applied);
                        self.chain_mut(chain).forks.remove_branch(&new_hash);
                        return Err(NodeError::StorageCorrupt(format!(
                            "side block {c} not available for reorg"
                        )));
                    }
                }
            };
            match self.validate_and_apply(&block) {
                Ok(entry) => {
                    // Supply moves with the UTXO set so later branch
                    // blocks validate against the running totals
                    let state = self.chain_mut(chain);
                    for (kind, net) in &entry.issuance {
                        *state.supply.entry(*kind).or_insert(0) += net;
                    }
                    applied.push((block, entry));
                }
                Err(err) => {
                    warn!(target: "consensus", %chain, block = %c, %err, "reorg branch invalid");
                    self.rollback_reorg(chain, &mut detached, &mut applied);
                    self.chain_mut(chain).forks.remove_branch(&new_hash);
                    let state = self.chain_mut(chain);
                    for hash in &connect {
                        state.side_blocks.remove(hash);
                    }
                    return Err(err);
                }
            }
        }

        // One atomic batch for the whole reorganization
        let mut batch = WriteBatch::default();
        // record_side above registered the branch tip's cumulative work
        let branch_tip_work = self.chain(chain).forks.work_of(&new_hash).unwrap_or_default();
        let staged: Result<(), StoreError> = (|| {
            for (block, entry) in &detached {
                self.store.delete_block_batch(&mut batch, block)?;
                Self::stage_utxo_ops(&self.store, &mut batch, &self.utxo, &entry.undo)?;
            }
            for (block, entry) in &applied {
                self.store.put_block_batch(&mut batch, block)?;
                Self::stage_utxo_ops(&self.store, &mut batch, &self.utxo, &entry.undo)?;
            }
            self.stage_supply(&mut batch, chain, &self.chain(chain).supply)?;
            self.store.put_tip_batch(
                &mut batch,
                chain,
                &ChainTip {
                    hash: new_hash,
                    height: new_block.header.height,
                    work: branch_tip_work,
                },
            )?;
            Ok(())
        })();
        if let Err(e) = staged {
            self.rollback_reorg(chain, &mut detached, &mut applied);
            self.chain_mut(chain).forks.remove_branch(&new_hash);
            return Err(e.into());
        }
        if let Err(e) = self.store.commit(batch) {
            self.rollback_reorg(chain, &mut detached, &mut applied);
            self.chain_mut(chain).forks.remove_branch(&new_hash);
            return Err(e.into());
        }

        // Commit the in-memory bookkeeping
        {
            let state = self.chain_mut(chain);
            state.forks.promote(&new_hash);
            for (block, _) in &applied {
                state.side_blocks.remove(&block.hash());
            }
            // The displaced main suffix is reachable again as a branch
            for (block, _) in &detached {
                state.side_blocks.insert(block.hash(), block.clone());
            }
        }

        // Events in application order: disconnects tip-first, connects
        // ancestor-first.
        let mut events = Vec::with_capacity(disconnect.len() + connect.len());
        for d in &disconnect {
            events.push((chain, ChainEvent::Disconnect(*d)));
        }
        for c in &connect {
            events.push((chain, ChainEvent::Connect(*c)));
        }

        // Mempool maintenance: drop what the branch confirmed, then give
        // the displaced transactions a second chance at the new tip.
        let mut displaced: Vec<Transaction> = Vec::new();
        for (block, _) in &detached {
            self.mempool.block_connected(&block.transactions);
            for tx in &block.transactions[1..] {
                displaced.push(tx.clone());
            }
        }
        for (block, _) in &applied {
            self.mempool.block_connected(&block.transactions);
        }

        // Move journal entries over and prune
        {
            let finality_depth = self.config.finality_depth;
            let state = self.chain_mut(chain);
            for (_, entry) in applied.into_iter() {
                state.journal.push(entry);
            }
            Self::prune_journal(state, finality_depth);
        }

        let tip_height = self.chain(chain).forks.tip_height();
        for tx in displaced {
            let ctx = TxContext {
                chain,
                height: tip_height + 1,
                timestamp: now,
                min_fee_per_weight: self.config.min_fee_per_weight,
            };
            if let Ok(fees) = validate_transaction(&tx, &self.utxo, &ctx) {
                self.mempool.readmit(tx, chain, fees.total(), now);
            }
        }

        Ok(events)
    }

    /// Restore UTXO, journal and supply to the pre-reorg state.
    fn rollback_reorg(
        &mut self,
        chain: ChainTag,
        detached: &mut Vec<(Block, JournalEntry)>,
        applied: &mut Vec<(Block, JournalEntry)>,
    ) {
        // Unwind branch connects newest-first
        for (_, entry) in applied.drain(..).rev() {
            self.utxo.undo(&entry.undo);
            let state = self.chain_mut(chain);
            for (kind, net) in &entry.issuance {
                if let Some(v) = state.supply.get_mut(kind) {
                    *v = v.saturating_sub(*net);
                }
            }
        }
        // Re-apply the displaced main blocks ancestor-first
        for (block, entry) in detached.drain(..).rev() {
            let redo = self
                .utxo
                .apply(&block)
                .expect("re-applying a previously connected block cannot fail");
            debug_assert_eq!(redo.ops.len(), entry.undo.ops.len());
            let state = self.chain_mut(chain);
            for (kind, net) in &entry.issuance {
                *state.supply.entry(*kind).or_insert(0) += net;
            }
            state.journal.push(JournalEntry {
                undo: redo,
                issuance: entry.issuance,
            });
        }
    }

    // ========== TRANSACTIONS ==========

    pub fn submit_transaction(&mut self, tx: Transaction) -> Result<Hash, NodeError> {
        self.submit_transaction_at(tx, unix_now())
    }

    pub fn submit_transaction_at(&mut self, tx: Transaction, now: i64) -> Result<Hash, NodeError> {
        check_structure(&tx).map_err(|e| NodeError::TxInvalid(e.to_string()))?;
        if tx.is_coinbase() {
            return Err(NodeError::TxInvalid("bare coinbase not accepted".into()));
        }

        let mut last_err: Option<validate::TxError> = None;
        for chain in ChainTag::ALL {
            let ctx = TxContext {
                chain,
                height: self.chain(chain).forks.tip_height() + 1,
                timestamp: now,
                min_fee_per_weight: self.config.min_fee_per_weight,
            };
            match validate_transaction(&tx, &self.utxo, &ctx) {
                Ok(fees) => {
                    let total = fees.total();
                    return self
                        .mempool
                        .insert(tx, chain, total, now)
                        .map_err(|e| match e {
                            MempoolError::Full => {
                                NodeError::ResourceExhausted("mempool full")
                            }
                            other => NodeError::TxInvalid(other.to_string()),
                        });
                }
                Err(err) => last_err = Some(err),
            }
        }
        Err(NodeError::TxInvalid(
            last_err.map_or_else(|| "invalid".to_string(), |e| e.to_string()),
        ))
    }

    // ========== MINING SUPPORT ==========

    /// Assemble a candidate block paying subsidy and fees to
    /// `reward_script`, ready for the PoW engine (extranonce reserved).
    pub fn build_template(
        &self,
        chain: ChainTag,
        kind: CoinKind,
        reward_script: &[u8],
        now: i64,
    ) -> Result<Block, NodeError> {
        if !kind.is_mineable() {
            return Err(NodeError::TxInvalid(format!("{kind} is not mineable")));
        }
        let state = self.chain(chain);
        let parent = state.forks.tip();
        let height = state.forks.tip_height() + 1;
        let bits = self.required_bits_at(chain, &parent, height)?;

        let ctx = TxContext {
            chain,
            height,
            timestamp: now,
            min_fee_per_weight: self.config.min_fee_per_weight,
        };

        let budget = MAX_BLOCK_WEIGHT as u64 - COINBASE_WEIGHT_RESERVE;
        let mut fees = TxFees::default();
        let mut included = Vec::new();
        for entry in self.mempool.select(chain, budget) {
            // The pool was validated at admission; re-check against the
            // current tip so stale entries never enter a template.
            match validate_transaction(&entry.tx, &self.utxo, &ctx) {
                Ok(f) => {
                    fees.absorb(&f);
                    included.push(entry.tx);
                }
                Err(_) => continue,
            }
        }

        let mut unlock_script = height.to_le_bytes().to_vec();
        crate::pow::engine::reserve_extranonce(&mut unlock_script);
        let mut outputs = vec![crate::primitives::transaction::TxOutput {
            value: subsidy(kind, height) + fees.of(kind),
            kind,
            lock_script: reward_script.to_vec(),
        }];
        for (fee_kind, amount) in &fees.by_kind {
            if *fee_kind == kind {
                continue;
            }
            outputs.push(crate::primitives::transaction::TxOutput {
                value: *amount,
                kind: *fee_kind,
                lock_script: reward_script.to_vec(),
            });
        }
        let coinbase = Transaction {
            version: 1,
            inputs: vec![crate::primitives::transaction::TxInput {
                previous_output: crate::primitives::transaction::OutPoint::COINBASE,
                unlock_script,
                sequence: 0,
            }],
            outputs,
            lock_time: 0,
            witness: vec![],
        };

        let mut transactions = vec![coinbase];
        transactions.extend(included);
        let header = BlockHeader {
            version: 1,
            previous_hash: parent,
            merkle_root: Block::compute_merkle_root(&transactions),
            timestamp: now,
            bits,
            nonce: 0,
            height,
            chain,
        };
        Ok(Block {
            header,
            transactions,
        })
    }

    // ========== MAINTENANCE ==========

    /// Periodic housekeeping: replay-window expiry and block pruning.
    pub fn tick(&mut self, now: i64) -> Result<(), NodeError> {
        self.mempool.expire_seen(now);
        if self.config.min_retained > 0 {
            for chain in ChainTag::ALL {
                let state = self.chain(chain);
                let tip_height = state.forks.tip_height();
                let mut floor = tip_height.saturating_sub(self.config.min_retained);
                if let Some(root) = state.forks.deepest_side_root_height() {
                    floor = floor.min(root);
                }
                if floor > 0 {
                    let pruned = self.store.prune_below(chain, floor)?;
                    if pruned > 0 {
                        debug!(target: "consensus", %chain, pruned, floor, "pruned blocks");
                    }
                }
            }
        }
        Ok(())
    }
}

pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

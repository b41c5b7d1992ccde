// UTXO set and spend journal
//
// Single-writer: only the consensus task mutates the set. Readers take
// Arc snapshots of the underlying map; the writer goes through
// Arc::make_mut, so a snapshot taken before a connect stays valid and
// unchanged afterwards. Every connect appends to an ordered op journal;
// undoing replays the ops in reverse, which keeps chained spends inside
// one block exact.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::crypto::hash::Hash;
use crate::primitives::block::Block;
use crate::primitives::coin::{ChainTag, CoinKind};
use crate::primitives::transaction::{OutPoint, Transaction};

pub use crate::store::StoredUtxo as UtxoEntry;

pub type UtxoMap = HashMap<OutPoint, UtxoEntry>;

/// One reversible mutation of the set, in application order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoOp {
    Created(OutPoint),
    Spent(OutPoint, UtxoEntry),
}

/// Per-block journal entry: every op a connect performed, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockUndo {
    pub block_hash: Hash,
    pub chain: ChainTag,
    pub height: u64,
    pub ops: Vec<UndoOp>,
}

impl BlockUndo {
    pub fn new(block_hash: Hash, chain: ChainTag, height: u64) -> Self {
        BlockUndo {
            block_hash,
            chain,
            height,
            ops: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct UtxoSet {
    entries: Arc<UtxoMap>,
    /// lock script → outpoints, maintained for balance queries
    by_script: HashMap<Vec<u8>, HashSet<OutPoint>>,
}

impl UtxoSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted entries at startup.
    pub fn from_entries(entries: impl IntoIterator<Item = (OutPoint, UtxoEntry)>) -> Self {
        let mut set = UtxoSet::new();
        for (op, entry) in entries {
            set.insert(op, entry);
        }
        set
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, outpoint: &OutPoint) -> Option<&UtxoEntry> {
        self.entries.get(outpoint)
    }

    pub fn contains(&self, outpoint: &OutPoint) -> bool {
        self.entries.contains_key(outpoint)
    }

    /// Cheap copy-on-write snapshot; stays valid across later connects.
    pub fn snapshot(&self) -> Arc<UtxoMap> {
        Arc::clone(&self.entries)
    }

    /// Sum of unspent value locked to `script` in `kind`.
    pub fn balance(&self, script: &[u8], kind: CoinKind) -> u64 {
        let Some(points) = self.by_script.get(script) else {
            return 0;
        };
        points
            .iter()
            .filter_map(|op| self.entries.get(op))
            .filter(|e| e.kind == kind)
            .map(|e| e.value)
            .sum()
    }

    fn insert(&mut self, outpoint: OutPoint, entry: UtxoEntry) {
        self.by_script
            .entry(entry.lock_script.clone())
            .or_default()
            .insert(outpoint);
        Arc::make_mut(&mut self.entries).insert(outpoint, entry);
    }

    fn remove(&mut self, outpoint: &OutPoint) -> Option<UtxoEntry> {
        let removed = Arc::make_mut(&mut self.entries).remove(outpoint)?;
        if let Some(points) = self.by_script.get_mut(&removed.lock_script) {
            points.remove(outpoint);
            if points.is_empty() {
                self.by_script.remove(&removed.lock_script);
            }
        }
        Some(removed)
    }

    /// Apply one already-validated transaction, appending its ops to the
    /// journal entry. Returns false (with the partial ops rolled back by
    /// the caller via `undo`) if an input is unexpectedly absent.
    pub fn apply_tx(
        &mut self,
        tx: &Transaction,
        chain: ChainTag,
        height: u64,
        undo: &mut BlockUndo,
    ) -> bool {
        let coinbase = tx.is_coinbase();
        if !coinbase {
            for input in &tx.inputs {
                let op = input.previous_output;
                match self.remove(&op) {
                    Some(entry) => undo.ops.push(UndoOp::Spent(op, entry)),
                    None => return false,
                }
            }
        }
        let txid = tx.txid();
        for (vout, output) in tx.outputs.iter().enumerate() {
            let op = OutPoint::new(txid, vout as u32);
            self.insert(
                op,
                UtxoEntry {
                    value: output.value,
                    kind: output.kind,
                    lock_script: output.lock_script.clone(),
                    height,
                    coinbase,
                    chain,
                },
            );
            undo.ops.push(UndoOp::Created(op));
        }
        true
    }

    /// Apply a validated block: spend every input, create every output.
    /// On an unexpectedly missing input the partial application is rolled
    /// back and None is returned.
    pub fn apply(&mut self, block: &Block) -> Option<BlockUndo> {
        let chain = block.header.chain;
        let height = block.header.height;
        let mut undo = BlockUndo::new(block.hash(), chain, height);

        for tx in &block.transactions {
            if !self.apply_tx(tx, chain, height, &mut undo) {
                self.undo(&undo);
                return None;
            }
        }
        Some(undo)
    }

    /// Reverse a connect exactly by replaying its ops backwards.
    pub fn undo(&mut self, undo: &BlockUndo) {
        for op in undo.ops.iter().rev() {
            match op {
                UndoOp::Created(outpoint) => {
                    self.remove(outpoint);
                }
                UndoOp::Spent(outpoint, entry) => {
                    self.insert(*outpoint, entry.clone());
                }
            }
        }
    }
}

// Transaction Mempool
//
// In-memory pool of validated unconfirmed transactions, ordered by
// fee-per-weight for block assembly. Admission is checked by the
// consensus task before insertion; the pool owns bookkeeping: duplicate
// and conflict detection, capacity eviction, and a time-indexed replay
// window that rejects re-introductions of recently seen txids.

use std::collections::{BTreeSet, HashMap, VecDeque};

use crate::crypto::hash::Hash;
use crate::primitives::coin::ChainTag;
use crate::primitives::transaction::{OutPoint, Transaction};

pub const DEFAULT_MAX_COUNT: usize = 5_000;
pub const DEFAULT_MAX_BYTES: usize = 8_000_000;
pub const DEFAULT_REPLAY_WINDOW_SECS: i64 = 24 * 60 * 60;

/// Scale factor for deterministic integer fee-rate comparison.
const FEE_RATE_SCALE: u64 = 10_000;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MempoolError {
    #[error("duplicate transaction")]
    Duplicate,
    #[error("transaction seen within the replay window")]
    Replay,
    #[error("input {0} already spent by a pooled transaction")]
    Conflict(OutPoint),
    #[error("mempool full")]
    Full,
}

#[derive(Debug, Clone)]
pub struct MempoolEntry {
    pub tx: Transaction,
    pub txid: Hash,
    pub chain: ChainTag,
    pub fee: u64,
    pub weight: u64,
    /// fee * 10000 / weight, so ordering never touches floats
    pub fee_per_weight_scaled: u64,
    pub arrival: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct MempoolConfig {
    pub max_count: usize,
    pub max_bytes: usize,
    pub replay_window_secs: i64,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        MempoolConfig {
            max_count: DEFAULT_MAX_COUNT,
            max_bytes: DEFAULT_MAX_BYTES,
            replay_window_secs: DEFAULT_REPLAY_WINDOW_SECS,
        }
    }
}

#[derive(Debug)]
pub struct Mempool {
    config: MempoolConfig,
    entries: HashMap<Hash, MempoolEntry>,
    /// (scaled feerate, txid) ascending; block assembly walks it backwards
    by_feerate: BTreeSet<(u64, Hash)>,
    /// outpoint → spending txid, for double-spend rejection in the pool
    spends: HashMap<OutPoint, Hash>,
    /// txid → first-seen time, bounded by the replay window
    seen: HashMap<Hash, i64>,
    seen_order: VecDeque<(i64, Hash)>,
    total_bytes: usize,
}

impl Mempool {
    pub fn new(config: MempoolConfig) -> Self {
        Mempool {
            config,
            entries: HashMap::new(),
            by_feerate: BTreeSet::new(),
            spends: HashMap::new(),
            seen: HashMap::new(),
            seen_order: VecDeque::new(),
            total_bytes: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn contains(&self, txid: &Hash) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn get(&self, txid: &Hash) -> Option<&MempoolEntry> {
        self.entries.get(txid)
    }

    /// Admit a transaction the consensus task has already validated.
    pub fn insert(
        &mut self,
        tx: Transaction,
        chain: ChainTag,
        fee: u64,
        now: i64,
    ) -> Result<Hash, MempoolError> {
        let txid = tx.txid();
        if self.entries.contains_key(&txid) {
            return Err(MempoolError::Duplicate);
        }
        if let Some(first_seen) = self.seen.get(&txid)
            && now - first_seen < self.config.replay_window_secs
        {
            return Err(MempoolError::Replay);
        }
        self.admit(tx, txid, chain, fee, now)?;
        self.seen.insert(txid, now);
        self.seen_order.push_back((now, txid));
        Ok(txid)
    }

    /// Insertion without the replay gate, used when a disconnected
    /// block's transactions return to the pool.
    pub fn readmit(&mut self, tx: Transaction, chain: ChainTag, fee: u64, now: i64) {
        let txid = tx.txid();
        if self.entries.contains_key(&txid) {
            return;
        }
        let _ = self.admit(tx, txid, chain, fee, now);
    }

    fn admit(
        &mut self,
        tx: Transaction,
        txid: Hash,
        chain: ChainTag,
        fee: u64,
        now: i64,
    ) -> Result<(), MempoolError> {
        for input in &tx.inputs {
            if let Some(spender) = self.spends.get(&input.previous_output) {
                if *spender != txid {
                    return Err(MempoolError::Conflict(input.previous_output));
                }
            }
        }

        let size = tx.total_size();
        let weight = tx.weight() as u64;
        let fee_per_weight_scaled = fee.saturating_mul(FEE_RATE_SCALE) / weight.max(1);

        // Capacity: evict the cheapest entries, but never to admit
        // something cheaper than what would be evicted.
        while self.entries.len() >= self.config.max_count
            || self.total_bytes + size > self.config.max_bytes
        {
            let Some(&(lowest_rate, lowest_txid)) = self.by_feerate.iter().next() else {
                return Err(MempoolError::Full);
            };
            if lowest_rate >= fee_per_weight_scaled {
                return Err(MempoolError::Full);
            }
            self.remove_entry(&lowest_txid);
        }

        for input in &tx.inputs {
            self.spends.insert(input.previous_output, txid);
        }
        self.by_feerate.insert((fee_per_weight_scaled, txid));
        self.total_bytes += size;
        self.entries.insert(
            txid,
            MempoolEntry {
                tx,
                txid,
                chain,
                fee,
                weight,
                fee_per_weight_scaled,
                arrival: now,
            },
        );
        Ok(())
    }

    fn remove_entry(&mut self, txid: &Hash) -> Option<MempoolEntry> {
        let entry = self.entries.remove(txid)?;
        self.by_feerate
            .remove(&(entry.fee_per_weight_scaled, entry.txid));
        for input in &entry.tx.inputs {
            if self.spends.get(&input.previous_output) == Some(txid) {
                self.spends.remove(&input.previous_output);
            }
        }
        self.total_bytes -= entry.tx.total_size();
        Some(entry)
    }

    /// A block connected: drop its transactions and anything now in
    /// conflict with the outputs it spent.
    pub fn block_connected(&mut self, transactions: &[Transaction]) {
        for tx in transactions {
            self.remove_entry(&tx.txid());
        }
        for tx in transactions {
            if tx.is_coinbase() {
                continue;
            }
            for input in &tx.inputs {
                if let Some(spender) = self.spends.get(&input.previous_output).copied() {
                    self.remove_entry(&spender);
                }
            }
        }
    }

    /// Highest-feerate transactions for `chain` fitting `max_weight`.
    pub fn select(&self, chain: ChainTag, max_weight: u64) -> Vec<MempoolEntry> {
        let mut picked = Vec::new();
        let mut used = 0u64;
        for (_, txid) in self.by_feerate.iter().rev() {
            let entry = &self.entries[txid];
            if entry.chain != chain {
                continue;
            }
            if used + entry.weight > max_weight {
                continue;
            }
            used += entry.weight;
            picked.push(entry.clone());
        }
        picked
    }

    /// Drop replay-window records older than the window.
    pub fn expire_seen(&mut self, now: i64) {
        while let Some((t, txid)) = self.seen_order.front().copied() {
            if now - t < self.config.replay_window_secs {
                break;
            }
            self.seen_order.pop_front();
            // Only drop the record if no newer sighting refreshed it
            if self.seen.get(&txid) == Some(&t) {
                self.seen.remove(&txid);
            }
        }
    }

    pub fn txids(&self) -> Vec<Hash> {
        self.entries.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash::sha256d;
    use crate::primitives::coin::CoinKind;
    use crate::primitives::transaction::{TxInput, TxOutput};

    fn tx_spending(seed: u8, vout: u32, fee_hint: u64) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint::new(sha256d(&[seed]), vout),
                unlock_script: vec![seed; 72],
                sequence: 0,
            }],
            outputs: vec![TxOutput {
                value: 1000 - fee_hint,
                kind: CoinKind::Leah,
                lock_script: vec![0x01; 32],
            }],
            lock_time: 0,
            witness: vec![],
        }
    }

    fn pool() -> Mempool {
        Mempool::new(MempoolConfig::default())
    }

    #[test]
    fn test_insert_and_duplicate() {
        let mut p = pool();
        let tx = tx_spending(1, 0, 10);
        let txid = p.insert(tx.clone(), ChainTag::Golden, 10, 0).unwrap();
        assert_eq!(p.len(), 1);
        // Idempotence: the second submission leaves exactly one entry
        assert_eq!(
            p.insert(tx, ChainTag::Golden, 10, 1),
            Err(MempoolError::Duplicate)
        );
        assert_eq!(p.len(), 1);
        assert!(p.contains(&txid));
    }

    #[test]
    fn test_replay_window_rejects_after_removal() {
        let mut p = pool();
        let tx = tx_spending(1, 0, 10);
        p.insert(tx.clone(), ChainTag::Golden, 10, 0).unwrap();
        p.block_connected(std::slice::from_ref(&tx));
        assert!(p.is_empty());

        // Within the window: rejected even though it left the pool
        assert_eq!(
            p.insert(tx.clone(), ChainTag::Golden, 10, 100),
            Err(MempoolError::Replay)
        );

        // Past the window: admitted again
        let later = DEFAULT_REPLAY_WINDOW_SECS + 1;
        p.expire_seen(later);
        assert!(p.insert(tx, ChainTag::Golden, 10, later).is_ok());
    }

    #[test]
    fn test_conflicting_spend_rejected() {
        let mut p = pool();
        let a = tx_spending(1, 0, 10);
        let mut b = tx_spending(2, 0, 20);
        b.inputs[0].previous_output = a.inputs[0].previous_output;

        p.insert(a, ChainTag::Golden, 10, 0).unwrap();
        let err = p.insert(b, ChainTag::Golden, 20, 0).unwrap_err();
        assert!(matches!(err, MempoolError::Conflict(_)));
        assert_eq!(p.len(), 1);
    }

    #[test]
    fn test_selection_orders_by_feerate() {
        let mut p = pool();
        p.insert(tx_spending(1, 0, 1), ChainTag::Golden, 10, 0)
            .unwrap();
        p.insert(tx_spending(2, 0, 1), ChainTag::Golden, 500, 0)
            .unwrap();
        p.insert(tx_spending(3, 0, 1), ChainTag::Golden, 200, 0)
            .unwrap();
        p.insert(tx_spending(4, 0, 1), ChainTag::Silver, 900, 0)
            .unwrap();

        let picked = p.select(ChainTag::Golden, u64::MAX);
        assert_eq!(picked.len(), 3);
        assert!(picked[0].fee >= picked[1].fee);
        assert!(picked[1].fee >= picked[2].fee);
        // The silver transaction is not offered for golden blocks
        assert!(picked.iter().all(|e| e.chain == ChainTag::Golden));
    }

    #[test]
    fn test_capacity_evicts_lowest_feerate() {
        let mut p = Mempool::new(MempoolConfig {
            max_count: 2,
            ..Default::default()
        });
        p.insert(tx_spending(1, 0, 1), ChainTag::Golden, 10, 0)
            .unwrap();
        p.insert(tx_spending(2, 0, 1), ChainTag::Golden, 50, 0)
            .unwrap();
        let third = tx_spending(3, 0, 1);
        let third_id = third.txid();
        p.insert(third, ChainTag::Golden, 100, 0).unwrap();

        assert_eq!(p.len(), 2);
        assert!(p.contains(&third_id));
        // The cheapest (fee 10) was evicted
        let fees: Vec<u64> = p.entries.values().map(|e| e.fee).collect();
        assert!(!fees.contains(&10));
    }

    #[test]
    fn test_cheaper_than_floor_is_rejected_when_full() {
        let mut p = Mempool::new(MempoolConfig {
            max_count: 1,
            ..Default::default()
        });
        p.insert(tx_spending(1, 0, 1), ChainTag::Golden, 100, 0)
            .unwrap();
        assert_eq!(
            p.insert(tx_spending(2, 0, 1), ChainTag::Golden, 1, 0),
            Err(MempoolError::Full)
        );
    }

    #[test]
    fn test_block_connected_removes_conflicts() {
        let mut p = pool();
        let pooled = tx_spending(1, 0, 10);
        p.insert(pooled.clone(), ChainTag::Golden, 10, 0).unwrap();

        // A confirmed transaction spends the same outpoint
        let mut confirmed = tx_spending(9, 0, 10);
        confirmed.inputs[0].previous_output = pooled.inputs[0].previous_output;
        p.block_connected(&[confirmed]);
        assert!(p.is_empty());
    }

    #[test]
    fn test_readmit_bypasses_replay_gate() {
        let mut p = pool();
        let tx = tx_spending(1, 0, 10);
        p.insert(tx.clone(), ChainTag::Golden, 10, 0).unwrap();
        p.block_connected(std::slice::from_ref(&tx));

        p.readmit(tx.clone(), ChainTag::Golden, 10, 5);
        assert_eq!(p.len(), 1);
        assert!(p.contains(&tx.txid()));
    }
}

// Persistent chain store on RocksDB
//
// Design principles:
// 1. Durability - WAL enabled, sync on every committed batch
// 2. Atomicity - one WriteBatch spans all column families a block touches
// 3. Crash recovery - automatic via the RocksDB WAL
//
// Column families:
// - "{chain}_blocks" : height[8] BE → canonical block bytes
//                      (big-endian keys so iteration order is height order)
// - "{chain}_index"  : block hash[32] → height[8] BE
// - "{chain}_state"  : free-form keys → tip hash, tip height, work, supply
// - "txs"            : txid[32] → locator (chain, height, index) + tx bytes
// - "utxo"           : txid[32]+vout[4] → UTXO entry bytes (both chains)

use std::path::Path;
use std::sync::Arc;

use rocksdb::{ColumnFamilyDescriptor, DB, Options, WriteBatch};

use primitive_types::U256;

use crate::crypto::hash::Hash;
use crate::primitives::block::Block;
use crate::primitives::codec::{self, Reader};
use crate::primitives::coin::{ChainTag, CoinKind};
use crate::primitives::transaction::{OutPoint, Transaction};
use crate::pow::target::{work_from_bytes, work_to_bytes};

const CF_TXS: &str = "txs";
const CF_UTXO: &str = "utxo";

// State bucket keys
pub const KEY_TIP: &[u8] = b"tip";
pub const KEY_TIP_HEIGHT: &[u8] = b"tip_height";
pub const KEY_WORK: &[u8] = b"work";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("rocksdb: {0}")]
    RocksDb(#[from] rocksdb::Error),
    #[error("chain store corrupt: {0}")]
    Corruption(&'static str),
}

/// Where a stored transaction lives on a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxLocator {
    pub chain: ChainTag,
    pub height: u64,
    pub index: u32,
}

/// Persisted per-chain head state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainTip {
    pub hash: Hash,
    pub height: u64,
    pub work: U256,
}

/// A UTXO as persisted in the "utxo" column family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredUtxo {
    pub value: u64,
    pub kind: CoinKind,
    pub lock_script: Vec<u8>,
    pub height: u64,
    pub coinbase: bool,
    pub chain: ChainTag,
}

impl StoredUtxo {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut b = Vec::with_capacity(16 + self.lock_script.len());
        codec::write_u64(&mut b, self.value);
        b.push(self.kind.as_u8());
        codec::write_bytes(&mut b, &self.lock_script);
        codec::write_u64(&mut b, self.height);
        b.push(u8::from(self.coinbase));
        b.push(self.chain.as_u8());
        b
    }

    pub fn from_bytes(d: &[u8]) -> Result<Self, &'static str> {
        let mut r = Reader::new(d);
        let value = r.read_u64()?;
        let kind = CoinKind::from_u8(r.read_u8()?)?;
        let lock_script = r.read_bytes(crate::primitives::transaction::MAX_SCRIPT_SIZE)?;
        let height = r.read_u64()?;
        let coinbase = match r.read_u8()? {
            0 => false,
            1 => true,
            _ => return Err("bad coinbase flag"),
        };
        let chain = ChainTag::from_u8(r.read_u8()?)?;
        if !r.is_empty() {
            return Err("trailing bytes in utxo entry");
        }
        Ok(StoredUtxo {
            value,
            kind,
            lock_script,
            height,
            coinbase,
            chain,
        })
    }
}

fn cf_blocks(chain: ChainTag) -> &'static str {
    match chain {
        ChainTag::Golden => "golden_blocks",
        ChainTag::Silver => "silver_blocks",
    }
}

fn cf_index(chain: ChainTag) -> &'static str {
    match chain {
        ChainTag::Golden => "golden_index",
        ChainTag::Silver => "silver_index",
    }
}

fn cf_state(chain: ChainTag) -> &'static str {
    match chain {
        ChainTag::Golden => "golden_state",
        ChainTag::Silver => "silver_state",
    }
}

fn utxo_key(outpoint: &OutPoint) -> [u8; 36] {
    let mut k = [0u8; 36];
    k[..32].copy_from_slice(outpoint.txid.as_bytes());
    k[32..].copy_from_slice(&outpoint.vout.to_le_bytes());
    k
}

/// Main database handle.
#[derive(Clone)]
pub struct ChainStore {
    db: Arc<DB>,
}

impl ChainStore {
    /// Open or create the store with settings tuned for chain workloads.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        // Write buffer settings - tuned for ten-minute blocks
        opts.set_write_buffer_size(64 * 1024 * 1024);
        opts.set_max_write_buffer_number(3);
        opts.set_min_write_buffer_number_to_merge(1);

        opts.set_target_file_size_base(64 * 1024 * 1024);
        opts.set_max_bytes_for_level_base(256 * 1024 * 1024);

        // LZ4: hash-heavy values compress poorly but tx scripts do fine
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let cache = rocksdb::Cache::new_lru_cache(256 * 1024 * 1024);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_block_cache(&cache);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        // WAL settings - critical for crash recovery
        opts.set_wal_bytes_per_sync(1024 * 1024);
        opts.set_max_total_wal_size(128 * 1024 * 1024);

        opts.set_level_compaction_dynamic_level_bytes(true);
        opts.set_max_background_jobs(4);

        let mut cfs = Vec::new();
        for chain in ChainTag::ALL {
            cfs.push(ColumnFamilyDescriptor::new(cf_blocks(chain), opts.clone()));
            cfs.push(ColumnFamilyDescriptor::new(cf_index(chain), opts.clone()));
            cfs.push(ColumnFamilyDescriptor::new(cf_state(chain), opts.clone()));
        }
        cfs.push(ColumnFamilyDescriptor::new(CF_TXS, opts.clone()));
        cfs.push(ColumnFamilyDescriptor::new(CF_UTXO, opts.clone()));

        let db = DB::open_cf_descriptors(&opts, path, cfs)?;
        Ok(ChainStore { db: Arc::new(db) })
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or(StoreError::Corruption("column family not found"))
    }

    /// Commit a batch atomically with fsync. Either every write in the
    /// batch survives a crash or none does.
    pub fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = rocksdb::WriteOptions::default();
        write_opts.set_sync(true);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    // ========== BLOCK OPERATIONS ==========

    /// Stage a block plus its hash index and transaction records.
    pub fn put_block_batch(&self, batch: &mut WriteBatch, block: &Block) -> Result<(), StoreError> {
        let chain = block.header.chain;
        let height_key = block.header.height.to_be_bytes();
        let hash = block.hash();

        batch.put_cf(self.cf(cf_blocks(chain))?, height_key, block.encode());
        batch.put_cf(self.cf(cf_index(chain))?, hash.as_bytes(), height_key);

        let cf_txs = self.cf(CF_TXS)?;
        for (index, tx) in block.transactions.iter().enumerate() {
            let mut value = Vec::new();
            value.push(chain.as_u8());
            codec::write_u64(&mut value, block.header.height);
            codec::write_u32(&mut value, index as u32);
            value.extend_from_slice(&tx.encode(true));
            batch.put_cf(cf_txs, tx.txid().as_bytes(), value);
        }
        Ok(())
    }

    /// Stage removal of a block (disconnect or prune).
    pub fn delete_block_batch(
        &self,
        batch: &mut WriteBatch,
        block: &Block,
    ) -> Result<(), StoreError> {
        let chain = block.header.chain;
        batch.delete_cf(
            self.cf(cf_blocks(chain))?,
            block.header.height.to_be_bytes(),
        );
        batch.delete_cf(self.cf(cf_index(chain))?, block.hash().as_bytes());
        let cf_txs = self.cf(CF_TXS)?;
        for tx in &block.transactions {
            batch.delete_cf(cf_txs, tx.txid().as_bytes());
        }
        Ok(())
    }

    pub fn get_block_by_height(
        &self,
        chain: ChainTag,
        height: u64,
    ) -> Result<Option<Block>, StoreError> {
        match self
            .db
            .get_cf(self.cf(cf_blocks(chain))?, height.to_be_bytes())?
        {
            Some(raw) => {
                let block =
                    Block::decode(&raw).map_err(|_| StoreError::Corruption("bad block bytes"))?;
                Ok(Some(block))
            }
            None => Ok(None),
        }
    }

    pub fn get_height_of(&self, chain: ChainTag, hash: &Hash) -> Result<Option<u64>, StoreError> {
        match self.db.get_cf(self.cf(cf_index(chain))?, hash.as_bytes())? {
            Some(raw) => {
                let arr: [u8; 8] = raw
                    .as_slice()
                    .try_into()
                    .map_err(|_| StoreError::Corruption("bad height index entry"))?;
                Ok(Some(u64::from_be_bytes(arr)))
            }
            None => Ok(None),
        }
    }

    pub fn get_block_by_id(&self, chain: ChainTag, hash: &Hash) -> Result<Option<Block>, StoreError> {
        match self.get_height_of(chain, hash)? {
            Some(height) => {
                // The index may briefly outlive the block row during a
                // reorg batch; verify identity before returning.
                match self.get_block_by_height(chain, height)? {
                    Some(block) if block.hash() == *hash => Ok(Some(block)),
                    _ => Ok(None),
                }
            }
            None => Ok(None),
        }
    }

    // ========== TRANSACTION OPERATIONS ==========

    pub fn get_transaction(
        &self,
        txid: &Hash,
    ) -> Result<Option<(TxLocator, Transaction)>, StoreError> {
        let Some(raw) = self.db.get_cf(self.cf(CF_TXS)?, txid.as_bytes())? else {
            return Ok(None);
        };
        let mut r = Reader::new(&raw);
        let mut parse = || -> Result<(TxLocator, Transaction), &'static str> {
            let chain = ChainTag::from_u8(r.read_u8()?)?;
            let height = r.read_u64()?;
            let index = r.read_u32()?;
            let tx = Transaction::decode(&mut r)?;
            Ok((
                TxLocator {
                    chain,
                    height,
                    index,
                },
                tx,
            ))
        };
        parse()
            .map(Some)
            .map_err(|_| StoreError::Corruption("bad tx record"))
    }

    // ========== STATE OPERATIONS ==========

    pub fn put_state_batch(
        &self,
        batch: &mut WriteBatch,
        chain: ChainTag,
        key: &[u8],
        value: &[u8],
    ) -> Result<(), StoreError> {
        batch.put_cf(self.cf(cf_state(chain))?, key, value);
        Ok(())
    }

    pub fn get_state(&self, chain: ChainTag, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.db.get_cf(self.cf(cf_state(chain))?, key)?)
    }

    pub fn put_tip_batch(
        &self,
        batch: &mut WriteBatch,
        chain: ChainTag,
        tip: &ChainTip,
    ) -> Result<(), StoreError> {
        self.put_state_batch(batch, chain, KEY_TIP, tip.hash.as_bytes())?;
        self.put_state_batch(batch, chain, KEY_TIP_HEIGHT, &tip.height.to_le_bytes())?;
        self.put_state_batch(batch, chain, KEY_WORK, &work_to_bytes(tip.work))?;
        Ok(())
    }

    pub fn get_tip(&self, chain: ChainTag) -> Result<Option<ChainTip>, StoreError> {
        let Some(hash_raw) = self.get_state(chain, KEY_TIP)? else {
            return Ok(None);
        };
        let hash_arr: [u8; 32] = hash_raw
            .as_slice()
            .try_into()
            .map_err(|_| StoreError::Corruption("bad tip hash length"))?;

        let height_raw = self
            .get_state(chain, KEY_TIP_HEIGHT)?
            .ok_or(StoreError::Corruption("tip without height"))?;
        let height_arr: [u8; 8] = height_raw
            .as_slice()
            .try_into()
            .map_err(|_| StoreError::Corruption("bad tip height length"))?;

        let work_raw = self
            .get_state(chain, KEY_WORK)?
            .ok_or(StoreError::Corruption("tip without work"))?;
        let work =
            work_from_bytes(&work_raw).ok_or(StoreError::Corruption("bad work length"))?;

        Ok(Some(ChainTip {
            hash: Hash(hash_arr),
            height: u64::from_le_bytes(height_arr),
            work,
        }))
    }

    // ========== UTXO OPERATIONS ==========

    pub fn put_utxo_batch(
        &self,
        batch: &mut WriteBatch,
        outpoint: &OutPoint,
        utxo: &StoredUtxo,
    ) -> Result<(), StoreError> {
        batch.put_cf(self.cf(CF_UTXO)?, utxo_key(outpoint), utxo.to_bytes());
        Ok(())
    }

    pub fn delete_utxo_batch(
        &self,
        batch: &mut WriteBatch,
        outpoint: &OutPoint,
    ) -> Result<(), StoreError> {
        batch.delete_cf(self.cf(CF_UTXO)?, utxo_key(outpoint));
        Ok(())
    }

    /// Load the whole UTXO set, e.g. to rebuild in-memory indexes at start.
    pub fn load_utxos(&self) -> Result<Vec<(OutPoint, StoredUtxo)>, StoreError> {
        let cf = self.cf(CF_UTXO)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(cf, rocksdb::IteratorMode::Start) {
            let (key, value) = item?;
            if key.len() != 36 {
                return Err(StoreError::Corruption("bad utxo key length"));
            }
            let mut txid = [0u8; 32];
            txid.copy_from_slice(&key[..32]);
            let vout = u32::from_le_bytes(key[32..36].try_into().unwrap());
            let utxo = StoredUtxo::from_bytes(&value)
                .map_err(|_| StoreError::Corruption("bad utxo entry"))?;
            out.push((OutPoint::new(Hash(txid), vout), utxo));
        }
        Ok(out)
    }

    // ========== PRUNING ==========

    /// Delete blocks in height order strictly below `floor`. The caller
    /// lowers `floor` to the deepest side-chain root first, so an
    /// ancestor of an active side tip is never removed.
    pub fn prune_below(&self, chain: ChainTag, floor: u64) -> Result<u64, StoreError> {
        let cf = self.cf(cf_blocks(chain))?;
        let mut doomed = Vec::new();
        for item in self.db.iterator_cf(cf, rocksdb::IteratorMode::Start) {
            let (key, value) = item?;
            let arr: [u8; 8] = key
                .as_ref()
                .try_into()
                .map_err(|_| StoreError::Corruption("bad block key length"))?;
            let height = u64::from_be_bytes(arr);
            if height >= floor {
                break;
            }
            let block =
                Block::decode(&value).map_err(|_| StoreError::Corruption("bad block bytes"))?;
            doomed.push(block);
        }

        let pruned = doomed.len() as u64;
        if pruned > 0 {
            let mut batch = WriteBatch::default();
            for block in &doomed {
                self.delete_block_batch(&mut batch, block)?;
            }
            self.commit(batch)?;
        }
        Ok(pruned)
    }

    /// Flush memtables. The WAL already guarantees durability; this only
    /// trims recovery time.
    pub fn flush(&self) -> Result<(), StoreError> {
        for chain in ChainTag::ALL {
            for name in [cf_blocks(chain), cf_index(chain), cf_state(chain)] {
                if let Some(cf) = self.db.cf_handle(name) {
                    self.db.flush_cf(cf)?;
                }
            }
        }
        for name in [CF_TXS, CF_UTXO] {
            if let Some(cf) = self.db.cf_handle(name) {
                self.db.flush_cf(cf)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::block::BlockHeader;
    use crate::primitives::transaction::{TxInput, TxOutput};
    use crate::pow::target::MIN_DIFFICULTY_BITS;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};

    static CTR: AtomicU64 = AtomicU64::new(0);

    fn tmp() -> ChainStore {
        let id = CTR.fetch_add(1, Ordering::SeqCst);
        let p = PathBuf::from(format!("/tmp/bimetal_store_{}_{}", std::process::id(), id));
        let _ = std::fs::remove_dir_all(&p);
        ChainStore::open(&p).unwrap()
    }

    fn sample_block(chain: ChainTag, height: u64, prev: Hash) -> Block {
        let coinbase = Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint::COINBASE,
                unlock_script: height.to_le_bytes().to_vec(),
                sequence: 0,
            }],
            outputs: vec![TxOutput {
                value: 50 * crate::primitives::coin::UNITS_PER_COIN,
                kind: CoinKind::Leah,
                lock_script: vec![0x11; 32],
            }],
            lock_time: 0,
            witness: vec![],
        };
        let transactions = vec![coinbase];
        Block {
            header: BlockHeader {
                version: 1,
                previous_hash: prev,
                merkle_root: Block::compute_merkle_root(&transactions),
                timestamp: 1_700_000_000 + height as i64 * 600,
                bits: MIN_DIFFICULTY_BITS,
                nonce: 0,
                height,
                chain,
            },
            transactions,
        }
    }

    #[test]
    fn test_block_roundtrip_by_height_and_id() {
        let store = tmp();
        let block = sample_block(ChainTag::Golden, 0, Hash::ZERO);
        let mut batch = WriteBatch::default();
        store.put_block_batch(&mut batch, &block).unwrap();
        store.commit(batch).unwrap();

        let by_height = store
            .get_block_by_height(ChainTag::Golden, 0)
            .unwrap()
            .unwrap();
        assert_eq!(by_height, block);

        let by_id = store
            .get_block_by_id(ChainTag::Golden, &block.hash())
            .unwrap()
            .unwrap();
        assert_eq!(by_id, block);

        // Same height on the other chain is a different namespace
        assert!(store
            .get_block_by_height(ChainTag::Silver, 0)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_transaction_locator() {
        let store = tmp();
        let block = sample_block(ChainTag::Silver, 9, Hash::ZERO);
        let txid = block.transactions[0].txid();
        let mut batch = WriteBatch::default();
        store.put_block_batch(&mut batch, &block).unwrap();
        store.commit(batch).unwrap();

        let (loc, tx) = store.get_transaction(&txid).unwrap().unwrap();
        assert_eq!(loc.chain, ChainTag::Silver);
        assert_eq!(loc.height, 9);
        assert_eq!(loc.index, 0);
        assert_eq!(tx.txid(), txid);
    }

    #[test]
    fn test_tip_state_roundtrip() {
        let store = tmp();
        let tip = ChainTip {
            hash: crate::crypto::hash::sha256d(b"tip"),
            height: 42,
            work: U256::from(123456789u64),
        };
        let mut batch = WriteBatch::default();
        store
            .put_tip_batch(&mut batch, ChainTag::Golden, &tip)
            .unwrap();
        store.commit(batch).unwrap();

        assert_eq!(store.get_tip(ChainTag::Golden).unwrap().unwrap(), tip);
        assert!(store.get_tip(ChainTag::Silver).unwrap().is_none());
    }

    #[test]
    fn test_utxo_roundtrip_and_load() {
        let store = tmp();
        let op = OutPoint::new(crate::crypto::hash::sha256d(b"tx"), 1);
        let utxo = StoredUtxo {
            value: 77,
            kind: CoinKind::Antion,
            lock_script: vec![0xAB; 32],
            height: 5,
            coinbase: false,
            chain: ChainTag::Golden,
        };
        let mut batch = WriteBatch::default();
        store.put_utxo_batch(&mut batch, &op, &utxo).unwrap();
        store.commit(batch).unwrap();

        let loaded = store.load_utxos().unwrap();
        assert_eq!(loaded, vec![(op, utxo)]);

        let mut batch = WriteBatch::default();
        store.delete_utxo_batch(&mut batch, &op).unwrap();
        store.commit(batch).unwrap();
        assert!(store.load_utxos().unwrap().is_empty());
    }

    #[test]
    fn test_prune_below_respects_floor() {
        let store = tmp();
        let mut prev = Hash::ZERO;
        let mut blocks = Vec::new();
        for h in 0..10 {
            let b = sample_block(ChainTag::Golden, h, prev);
            prev = b.hash();
            blocks.push(b);
        }
        let mut batch = WriteBatch::default();
        for b in &blocks {
            store.put_block_batch(&mut batch, b).unwrap();
        }
        store.commit(batch).unwrap();

        let pruned = store.prune_below(ChainTag::Golden, 4).unwrap();
        assert_eq!(pruned, 4);
        for h in 0..4 {
            assert!(store
                .get_block_by_height(ChainTag::Golden, h)
                .unwrap()
                .is_none());
        }
        for h in 4..10 {
            assert!(store
                .get_block_by_height(ChainTag::Golden, h)
                .unwrap()
                .is_some());
        }
        // Pruned transactions are gone too
        assert!(store
            .get_transaction(&blocks[0].transactions[0].txid())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_batch_atomicity_spans_column_families() {
        let store = tmp();
        let block = sample_block(ChainTag::Golden, 0, Hash::ZERO);
        let tip = ChainTip {
            hash: block.hash(),
            height: 0,
            work: U256::one(),
        };
        let mut batch = WriteBatch::default();
        store.put_block_batch(&mut batch, &block).unwrap();
        store
            .put_tip_batch(&mut batch, ChainTag::Golden, &tip)
            .unwrap();
        store.commit(batch).unwrap();

        assert!(store.get_block_by_height(ChainTag::Golden, 0).unwrap().is_some());
        assert_eq!(store.get_tip(ChainTag::Golden).unwrap().unwrap().hash, tip.hash);
    }
}

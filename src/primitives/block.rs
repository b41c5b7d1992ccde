// Data Structures: Block
//
// The block hash (the PoW preimage) covers exactly six header fields in
// canonical little-endian form: version, previous hash, merkle root,
// timestamp, difficulty bits, nonce. Height and chain tag are persisted
// with the header but never hashed.

use crate::crypto::hash::{Hash, sha256d, sha256d_concat};
use crate::primitives::codec::{self, DecodeResult, Reader};
use crate::primitives::coin::ChainTag;
use crate::primitives::transaction::Transaction;

pub const POW_HEADER_BYTES: usize = 84;
pub const HEADER_BYTES: usize = POW_HEADER_BYTES + 8 + 1;
pub const MAX_BLOCK_SIZE: usize = 1_000_000;
pub const MAX_BLOCK_WEIGHT: usize = 4_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: u32,
    pub previous_hash: Hash,
    pub merkle_root: Hash,
    pub timestamp: i64,
    pub bits: u32,
    pub nonce: u32,
    // Derived, persisted, never hashed
    pub height: u64,
    pub chain: ChainTag,
}

impl BlockHeader {
    /// The 84-byte PoW preimage.
    pub fn pow_bytes(&self) -> [u8; POW_HEADER_BYTES] {
        let mut buf = [0u8; POW_HEADER_BYTES];
        buf[0..4].copy_from_slice(&self.version.to_le_bytes());
        buf[4..36].copy_from_slice(self.previous_hash.as_bytes());
        buf[36..68].copy_from_slice(self.merkle_root.as_bytes());
        buf[68..76].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[76..80].copy_from_slice(&self.bits.to_le_bytes());
        buf[80..84].copy_from_slice(&self.nonce.to_le_bytes());
        buf
    }

    /// The definitive block hash: SHA-256d of the PoW preimage.
    pub fn hash(&self) -> Hash {
        sha256d(&self.pow_bytes())
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.pow_bytes());
        codec::write_u64(buf, self.height);
        buf.push(self.chain.as_u8());
    }

    pub fn decode(r: &mut Reader<'_>) -> DecodeResult<BlockHeader> {
        let version = r.read_u32()?;
        let previous_hash = r.read_hash()?;
        let merkle_root = r.read_hash()?;
        let timestamp = r.read_i64()?;
        let bits = r.read_u32()?;
        let nonce = r.read_u32()?;
        let height = r.read_u64()?;
        let chain = ChainTag::from_u8(r.read_u8()?)?;
        Ok(BlockHeader {
            version,
            previous_hash,
            merkle_root,
            timestamp,
            bits,
            nonce,
            height,
            chain,
        })
    }
}

/// A full block: header plus ordered transactions, coinbase first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.header.encode(&mut buf);
        codec::write_varint(&mut buf, self.transactions.len() as u64);
        for tx in &self.transactions {
            buf.extend_from_slice(&tx.encode(true));
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> DecodeResult<Block> {
        let mut r = Reader::new(bytes);
        let header = BlockHeader::decode(&mut r)?;
        let n = r.read_varint()? as usize;
        if n > MAX_BLOCK_SIZE / 60 {
            return Err("transaction count exceeds limit");
        }
        let mut transactions = Vec::with_capacity(n);
        for _ in 0..n {
            transactions.push(Transaction::decode(&mut r)?);
        }
        if !r.is_empty() {
            return Err("trailing bytes after block");
        }
        Ok(Block {
            header,
            transactions,
        })
    }

    /// Compute the merkle root over txids, duplicating the last leaf at
    /// odd levels.
    pub fn compute_merkle_root(transactions: &[Transaction]) -> Hash {
        if transactions.is_empty() {
            return Hash::ZERO;
        }

        let mut level: Vec<Hash> = transactions.iter().map(|tx| tx.txid()).collect();

        while level.len() > 1 {
            let mut next = Vec::with_capacity(level.len().div_ceil(2));
            for pair in level.chunks(2) {
                let right = if pair.len() == 2 { &pair[1] } else { &pair[0] };
                next.push(sha256d_concat(pair[0].as_bytes(), right.as_bytes()));
            }
            level = next;
        }

        level[0]
    }

    pub fn serialized_size(&self) -> usize {
        self.encode().len()
    }

    /// Block weight: base bytes once, witness bytes four times.
    pub fn weight(&self) -> usize {
        let header_overhead = {
            let mut buf = Vec::new();
            self.header.encode(&mut buf);
            codec::write_varint(&mut buf, self.transactions.len() as u64);
            buf.len()
        };
        header_overhead
            + self
                .transactions
                .iter()
                .map(|tx| tx.weight())
                .sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::coin::CoinKind;
    use crate::primitives::transaction::{OutPoint, TxInput, TxOutput};

    fn coinbase(tag: u8) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint::COINBASE,
                unlock_script: vec![tag],
                sequence: 0,
            }],
            outputs: vec![TxOutput {
                value: 50 * crate::primitives::coin::UNITS_PER_COIN,
                kind: CoinKind::Leah,
                lock_script: vec![0x11; 32],
            }],
            lock_time: 0,
            witness: vec![],
        }
    }

    fn sample_block(n_extra: usize) -> Block {
        let mut transactions = vec![coinbase(0)];
        for i in 0..n_extra {
            transactions.push(coinbase(i as u8 + 1));
        }
        let header = BlockHeader {
            version: 1,
            previous_hash: sha256d(b"parent"),
            merkle_root: Block::compute_merkle_root(&transactions),
            timestamp: 1_735_689_600,
            bits: 0x1F00_FFFF,
            nonce: 42,
            height: 7,
            chain: ChainTag::Golden,
        };
        Block {
            header,
            transactions,
        }
    }

    #[test]
    fn test_pow_preimage_is_84_bytes_and_excludes_height() {
        let mut block = sample_block(0);
        assert_eq!(block.header.pow_bytes().len(), POW_HEADER_BYTES);
        let h = block.hash();
        block.header.height = 99;
        block.header.chain = ChainTag::Silver;
        assert_eq!(block.hash(), h);
        block.header.nonce += 1;
        assert_ne!(block.hash(), h);
    }

    #[test]
    fn test_block_roundtrip() {
        for extra in [0usize, 1, 2, 3] {
            let block = sample_block(extra);
            let decoded = Block::decode(&block.encode()).unwrap();
            assert_eq!(decoded, block);
        }
    }

    #[test]
    fn test_merkle_single_leaf_is_txid() {
        let txs = vec![coinbase(0)];
        assert_eq!(Block::compute_merkle_root(&txs), txs[0].txid());
    }

    #[test]
    fn test_merkle_odd_count_duplicates_last() {
        let txs = vec![coinbase(0), coinbase(1), coinbase(2)];
        let a = txs[0].txid();
        let b = txs[1].txid();
        let c = txs[2].txid();
        let ab = sha256d_concat(a.as_bytes(), b.as_bytes());
        let cc = sha256d_concat(c.as_bytes(), c.as_bytes());
        let root = sha256d_concat(ab.as_bytes(), cc.as_bytes());
        assert_eq!(Block::compute_merkle_root(&txs), root);
    }

    #[test]
    fn test_header_roundtrip() {
        let block = sample_block(1);
        let mut buf = Vec::new();
        block.header.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_BYTES);
        let decoded = BlockHeader::decode(&mut Reader::new(&buf)).unwrap();
        assert_eq!(decoded, block.header);
    }

    #[test]
    fn test_negative_timestamp_survives_roundtrip() {
        let mut block = sample_block(0);
        block.header.timestamp = -1;
        let mut buf = Vec::new();
        block.header.encode(&mut buf);
        let decoded = BlockHeader::decode(&mut Reader::new(&buf)).unwrap();
        assert_eq!(decoded.timestamp, -1);
    }
}

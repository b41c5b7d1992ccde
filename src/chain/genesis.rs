// Genesis block definition
//
// Each chain starts from its own deterministic genesis: height 0,
// previous hash all-zero, minimum difficulty, one coinbase paying the
// initial subsidy to an unspendable all-zero lock script. Genesis headers
// are trusted by definition; their PoW is never checked.

use crate::primitives::block::{Block, BlockHeader};
use crate::primitives::coin::{ChainTag, CoinKind};
use crate::primitives::transaction::{OutPoint, Transaction, TxInput, TxOutput};
use crate::pow::target::MIN_DIFFICULTY_BITS;

/// Genesis timestamp: Jan 1 2026 00:00:00 UTC, shared by both chains.
pub const GENESIS_TIMESTAMP: i64 = 1_767_225_600;

fn genesis_coinbase(chain: ChainTag) -> Transaction {
    let mut unlock_script = b"The one chain of gold, the other of silver".to_vec();
    unlock_script.push(chain.as_u8());
    Transaction {
        version: 1,
        inputs: vec![TxInput {
            previous_output: OutPoint::COINBASE,
            unlock_script,
            sequence: 0,
        }],
        outputs: vec![TxOutput {
            value: crate::chain::reward::subsidy(CoinKind::Leah, 0),
            kind: CoinKind::Leah,
            // Unspendable: no key hashes to 32 zero bytes
            lock_script: vec![0u8; 32],
        }],
        lock_time: 0,
        witness: vec![],
    }
}

pub fn genesis_block(chain: ChainTag) -> Block {
    let transactions = vec![genesis_coinbase(chain)];
    let header = BlockHeader {
        version: 1,
        previous_hash: crate::crypto::hash::Hash::ZERO,
        merkle_root: Block::compute_merkle_root(&transactions),
        timestamp: GENESIS_TIMESTAMP,
        bits: MIN_DIFFICULTY_BITS,
        nonce: 0,
        height: 0,
        chain,
    };
    Block {
        header,
        transactions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_genesis_structure() {
        for chain in ChainTag::ALL {
            let g = genesis_block(chain);
            assert_eq!(g.header.height, 0);
            assert!(g.header.previous_hash.is_zero());
            assert_eq!(g.header.bits, MIN_DIFFICULTY_BITS);
            assert_eq!(g.transactions.len(), 1);
            assert!(g.transactions[0].is_coinbase());
            assert_eq!(
                g.header.merkle_root,
                Block::compute_merkle_root(&g.transactions)
            );
        }
    }

    #[test]
    fn test_chains_have_distinct_genesis_hashes() {
        assert_ne!(
            genesis_block(ChainTag::Golden).hash(),
            genesis_block(ChainTag::Silver).hash()
        );
    }

    #[test]
    fn test_genesis_is_deterministic() {
        assert_eq!(
            genesis_block(ChainTag::Golden).hash(),
            genesis_block(ChainTag::Golden).hash()
        );
    }
}

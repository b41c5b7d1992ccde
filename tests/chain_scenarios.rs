// End-to-end chain scenarios: store ↔ consensus ↔ utxo ↔ mempool

use bimetal::chain::consensus::{
    BlockDisposition, BlockSelector, ChainController, ConsensusConfig,
};
use bimetal::chain::fork::ChainEvent;
use bimetal::chain::genesis::GENESIS_TIMESTAMP;
use bimetal::chain::reward::subsidy;
use bimetal::crypto::hash::{Hash, sha256d};
use bimetal::crypto::keys;
use bimetal::error::ErrorKind;
use bimetal::pow::engine::validate_header_pow;
use bimetal::pow::target::{MIN_DIFFICULTY_BITS, block_work, max_target};
use bimetal::primitives::block::{Block, BlockHeader};
use bimetal::primitives::coin::{ChainTag, CoinKind, UNITS_PER_COIN};
use bimetal::primitives::transaction::{
    OutPoint, Transaction, TxInput, TxOutput, build_unlock_script,
};
use bimetal::store::ChainStore;
use p256::ecdsa::SigningKey;

const NOW: i64 = GENESIS_TIMESTAMP + 10_000_000;

fn tmp_controller() -> ChainController {
    let dir = tempfile::tempdir().unwrap().into_path();
    let store = ChainStore::open(&dir).unwrap();
    ChainController::open(store, ConsensusConfig::default()).unwrap()
}

struct Wallet {
    sk: SigningKey,
    pubkey: Vec<u8>,
    script: Vec<u8>,
}

fn wallet() -> Wallet {
    let (sk, vk) = keys::generate_keypair();
    let pubkey = vk.to_encoded_point(true).as_bytes().to_vec();
    let script = sha256d(&pubkey).0.to_vec();
    Wallet { sk, pubkey, script }
}

fn mine(mut block: Block) -> Block {
    loop {
        if validate_header_pow(&block.header, 1) {
            return block;
        }
        block.header.nonce = block.header.nonce.wrapping_add(1);
    }
}

/// Coinbase-only block paying the Leah subsidy to `script`.
fn make_block(parent: Hash, height: u64, chain: ChainTag, script: &[u8]) -> Block {
    make_block_with(parent, height, chain, script, Vec::new())
}

fn make_block_with(
    parent: Hash,
    height: u64,
    chain: ChainTag,
    script: &[u8],
    extra: Vec<Transaction>,
) -> Block {
    let coinbase = Transaction {
        version: 1,
        inputs: vec![TxInput {
            previous_output: OutPoint::COINBASE,
            unlock_script: height.to_le_bytes().to_vec(),
            sequence: 0,
        }],
        outputs: vec![TxOutput {
            value: subsidy(CoinKind::Leah, height),
            kind: CoinKind::Leah,
            lock_script: script.to_vec(),
        }],
        lock_time: 0,
        witness: vec![],
    };
    let mut transactions = vec![coinbase];
    transactions.extend(extra);
    let header = BlockHeader {
        version: 1,
        previous_hash: parent,
        merkle_root: Block::compute_merkle_root(&transactions),
        timestamp: NOW - 1_000_000 + height as i64 * 600,
        bits: MIN_DIFFICULTY_BITS,
        nonce: 0,
        chain,
        height,
    };
    mine(Block {
        header,
        transactions,
    })
}

/// Extend the golden chain to `target_height` paying every subsidy to
/// `script`; returns the coinbase txids in height order.
fn grow_chain(c: &mut ChainController, chain: ChainTag, target_height: u64, script: &[u8]) -> Vec<Hash> {
    let mut txids = Vec::new();
    for _ in 0..target_height {
        let tip = c.tip(chain);
        let block = make_block(tip.hash, tip.height + 1, chain, script);
        txids.push(block.transactions[0].txid());
        let outcome = c.process_block_at(block, NOW).unwrap();
        assert_eq!(outcome.disposition, BlockDisposition::Connected);
    }
    txids
}

fn signed_spend(
    w: &Wallet,
    from: OutPoint,
    value: u64,
    kind: CoinKind,
    fee: u64,
    to_script: &[u8],
) -> Transaction {
    let mut tx = Transaction {
        version: 1,
        inputs: vec![TxInput {
            previous_output: from,
            unlock_script: vec![],
            sequence: 0xFFFF_FFFF,
        }],
        outputs: vec![TxOutput {
            value: value - fee,
            kind,
            lock_script: to_script.to_vec(),
        }],
        lock_time: 0,
        witness: vec![],
    };
    let sig = keys::sign_digest(&w.sk, &tx.signature_digest());
    tx.inputs[0].unlock_script = build_unlock_script(&sig, &w.pubkey);
    tx
}

// ========== SCENARIO: GENESIS CREATION ==========

#[test]
fn test_genesis_creation_from_empty_store() {
    let c = tmp_controller();
    for chain in ChainTag::ALL {
        let tip = c.tip(chain);
        assert_eq!(tip.height, 0);

        let genesis = c.get_block(chain, BlockSelector::Latest).unwrap().unwrap();
        assert_eq!(genesis.header.previous_hash, Hash::ZERO);
        assert_eq!(tip.hash, genesis.hash());
        // Cumulative work of the minimum-difficulty genesis
        assert_eq!(tip.work, block_work(max_target()));
    }
}

// ========== SCENARIO: MINE AND ACCEPT ONE BLOCK ==========

#[test]
fn test_mine_and_accept_one_block() {
    let mut c = tmp_controller();
    let w = wallet();
    let genesis_tip = c.tip(ChainTag::Golden);

    let block = make_block(genesis_tip.hash, 1, ChainTag::Golden, &w.script);
    // The found nonce hashes below the expanded target
    assert!(validate_header_pow(&block.header, 1));

    let outcome = c.process_block_at(block.clone(), NOW).unwrap();
    assert_eq!(outcome.disposition, BlockDisposition::Connected);
    assert_eq!(c.tip(ChainTag::Golden).height, 1);

    let coinbase_out = OutPoint::new(block.transactions[0].txid(), 0);
    let entry = c.utxo_set().get(&coinbase_out).unwrap();
    assert_eq!(entry.value, 50 * UNITS_PER_COIN);
    assert_eq!(entry.kind, CoinKind::Leah);
    assert!(entry.coinbase);

    // Not yet mature: spending it is rejected
    let spend = signed_spend(
        &w,
        coinbase_out,
        50 * UNITS_PER_COIN,
        CoinKind::Leah,
        1,
        &[0x99; 32],
    );
    let err = c.submit_transaction_at(spend, NOW).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TxInvalid);
}

// ========== SCENARIO: DOUBLE-SPEND REJECTION ==========

#[test]
fn test_double_spend_rejection_in_mempool() {
    let mut c = tmp_controller();
    let w = wallet();
    let txids = grow_chain(&mut c, ChainTag::Golden, 101, &w.script);

    // The height-1 coinbase is now 100 blocks deep and spendable
    let mature = OutPoint::new(txids[0], 0);
    let tx1 = signed_spend(
        &w,
        mature,
        50 * UNITS_PER_COIN,
        CoinKind::Leah,
        1,
        &[0x01; 32],
    );
    let tx2 = signed_spend(
        &w,
        mature,
        50 * UNITS_PER_COIN,
        CoinKind::Leah,
        2,
        &[0x02; 32],
    );
    assert_ne!(tx1.txid(), tx2.txid());

    let first = c.submit_transaction_at(tx1.clone(), NOW).unwrap();
    let err = c.submit_transaction_at(tx2, NOW).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TxInvalid);

    assert_eq!(c.mempool_size(), 1);
    assert!(c.mempool().contains(&first));
}

#[test]
fn test_resubmitting_same_transaction_is_idempotent() {
    let mut c = tmp_controller();
    let w = wallet();
    let txids = grow_chain(&mut c, ChainTag::Golden, 101, &w.script);

    let tx = signed_spend(
        &w,
        OutPoint::new(txids[0], 0),
        50 * UNITS_PER_COIN,
        CoinKind::Leah,
        1,
        &[0x01; 32],
    );
    c.submit_transaction_at(tx.clone(), NOW).unwrap();
    let err = c.submit_transaction_at(tx, NOW).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TxInvalid);
    assert_eq!(c.mempool_size(), 1);
}

// ========== SCENARIO: MEMPOOL TO MINED BLOCK ==========

#[test]
fn test_template_includes_mempool_transaction_and_clears_it() {
    let mut c = tmp_controller();
    let w = wallet();
    let txids = grow_chain(&mut c, ChainTag::Golden, 101, &w.script);

    let spend = signed_spend(
        &w,
        OutPoint::new(txids[0], 0),
        50 * UNITS_PER_COIN,
        CoinKind::Leah,
        7,
        &[0x01; 32],
    );
    let spend_txid = c.submit_transaction_at(spend, NOW).unwrap();

    let template = c
        .build_template(ChainTag::Golden, CoinKind::Leah, &w.script, NOW)
        .unwrap();
    assert_eq!(template.transactions.len(), 2);
    assert_eq!(template.transactions[1].txid(), spend_txid);
    // The coinbase claims subsidy plus the 7-unit fee
    assert_eq!(
        template.transactions[0].outputs[0].value,
        subsidy(CoinKind::Leah, 102) + 7
    );

    let mined = mine(template);
    let outcome = c.process_block_at(mined, NOW).unwrap();
    assert_eq!(outcome.disposition, BlockDisposition::Connected);
    assert_eq!(c.mempool_size(), 0);
    assert!(c.get_transaction(&spend_txid).unwrap().is_some());
}

// ========== SCENARIO: REORG TO A HEAVIER BRANCH ==========

#[test]
fn test_reorg_two_disconnects_three_connects() {
    let mut c = tmp_controller();
    let w = wallet();

    // Shared ancestor A at height 10
    grow_chain(&mut c, ChainTag::Golden, 10, &w.script);
    let ancestor = c.tip(ChainTag::Golden);

    // Branch X: blocks 11, 12
    let x11 = make_block(ancestor.hash, 11, ChainTag::Golden, &[0x11; 32]);
    let x12 = make_block(x11.hash(), 12, ChainTag::Golden, &[0x12; 32]);
    c.process_block_at(x11.clone(), NOW).unwrap();
    c.process_block_at(x12.clone(), NOW).unwrap();
    assert_eq!(c.tip(ChainTag::Golden).hash, x12.hash());

    // Branch Y: blocks 11', 12', 13'
    let y11 = make_block(ancestor.hash, 11, ChainTag::Golden, &[0x21; 32]);
    let y12 = make_block(y11.hash(), 12, ChainTag::Golden, &[0x22; 32]);
    let y13 = make_block(y12.hash(), 13, ChainTag::Golden, &[0x23; 32]);

    assert_eq!(
        c.process_block_at(y11.clone(), NOW).unwrap().disposition,
        BlockDisposition::SideChained
    );
    assert_eq!(
        c.process_block_at(y12.clone(), NOW).unwrap().disposition,
        BlockDisposition::SideChained
    );

    let outcome = c.process_block_at(y13.clone(), NOW).unwrap();
    assert_eq!(
        outcome.disposition,
        BlockDisposition::Reorganized {
            disconnected: 2,
            connected: 3
        }
    );
    // Exactly two disconnects (12 then 11) and three connects (11' 12' 13')
    assert_eq!(
        outcome.events,
        vec![
            (ChainTag::Golden, ChainEvent::Disconnect(x12.hash())),
            (ChainTag::Golden, ChainEvent::Disconnect(x11.hash())),
            (ChainTag::Golden, ChainEvent::Connect(y11.hash())),
            (ChainTag::Golden, ChainEvent::Connect(y12.hash())),
            (ChainTag::Golden, ChainEvent::Connect(y13.hash())),
        ]
    );

    // The UTXO set afterwards matches walking branch Y from A
    for x in [&x11, &x12] {
        assert!(
            !c.utxo_set()
                .contains(&OutPoint::new(x.transactions[0].txid(), 0))
        );
    }
    for y in [&y11, &y12, &y13] {
        assert!(
            c.utxo_set()
                .contains(&OutPoint::new(y.transactions[0].txid(), 0))
        );
    }
    assert_eq!(c.tip(ChainTag::Golden).height, 13);
    assert_eq!(c.tip(ChainTag::Golden).hash, y13.hash());

    // The store serves branch Y at the reorganized heights
    let stored = c
        .get_block(ChainTag::Golden, BlockSelector::Height(11))
        .unwrap()
        .unwrap();
    assert_eq!(stored.hash(), y11.hash());
}

#[test]
fn test_reorg_returns_displaced_transactions_to_mempool() {
    let mut c = tmp_controller();
    let w = wallet();
    let txids = grow_chain(&mut c, ChainTag::Golden, 101, &w.script);

    // Confirm a spend in block 102 on branch X
    let spend = signed_spend(
        &w,
        OutPoint::new(txids[0], 0),
        50 * UNITS_PER_COIN,
        CoinKind::Leah,
        1,
        &[0x31; 32],
    );
    let spend_txid = spend.txid();
    let tip = c.tip(ChainTag::Golden);
    let x102 = make_block_with(tip.hash, 102, ChainTag::Golden, &[0x32; 32], vec![spend]);
    c.process_block_at(x102, NOW).unwrap();
    assert!(c.get_transaction(&spend_txid).unwrap().is_some());

    // A heavier empty branch displaces it
    let y102 = make_block(tip.hash, 102, ChainTag::Golden, &[0x41; 32]);
    let y103 = make_block(y102.hash(), 103, ChainTag::Golden, &[0x42; 32]);
    c.process_block_at(y102, NOW).unwrap();
    let outcome = c.process_block_at(y103, NOW).unwrap();
    assert!(matches!(
        outcome.disposition,
        BlockDisposition::Reorganized { .. }
    ));

    // The displaced spend is valid again at the new tip and returns
    assert!(c.get_transaction(&spend_txid).unwrap().is_none());
    assert!(c.mempool().contains(&spend_txid));
}

// ========== SCENARIO: CROSS-CHAIN POLICY ==========

#[test]
fn test_leah_cannot_cross_chains_via_blocks() {
    let mut c = tmp_controller();
    let w = wallet();
    let txids = grow_chain(&mut c, ChainTag::Golden, 101, &w.script);

    // A silver block trying to spend a golden Leah output
    let spend = signed_spend(
        &w,
        OutPoint::new(txids[0], 0),
        50 * UNITS_PER_COIN,
        CoinKind::Leah,
        1,
        &[0x51; 32],
    );
    let silver_tip = c.tip(ChainTag::Silver);
    let bad = make_block_with(silver_tip.hash, 1, ChainTag::Silver, &[0x52; 32], vec![spend]);
    let err = c.process_block_at(bad, NOW).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TxInvalid);
    assert!(err.to_string().contains("coin not cross-chain"));
    assert_eq!(c.tip(ChainTag::Silver).height, 0);
}

// ========== DETERMINISM ==========

#[test]
fn test_same_blocks_reach_same_state_on_two_nodes() {
    let mut a = tmp_controller();
    let mut b = tmp_controller();
    let w = wallet();

    let mut blocks = Vec::new();
    for _ in 0..5 {
        let tip = a.tip(ChainTag::Golden);
        let block = make_block(tip.hash, tip.height + 1, ChainTag::Golden, &w.script);
        a.process_block_at(block.clone(), NOW).unwrap();
        blocks.push(block);
    }
    // Deliver to b in a scrambled order: orphans buffer and release
    for block in [4usize, 2, 0, 3, 1].map(|i| blocks[i].clone()) {
        let _ = b.process_block_at(block, NOW).unwrap();
    }

    assert_eq!(a.tip(ChainTag::Golden), b.tip(ChainTag::Golden));
    assert_eq!(*a.utxo_set().snapshot(), *b.utxo_set().snapshot());
}

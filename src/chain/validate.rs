// Transaction and coinbase validation
//
// Stateless structure checks first, then lookups against a UTXO view.
// A block is validated transaction by transaction against an evolving
// view, so chained spends inside one block resolve naturally.

use std::collections::{BTreeMap, HashSet};

use crate::chain::reward::{COINBASE_MATURITY, subsidy};
use crate::chain::utxo::{UtxoEntry, UtxoSet};
use crate::crypto::hash::sha256d;
use crate::crypto::keys;
use crate::primitives::coin::{ChainTag, CoinKind};
use crate::primitives::transaction::{
    LOCK_TIME_THRESHOLD, MAX_SCRIPT_SIZE, MAX_TX_SIZE, OutPoint, Transaction, parse_unlock_script,
};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TxError {
    #[error("structure: {0}")]
    Structure(&'static str),
    #[error("input {0} not found in utxo set")]
    MissingInput(OutPoint),
    #[error("coinbase output spent at depth {depth}, maturity is {maturity}")]
    ImmatureCoinbase { depth: u64, maturity: u64 },
    #[error("coin not cross-chain")]
    NotCrossChain(CoinKind),
    #[error("coin {0} is not valid on the {1} chain")]
    WrongChain(CoinKind, ChainTag),
    #[error("outputs of kind {0} exceed inputs of that kind")]
    KindDeficit(CoinKind),
    #[error("value overflow")]
    ValueOverflow,
    #[error("fee {fee} below required minimum {required}")]
    FeeTooLow { fee: u64, required: u64 },
    #[error("lock time {0} not yet satisfied")]
    LockTimeNotSatisfied(u32),
    #[error("unlock script does not parse")]
    BadUnlockScript,
    #[error("public key does not hash to the output lock script")]
    ScriptHashMismatch,
    #[error("bad signature on input {0}")]
    BadSignature(u32),
}

/// Validation context: the chain and height a transaction is judged at.
#[derive(Debug, Clone, Copy)]
pub struct TxContext {
    pub chain: ChainTag,
    pub height: u64,
    pub timestamp: i64,
    /// Minimum fee in minor units per weight unit.
    pub min_fee_per_weight: u64,
}

/// Outcome of validating a non-coinbase transaction: fees by coin kind.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TxFees {
    pub by_kind: BTreeMap<CoinKind, u64>,
}

impl TxFees {
    pub fn total(&self) -> u64 {
        self.by_kind.values().sum()
    }

    pub fn of(&self, kind: CoinKind) -> u64 {
        self.by_kind.get(&kind).copied().unwrap_or(0)
    }

    pub fn absorb(&mut self, other: &TxFees) {
        for (kind, fee) in &other.by_kind {
            *self.by_kind.entry(*kind).or_insert(0) += fee;
        }
    }
}

/// Structural checks that need no state: counts, duplicates, sizes.
pub fn check_structure(tx: &Transaction) -> Result<(), TxError> {
    if tx.inputs.is_empty() {
        return Err(TxError::Structure("no inputs"));
    }
    if tx.outputs.is_empty() {
        return Err(TxError::Structure("no outputs"));
    }
    if tx.total_size() > MAX_TX_SIZE {
        return Err(TxError::Structure("transaction too large"));
    }
    let mut seen = HashSet::with_capacity(tx.inputs.len());
    for input in &tx.inputs {
        if !seen.insert(input.previous_output) {
            return Err(TxError::Structure("duplicate input"));
        }
        if input.unlock_script.len() > MAX_SCRIPT_SIZE {
            return Err(TxError::Structure("unlock script too large"));
        }
    }
    for output in &tx.outputs {
        if output.lock_script.len() > MAX_SCRIPT_SIZE {
            return Err(TxError::Structure("lock script too large"));
        }
    }
    Ok(())
}

fn check_lock_time(tx: &Transaction, ctx: &TxContext) -> Result<(), TxError> {
    if tx.lock_time == 0 {
        return Ok(());
    }
    let satisfied = if tx.lock_time >= LOCK_TIME_THRESHOLD {
        // Interpreted as a Unix timestamp
        i64::from(tx.lock_time) <= ctx.timestamp
    } else {
        // Interpreted as a block height
        u64::from(tx.lock_time) <= ctx.height
    };
    if satisfied {
        Ok(())
    } else {
        Err(TxError::LockTimeNotSatisfied(tx.lock_time))
    }
}

fn check_input_entry(entry: &UtxoEntry, ctx: &TxContext) -> Result<(), TxError> {
    if entry.coinbase {
        let depth = ctx.height.saturating_sub(entry.height);
        if depth < COINBASE_MATURITY {
            return Err(TxError::ImmatureCoinbase {
                depth,
                maturity: COINBASE_MATURITY,
            });
        }
    }
    if !entry.kind.chain_of().admits(ctx.chain) {
        return Err(TxError::WrongChain(entry.kind, ctx.chain));
    }
    // A coin may only be spent on the chain it lives on, unless the kind
    // is explicitly cross-chain transferable.
    if entry.chain != ctx.chain && !entry.kind.is_cross_chain() {
        return Err(TxError::NotCrossChain(entry.kind));
    }
    Ok(())
}

fn check_signature(
    tx: &Transaction,
    index: u32,
    unlock_script: &[u8],
    lock_script: &[u8],
) -> Result<(), TxError> {
    let (sig, pubkey) =
        parse_unlock_script(unlock_script).map_err(|_| TxError::BadUnlockScript)?;
    // The lock script is the expected hash of the spending public key
    if sha256d(&pubkey).0.as_slice() != lock_script {
        return Err(TxError::ScriptHashMismatch);
    }
    let digest = tx.signature_digest();
    if !keys::verify_digest(&pubkey, &digest, &sig) {
        return Err(TxError::BadSignature(index));
    }
    Ok(())
}

/// Validate a non-coinbase transaction against a UTXO view at `ctx`.
/// Returns the fees it pays, broken down by coin kind.
pub fn validate_transaction(
    tx: &Transaction,
    utxos: &UtxoSet,
    ctx: &TxContext,
) -> Result<TxFees, TxError> {
    debug_assert!(!tx.is_coinbase());
    check_structure(tx)?;
    check_lock_time(tx, ctx)?;

    let mut in_by_kind: BTreeMap<CoinKind, u64> = BTreeMap::new();
    for (index, input) in tx.inputs.iter().enumerate() {
        let entry = utxos
            .get(&input.previous_output)
            .ok_or(TxError::MissingInput(input.previous_output))?;
        check_input_entry(entry, ctx)?;
        check_signature(tx, index as u32, &input.unlock_script, &entry.lock_script)?;

        let sum = in_by_kind.entry(entry.kind).or_insert(0);
        *sum = sum.checked_add(entry.value).ok_or(TxError::ValueOverflow)?;
    }

    let mut out_by_kind: BTreeMap<CoinKind, u64> = BTreeMap::new();
    for output in &tx.outputs {
        if !output.kind.chain_of().admits(ctx.chain) {
            return Err(TxError::WrongChain(output.kind, ctx.chain));
        }
        let sum = out_by_kind.entry(output.kind).or_insert(0);
        *sum = sum.checked_add(output.value).ok_or(TxError::ValueOverflow)?;
    }

    // Kinds never convert into each other: each kind conserves value
    // independently, and the surplus is that kind's fee.
    let mut fees = TxFees::default();
    for (kind, out_sum) in &out_by_kind {
        let in_sum = in_by_kind.get(kind).copied().unwrap_or(0);
        if out_sum > &in_sum {
            return Err(TxError::KindDeficit(*kind));
        }
    }
    for (kind, in_sum) in &in_by_kind {
        let out_sum = out_by_kind.get(kind).copied().unwrap_or(0);
        let fee = in_sum - out_sum;
        if fee > 0 {
            fees.by_kind.insert(*kind, fee);
        }
    }

    let required = ctx
        .min_fee_per_weight
        .saturating_mul(tx.weight() as u64);
    let fee = fees.total();
    if fee < required {
        return Err(TxError::FeeTooLow { fee, required });
    }

    Ok(fees)
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CoinbaseError {
    #[error("coinbase structure: {0}")]
    Structure(&'static str),
    #[error("coinbase claims {claimed} of {kind}, allowed {allowed}")]
    ExcessValue {
        kind: CoinKind,
        claimed: u64,
        allowed: u64,
    },
    #[error("supply cap for {0} exceeded")]
    SupplyCap(CoinKind),
    #[error("coinbase mixes mineable kinds")]
    MixedMineableKinds,
}

/// The mineable kind a coinbase mints, if any. At most one mineable kind
/// may appear among the outputs; its multiplier governs the block's PoW.
pub fn coinbase_mined_kind(coinbase: &Transaction) -> Result<Option<CoinKind>, CoinbaseError> {
    let mut mined = None;
    for output in &coinbase.outputs {
        if output.kind.is_mineable() {
            match mined {
                None => mined = Some(output.kind),
                Some(k) if k == output.kind => {}
                Some(_) => return Err(CoinbaseError::MixedMineableKinds),
            }
        }
    }
    Ok(mined)
}

/// Validate the coinbase of a block at `height`: sentinel input, per-kind
/// value ceiling of subsidy + fees, and supply caps on net issuance.
/// `outstanding` reports the chain's current outstanding supply per kind.
pub fn validate_coinbase(
    coinbase: &Transaction,
    height: u64,
    fees: &TxFees,
    outstanding: impl Fn(CoinKind) -> u64,
) -> Result<(), CoinbaseError> {
    if !coinbase.is_coinbase() {
        return Err(CoinbaseError::Structure("missing sentinel input"));
    }
    if coinbase.outputs.is_empty() {
        return Err(CoinbaseError::Structure("no outputs"));
    }
    let mined = coinbase_mined_kind(coinbase)?;

    let mut out_by_kind: BTreeMap<CoinKind, u64> = BTreeMap::new();
    for output in &coinbase.outputs {
        let sum = out_by_kind.entry(output.kind).or_insert(0);
        *sum = sum
            .checked_add(output.value)
            .ok_or(CoinbaseError::Structure("value overflow"))?;
    }

    for (kind, claimed) in &out_by_kind {
        let subsidy_part = if Some(*kind) == mined {
            subsidy(*kind, height)
        } else {
            0
        };
        let allowed = subsidy_part.saturating_add(fees.of(*kind));
        if claimed > &allowed {
            return Err(CoinbaseError::ExcessValue {
                kind: *kind,
                claimed: *claimed,
                allowed,
            });
        }
        // Net new supply = claimed − recycled fees; respects any cap
        if let Some(cap) = kind.supply_cap() {
            let issuance = claimed.saturating_sub(fees.of(*kind));
            if outstanding(*kind).saturating_add(issuance) > cap {
                return Err(CoinbaseError::SupplyCap(*kind));
            }
        }
    }
    Ok(())
}

// Data Structures: Transaction
//
// The txid is SHA-256d over the canonical witness-excluded encoding, so
// reshaping witness data never changes a transaction's identity. The
// signature digest additionally blanks the unlock scripts, since those
// carry the signatures themselves.

use crate::crypto::hash::{Hash, sha256d};
use crate::primitives::codec::{self, DecodeResult, Reader};
use crate::primitives::coin::CoinKind;

pub const MAX_TX_SIZE: usize = 100_000;
pub const MAX_SCRIPT_SIZE: usize = 10_000;
pub const MAX_WITNESS_ITEMS: usize = 500;

/// Reference to an output of a previous transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutPoint {
    pub txid: Hash,
    pub vout: u32,
}

impl OutPoint {
    /// Sentinel prevout carried by the one coinbase input.
    pub const COINBASE: OutPoint = OutPoint {
        txid: Hash::ZERO,
        vout: 0xFFFF_FFFF,
    };

    pub fn new(txid: Hash, vout: u32) -> Self {
        OutPoint { txid, vout }
    }

    pub fn is_coinbase_sentinel(&self) -> bool {
        *self == OutPoint::COINBASE
    }
}

impl std::fmt::Display for OutPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInput {
    pub previous_output: OutPoint,
    pub unlock_script: Vec<u8>,
    pub sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    pub value: u64,
    pub kind: CoinKind,
    pub lock_script: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub lock_time: u32,
    /// Witness byte strings; excluded from the txid.
    pub witness: Vec<Vec<u8>>,
}

/// Lock times at or above this value are Unix timestamps; below, heights.
pub const LOCK_TIME_THRESHOLD: u32 = 500_000_000;

impl Transaction {
    /// Exactly one input carrying the all-zero / 0xFFFFFFFF sentinel.
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].previous_output.is_coinbase_sentinel()
    }

    fn encode_core(&self, buf: &mut Vec<u8>, blank_unlock: bool) {
        codec::write_varint(buf, self.inputs.len() as u64);
        for input in &self.inputs {
            codec::write_hash(buf, &input.previous_output.txid);
            codec::write_u32(buf, input.previous_output.vout);
            if blank_unlock {
                codec::write_varint(buf, 0);
            } else {
                codec::write_bytes(buf, &input.unlock_script);
            }
            codec::write_u32(buf, input.sequence);
        }
        codec::write_varint(buf, self.outputs.len() as u64);
        for output in &self.outputs {
            codec::write_u64(buf, output.value);
            buf.push(output.kind.as_u8());
            codec::write_bytes(buf, &output.lock_script);
        }
    }

    /// Canonical encoding. Witness data rides behind a 0x00 marker and
    /// 0x01 flag byte pair, which cannot collide with an input count
    /// because valid transactions never have zero inputs.
    pub fn encode(&self, include_witness: bool) -> Vec<u8> {
        let mut buf = Vec::new();
        codec::write_u32(&mut buf, self.version);
        let with_witness = include_witness && !self.witness.is_empty();
        if with_witness {
            buf.push(0x00);
            buf.push(0x01);
        }
        self.encode_core(&mut buf, false);
        if with_witness {
            codec::write_varint(&mut buf, self.witness.len() as u64);
            for item in &self.witness {
                codec::write_bytes(&mut buf, item);
            }
        }
        codec::write_u32(&mut buf, self.lock_time);
        buf
    }

    pub fn decode(r: &mut Reader<'_>) -> DecodeResult<Transaction> {
        let version = r.read_u32()?;
        let mut has_witness = false;
        if r.peek_u8()? == 0x00 {
            r.read_u8()?;
            if r.read_u8()? != 0x01 {
                return Err("bad witness flag");
            }
            has_witness = true;
        }

        let n_in = r.read_varint()? as usize;
        if n_in > MAX_TX_SIZE / 41 {
            return Err("input count exceeds limit");
        }
        let mut inputs = Vec::with_capacity(n_in);
        for _ in 0..n_in {
            let txid = r.read_hash()?;
            let vout = r.read_u32()?;
            let unlock_script = r.read_bytes(MAX_SCRIPT_SIZE)?;
            let sequence = r.read_u32()?;
            inputs.push(TxInput {
                previous_output: OutPoint::new(txid, vout),
                unlock_script,
                sequence,
            });
        }

        let n_out = r.read_varint()? as usize;
        if n_out > MAX_TX_SIZE / 10 {
            return Err("output count exceeds limit");
        }
        let mut outputs = Vec::with_capacity(n_out);
        for _ in 0..n_out {
            let value = r.read_u64()?;
            let kind = CoinKind::from_u8(r.read_u8()?)?;
            let lock_script = r.read_bytes(MAX_SCRIPT_SIZE)?;
            outputs.push(TxOutput {
                value,
                kind,
                lock_script,
            });
        }

        let witness = if has_witness {
            let n = r.read_varint()? as usize;
            if n > MAX_WITNESS_ITEMS {
                return Err("witness item count exceeds limit");
            }
            let mut items = Vec::with_capacity(n);
            for _ in 0..n {
                items.push(r.read_bytes(MAX_SCRIPT_SIZE)?);
            }
            items
        } else {
            Vec::new()
        };

        let lock_time = r.read_u32()?;
        Ok(Transaction {
            version,
            inputs,
            outputs,
            lock_time,
            witness,
        })
    }

    pub fn decode_all(bytes: &[u8]) -> DecodeResult<Transaction> {
        let mut r = Reader::new(bytes);
        let tx = Transaction::decode(&mut r)?;
        if !r.is_empty() {
            return Err("trailing bytes after transaction");
        }
        Ok(tx)
    }

    /// Transaction id: SHA-256d of the witness-excluded encoding.
    pub fn txid(&self) -> Hash {
        sha256d(&self.encode(false))
    }

    /// Digest each input signature commits to: the witness-excluded
    /// encoding with every unlock script blanked.
    pub fn signature_digest(&self) -> Hash {
        let mut buf = Vec::new();
        codec::write_u32(&mut buf, self.version);
        self.encode_core(&mut buf, true);
        codec::write_u32(&mut buf, self.lock_time);
        sha256d(&buf)
    }

    /// Size of the witness-excluded encoding.
    pub fn base_size(&self) -> usize {
        self.encode(false).len()
    }

    /// Size of the full encoding.
    pub fn total_size(&self) -> usize {
        self.encode(true).len()
    }

    /// Weight: base bytes count once, witness bytes count four times.
    pub fn weight(&self) -> usize {
        let base = self.base_size();
        let total = self.total_size();
        base + (total - base) * 4
    }

    pub fn total_output_value(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |acc, o| acc.checked_add(o.value))
    }
}

/// Assemble the standard unlock script: compact-prefixed DER signature
/// followed by the compact-prefixed SEC1 public key.
pub fn build_unlock_script(der_sig: &[u8], pubkey_sec1: &[u8]) -> Vec<u8> {
    let mut script = Vec::with_capacity(2 + der_sig.len() + pubkey_sec1.len());
    codec::write_bytes(&mut script, der_sig);
    codec::write_bytes(&mut script, pubkey_sec1);
    script
}

/// Split an unlock script back into (signature, public key).
pub fn parse_unlock_script(script: &[u8]) -> DecodeResult<(Vec<u8>, Vec<u8>)> {
    let mut r = Reader::new(script);
    let sig = r.read_bytes(MAX_SCRIPT_SIZE)?;
    let pk = r.read_bytes(MAX_SCRIPT_SIZE)?;
    if !r.is_empty() {
        return Err("trailing bytes in unlock script");
    }
    Ok((sig, pk))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx() -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint::new(sha256d(b"prev"), 3),
                unlock_script: vec![0xAA; 70],
                sequence: 0xFFFF_FFFF,
            }],
            outputs: vec![
                TxOutput {
                    value: 40 * crate::primitives::coin::UNITS_PER_COIN,
                    kind: CoinKind::Leah,
                    lock_script: vec![0x11; 32],
                },
                TxOutput {
                    value: 9 * crate::primitives::coin::UNITS_PER_COIN,
                    kind: CoinKind::Antion,
                    lock_script: vec![0x22; 32],
                },
            ],
            lock_time: 0,
            witness: vec![vec![0xCC; 16]],
        }
    }

    #[test]
    fn test_roundtrip_with_witness() {
        let tx = sample_tx();
        let bytes = tx.encode(true);
        assert_eq!(Transaction::decode_all(&bytes).unwrap(), tx);
    }

    #[test]
    fn test_roundtrip_without_witness() {
        let mut tx = sample_tx();
        let stripped = Transaction::decode_all(&tx.encode(false)).unwrap();
        tx.witness.clear();
        assert_eq!(stripped, tx);
    }

    #[test]
    fn test_txid_ignores_witness() {
        let mut tx = sample_tx();
        let id = tx.txid();
        tx.witness = vec![vec![0xFF; 64], vec![0x01]];
        assert_eq!(tx.txid(), id);
        tx.outputs[0].value += 1;
        assert_ne!(tx.txid(), id);
    }

    #[test]
    fn test_signature_digest_ignores_unlock_scripts() {
        let mut tx = sample_tx();
        let digest = tx.signature_digest();
        tx.inputs[0].unlock_script = vec![0x55; 140];
        assert_eq!(tx.signature_digest(), digest);
        tx.lock_time = 9;
        assert_ne!(tx.signature_digest(), digest);
    }

    #[test]
    fn test_coinbase_detection() {
        let mut tx = sample_tx();
        assert!(!tx.is_coinbase());
        tx.inputs = vec![TxInput {
            previous_output: OutPoint::COINBASE,
            unlock_script: vec![],
            sequence: 0,
        }];
        assert!(tx.is_coinbase());
    }

    #[test]
    fn test_weight_counts_witness_quadruple() {
        let tx = sample_tx();
        let base = tx.base_size();
        let total = tx.total_size();
        assert!(total > base);
        assert_eq!(tx.weight(), base + (total - base) * 4);
    }

    #[test]
    fn test_unlock_script_roundtrip() {
        let sig = vec![0x30, 0x44, 0x02, 0x20];
        let pk = vec![0x02; 33];
        let script = build_unlock_script(&sig, &pk);
        assert_eq!(parse_unlock_script(&script).unwrap(), (sig, pk));
        assert!(parse_unlock_script(&[0xFF]).is_err());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = sample_tx().encode(true);
        bytes.push(0);
        assert!(Transaction::decode_all(&bytes).is_err());
    }
}

// Difficulty targets
//
// Targets are 256-bit thresholds; a header hash must be numerically below
// the target (interpreted big-endian) to satisfy PoW. Headers carry the
// target in the standard compact form: one exponent byte and a 23-bit
// mantissa.

use primitive_types::U256;

use crate::crypto::hash::Hash;

/// Compact bits of the easiest permitted target (4 leading zero bits).
/// This is also the genesis difficulty on both chains.
pub const MIN_DIFFICULTY_BITS: u32 = 0x200F_FFFF;

/// Easiest permitted target.
pub fn max_target() -> U256 {
    // Exact value of MIN_DIFFICULTY_BITS so clamping and encoding agree
    compact_to_target(MIN_DIFFICULTY_BITS).unwrap_or(U256::MAX >> 4)
}

/// Hardest permitted target (32 leading zero bits).
pub fn min_target() -> U256 {
    U256::MAX >> 32
}

/// Expand compact difficulty bits into a full target.
/// Returns None for negative or overflowing encodings.
pub fn compact_to_target(bits: u32) -> Option<U256> {
    let exponent = (bits >> 24) as usize;
    let mantissa = bits & 0x007F_FFFF;
    if bits & 0x0080_0000 != 0 {
        return None; // sign bit: negative targets are invalid
    }
    if mantissa == 0 {
        return Some(U256::zero());
    }
    let target = if exponent <= 3 {
        U256::from(mantissa) >> (8 * (3 - exponent))
    } else {
        let shift = 8 * (exponent - 3);
        // Mantissa occupies up to 3 bytes; anything shifted past byte 32
        // cannot be represented.
        if exponent > 32 + 3 {
            return None;
        }
        let t = U256::from(mantissa) << shift;
        if (t >> shift) != U256::from(mantissa) {
            return None;
        }
        t
    };
    Some(target)
}

/// Collapse a target into compact bits. Lossy below the top three bytes.
pub fn target_to_compact(target: U256) -> u32 {
    if target.is_zero() {
        return 0;
    }
    let mut size = (target.bits() + 7) / 8;
    let mut mantissa: u32 = if size <= 3 {
        (target.low_u64() << (8 * (3 - size))) as u32
    } else {
        (target >> (8 * (size - 3))).low_u64() as u32
    };
    // Keep the sign bit clear
    if mantissa & 0x0080_0000 != 0 {
        mantissa >>= 8;
        size += 1;
    }
    ((size as u32) << 24) | mantissa
}

/// Numeric value of a block hash for target comparison.
pub fn hash_to_u256(hash: &Hash) -> U256 {
    U256::from_big_endian(hash.as_bytes())
}

/// Work contributed by a block: 2^256 / (target + 1), computed without
/// overflowing as (~target / (target + 1)) + 1.
pub fn block_work(target: U256) -> U256 {
    if target == U256::MAX {
        return U256::zero();
    }
    (!target / (target + U256::one())) + U256::one()
}

/// Serialize cumulative work as 32 big-endian bytes for the state bucket.
pub fn work_to_bytes(work: U256) -> [u8; 32] {
    let mut out = [0u8; 32];
    work.to_big_endian(&mut out);
    out
}

pub fn work_from_bytes(bytes: &[u8]) -> Option<U256> {
    if bytes.len() != 32 {
        return None;
    }
    Some(U256::from_big_endian(bytes))
}

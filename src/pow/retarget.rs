// Difficulty retargeting
//
// Header validation uses only the windowed form: every `interval` blocks
// the target is scaled by the time the previous window actually took.
// The per-block adaptive form is a miner heuristic and is never consulted
// when validating a header.

use primitive_types::U256;

use super::target::{compact_to_target, max_target, min_target, target_to_compact};

pub const DEFAULT_RETARGET_INTERVAL: u64 = 2016;
pub const DEFAULT_TARGET_BLOCK_TIME_SECS: u64 = 600;

/// Scale `old` by clamped `actual / expected`, guarding the U256 multiply.
fn scale_target(old: U256, actual: u64, expected: u64) -> U256 {
    // Clamp the adjustment factor to [1/4, 4]
    let actual = actual.clamp(expected / 4, expected.saturating_mul(4));

    let actual = U256::from(actual);
    let expected = U256::from(expected.max(1));

    let scaled = if U256::MAX / actual < old {
        U256::MAX
    } else {
        old * actual / expected
    };

    scaled.clamp(min_target(), max_target())
}

/// Windowed retarget: called when a block's height is a multiple of the
/// interval. `first_timestamp` and `last_timestamp` are the timestamps of
/// the first and last blocks of the closed window, inclusive.
pub fn windowed_retarget(
    old_bits: u32,
    first_timestamp: i64,
    last_timestamp: i64,
    interval: u64,
    block_time_secs: u64,
) -> u32 {
    let old = match compact_to_target(old_bits) {
        Some(t) if !t.is_zero() => t,
        _ => return target_to_compact(max_target()),
    };
    let expected = interval * block_time_secs;
    let actual = last_timestamp.saturating_sub(first_timestamp).max(1) as u64;
    target_to_compact(scale_target(old, actual, expected))
}

/// The difficulty bits a block at `height` must carry, given the previous
/// block's bits and the window boundary timestamps. Away from a window
/// boundary the bits are inherited unchanged.
pub fn required_bits(
    height: u64,
    prev_bits: u32,
    window_first_timestamp: i64,
    window_last_timestamp: i64,
    interval: u64,
    block_time_secs: u64,
) -> u32 {
    if height == 0 || !height.is_multiple_of(interval) {
        return prev_bits;
    }
    windowed_retarget(
        prev_bits,
        window_first_timestamp,
        window_last_timestamp,
        interval,
        block_time_secs,
    )
}

/// Per-block adaptive target for miners chasing a stable block time:
/// scale by the single measured inter-block gap. Same clamps as the
/// windowed form; never used by header validation.
pub fn adaptive_target(old_bits: u32, measured_secs: u64, expected_secs: u64) -> u32 {
    let old = match compact_to_target(old_bits) {
        Some(t) if !t.is_zero() => t,
        _ => return target_to_compact(max_target()),
    };
    target_to_compact(scale_target(old, measured_secs.max(1), expected_secs.max(1)))
}

// Proof-of-work search engine
//
// The nonce space is the 32-bit header nonce widened by a 32-bit
// extranonce in the coinbase unlock script, giving 2^64 attempts per
// template. Workers own disjoint extranonce ranges and iterate the header
// nonce inside them, re-deriving the merkle root once per extranonce.
// Workers poll the shutdown flag between hashes; they never block.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use primitive_types::U256;

use crate::crypto::hash::{Hash, sha256d};
use crate::primitives::block::Block;
use crate::pow::target::{compact_to_target, hash_to_u256};

pub const DEFAULT_MINING_TIMEOUT: Duration = Duration::from_secs(300);
pub const EXTRANONCE_BYTES: usize = 4;

const BREAKER_TRIP_FAILURES: u32 = 5;
const BREAKER_COOLDOWN: Duration = Duration::from_secs(30);
const BREAKER_HALF_OPEN_PROBES: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum PowError {
    #[error("difficulty bits do not encode a valid target")]
    BadBits,
    #[error("coinbase unlock script has no extranonce slot")]
    NoExtranonceSlot,
    #[error("mining circuit open; retry in {0:?}")]
    CircuitOpen(Duration),
    #[error("mining worker failed")]
    WorkerFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchOutcome {
    Found {
        extranonce: u32,
        nonce: u32,
        hash: Hash,
    },
    Cancelled,
    Exhausted,
    Timeout,
}

/// Divide a target by the coin's mining difficulty multiplier.
pub fn effective_target(target: U256, difficulty_multiplier: u64) -> U256 {
    target / U256::from(difficulty_multiplier.max(1))
}

/// Recompute the hash of a header and compare it numerically against the
/// target encoded in its bits. Hashes equal to the target are rejected.
pub fn validate_header_pow(
    header: &crate::primitives::block::BlockHeader,
    difficulty_multiplier: u64,
) -> bool {
    let Some(target) = compact_to_target(header.bits) else {
        return false;
    };
    let threshold = effective_target(target, difficulty_multiplier);
    hash_to_u256(&header.hash()) < threshold
}

/// Overwrite the trailing extranonce slot of the coinbase unlock script.
/// The template must have been built with `reserve_extranonce`.
pub fn apply_extranonce(block: &mut Block, extranonce: u32) -> Result<(), PowError> {
    let script = &mut block.transactions[0].inputs[0].unlock_script;
    let len = script.len();
    if len < EXTRANONCE_BYTES {
        return Err(PowError::NoExtranonceSlot);
    }
    script[len - EXTRANONCE_BYTES..].copy_from_slice(&extranonce.to_le_bytes());
    Ok(())
}

/// Append the extranonce slot to a coinbase unlock script while building
/// a template.
pub fn reserve_extranonce(unlock_script: &mut Vec<u8>) {
    unlock_script.extend_from_slice(&[0u8; EXTRANONCE_BYTES]);
}

enum WorkerReport {
    Found {
        extranonce: u32,
        nonce: u32,
        hash: Hash,
    },
    Done,
}

fn worker_loop(
    mut block: Block,
    threshold: U256,
    extranonces: std::ops::Range<u64>,
    halt: &AtomicBool,
    shutdown: &AtomicBool,
    out: &mpsc::Sender<WorkerReport>,
) {
    for extranonce in extranonces {
        let extranonce = extranonce as u32;
        if apply_extranonce(&mut block, extranonce).is_err() {
            break;
        }
        block.header.merkle_root = Block::compute_merkle_root(&block.transactions);
        let mut preimage = block.header.pow_bytes();

        let mut nonce: u32 = 0;
        loop {
            // Observed between every hash attempt so cancellation is prompt
            if halt.load(Ordering::Relaxed) || shutdown.load(Ordering::Relaxed) {
                let _ = out.send(WorkerReport::Done);
                return;
            }

            preimage[80..84].copy_from_slice(&nonce.to_le_bytes());
            let hash = sha256d(&preimage);
            if hash_to_u256(&hash) < threshold {
                let _ = out.send(WorkerReport::Found {
                    extranonce,
                    nonce,
                    hash,
                });
                return;
            }

            nonce = match nonce.checked_add(1) {
                Some(n) => n,
                None => break,
            };
        }
    }
    let _ = out.send(WorkerReport::Done);
}

/// Run the nonce search across `workers` threads until a hash below
/// `threshold` is found, the space is exhausted, the deadline passes, or
/// the shutdown flag is raised.
pub fn search(
    template: &Block,
    threshold: U256,
    workers: usize,
    timeout: Duration,
    shutdown: &Arc<AtomicBool>,
) -> Result<SearchOutcome, PowError> {
    if template.transactions.is_empty()
        || template.transactions[0].inputs.is_empty()
        || template.transactions[0].inputs[0].unlock_script.len() < EXTRANONCE_BYTES
    {
        return Err(PowError::NoExtranonceSlot);
    }

    let workers = workers.max(1);
    let deadline = Instant::now() + timeout;
    // Raised on found/timeout as well, so losing workers stop promptly
    let halt = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel();

    // Disjoint extranonce ranges cover the full 2^32 space
    let extranonce_space: u64 = u64::from(u32::MAX) + 1;
    let span = extranonce_space.div_ceil(workers as u64);

    let outcome = std::thread::scope(|scope| {
        for w in 0..workers {
            let start = span * w as u64;
            let end = (start + span).min(extranonce_space);
            let block = template.clone();
            let halt = Arc::clone(&halt);
            let shutdown = Arc::clone(shutdown);
            let tx = tx.clone();
            scope.spawn(move || {
                worker_loop(block, threshold, start..end, &halt, &shutdown, &tx);
            });
        }
        drop(tx);

        let mut remaining = workers;
        loop {
            let now = Instant::now();
            if now >= deadline {
                halt.store(true, Ordering::Relaxed);
                return Ok(SearchOutcome::Timeout);
            }
            match rx.recv_timeout(deadline - now) {
                Ok(WorkerReport::Found {
                    extranonce,
                    nonce,
                    hash,
                }) => {
                    // First result wins; the rest are told to stop and
                    // their late results are discarded
                    halt.store(true, Ordering::Relaxed);
                    return Ok(SearchOutcome::Found {
                        extranonce,
                        nonce,
                        hash,
                    });
                }
                Ok(WorkerReport::Done) => {
                    remaining -= 1;
                    if remaining == 0 {
                        return if shutdown.load(Ordering::Relaxed) {
                            Ok(SearchOutcome::Cancelled)
                        } else if halt.load(Ordering::Relaxed) {
                            Ok(SearchOutcome::Timeout)
                        } else {
                            Ok(SearchOutcome::Exhausted)
                        };
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    halt.store(true, Ordering::Relaxed);
                    return Ok(SearchOutcome::Timeout);
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    // A worker died without reporting
                    halt.store(true, Ordering::Relaxed);
                    return Err(PowError::WorkerFailed);
                }
            }
        }
    });

    outcome
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open { until: Instant },
    HalfOpen { admitted: u32 },
}

/// Trips after consecutive worker failures; mining requests fail fast
/// while Open, then a few probes are admitted before closing again.
struct CircuitBreaker {
    state: BreakerState,
    consecutive_failures: u32,
}

impl CircuitBreaker {
    fn new() -> Self {
        CircuitBreaker {
            state: BreakerState::Closed,
            consecutive_failures: 0,
        }
    }

    fn admit(&mut self, now: Instant) -> Result<(), PowError> {
        match self.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open { until } => {
                if now < until {
                    Err(PowError::CircuitOpen(until - now))
                } else {
                    self.state = BreakerState::HalfOpen { admitted: 1 };
                    Ok(())
                }
            }
            BreakerState::HalfOpen { admitted } => {
                if admitted >= BREAKER_HALF_OPEN_PROBES {
                    Err(PowError::CircuitOpen(Duration::ZERO))
                } else {
                    self.state = BreakerState::HalfOpen {
                        admitted: admitted + 1,
                    };
                    Ok(())
                }
            }
        }
    }

    fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.state = BreakerState::Closed;
    }

    fn record_failure(&mut self, now: Instant) {
        self.consecutive_failures += 1;
        if matches!(self.state, BreakerState::HalfOpen { .. })
            || self.consecutive_failures >= BREAKER_TRIP_FAILURES
        {
            self.state = BreakerState::Open {
                until: now + BREAKER_COOLDOWN,
            };
        }
    }
}

/// Stateful front door for mining requests: owns the circuit breaker.
pub struct PowEngine {
    breaker: Mutex<CircuitBreaker>,
}

impl Default for PowEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PowEngine {
    pub fn new() -> Self {
        PowEngine {
            breaker: Mutex::new(CircuitBreaker::new()),
        }
    }

    /// Search for a valid nonce for `template`, honoring the breaker.
    pub fn mine(
        &self,
        template: &Block,
        difficulty_multiplier: u64,
        workers: usize,
        timeout: Duration,
        shutdown: &Arc<AtomicBool>,
    ) -> Result<SearchOutcome, PowError> {
        self.breaker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .admit(Instant::now())?;

        let target = compact_to_target(template.header.bits).ok_or(PowError::BadBits)?;
        let threshold = effective_target(target, difficulty_multiplier);

        let result = search(template, threshold, workers, timeout, shutdown);

        let mut breaker = self.breaker.lock().unwrap_or_else(|e| e.into_inner());
        match &result {
            Ok(_) => breaker.record_success(),
            Err(PowError::WorkerFailed) => breaker.record_failure(Instant::now()),
            Err(_) => {}
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::block::BlockHeader;
    use crate::primitives::coin::{ChainTag, CoinKind};
    use crate::primitives::transaction::{OutPoint, Transaction, TxInput, TxOutput};
    use crate::pow::target::MIN_DIFFICULTY_BITS;

    fn template(bits: u32) -> Block {
        let mut unlock_script = vec![0x01, 0x02];
        reserve_extranonce(&mut unlock_script);
        let coinbase = Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint::COINBASE,
                unlock_script,
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
        let header = BlockHeader {
            version: 1,
            previous_hash: Hash::ZERO,
            merkle_root: Block::compute_merkle_root(&transactions),
            timestamp: 1_735_689_600,
            bits,
            nonce: 0,
            height: 1,
            chain: ChainTag::Golden,
        };
        Block {
            header,
            transactions,
        }
    }

    #[test]
    fn test_search_finds_nonce_under_easy_target() {
        let block = template(MIN_DIFFICULTY_BITS);
        let threshold = compact_to_target(MIN_DIFFICULTY_BITS).unwrap();
        let shutdown = Arc::new(AtomicBool::new(false));

        let outcome = search(
            &block,
            threshold,
            2,
            Duration::from_secs(30),
            &shutdown,
        )
        .unwrap();

        let SearchOutcome::Found {
            extranonce,
            nonce,
            hash,
        } = outcome
        else {
            panic!("expected Found, got {outcome:?}");
        };
        assert!(hash_to_u256(&hash) < threshold);

        // The winning (extranonce, nonce) pair must reproduce the hash
        let mut solved = block.clone();
        apply_extranonce(&mut solved, extranonce).unwrap();
        solved.header.merkle_root = Block::compute_merkle_root(&solved.transactions);
        solved.header.nonce = nonce;
        assert_eq!(solved.hash(), hash);
        assert!(validate_header_pow(&solved.header, 1));
    }

    #[test]
    fn test_cancellation_is_prompt() {
        let block = template(MIN_DIFFICULTY_BITS);
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);

        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            flag.store(true, Ordering::Relaxed);
        });

        let started = Instant::now();
        // Impossible threshold: only cancellation can end the search
        let outcome = search(&block, U256::zero(), 2, Duration::from_secs(60), &shutdown).unwrap();
        assert_eq!(outcome, SearchOutcome::Cancelled);
        assert!(
            started.elapsed() < Duration::from_millis(200),
            "cancellation took {:?}",
            started.elapsed()
        );
    }

    #[test]
    fn test_timeout_outcome() {
        let block = template(MIN_DIFFICULTY_BITS);
        let shutdown = Arc::new(AtomicBool::new(false));
        let outcome = search(&block, U256::zero(), 2, Duration::from_millis(30), &shutdown).unwrap();
        assert_eq!(outcome, SearchOutcome::Timeout);
    }

    #[test]
    fn test_validate_rejects_hash_at_or_above_target() {
        let mut block = template(MIN_DIFFICULTY_BITS);
        // Find a nonce whose hash is above the minimum-difficulty target,
        // then check it fails under a multiplier that shrinks the target
        // below it.
        let threshold = compact_to_target(MIN_DIFFICULTY_BITS).unwrap();
        let shutdown = Arc::new(AtomicBool::new(false));
        let outcome = search(&block, threshold, 1, Duration::from_secs(30), &shutdown).unwrap();
        let SearchOutcome::Found {
            extranonce, nonce, ..
        } = outcome
        else {
            panic!("no solution");
        };
        apply_extranonce(&mut block, extranonce).unwrap();
        block.header.merkle_root = Block::compute_merkle_root(&block.transactions);
        block.header.nonce = nonce;
        assert!(validate_header_pow(&block.header, 1));
        // A 2^60 multiplier makes the threshold unreachably small
        assert!(!validate_header_pow(&block.header, 1 << 60));
    }

    #[test]
    fn test_missing_extranonce_slot_is_an_error() {
        let mut block = template(MIN_DIFFICULTY_BITS);
        block.transactions[0].inputs[0].unlock_script = vec![0x01];
        let shutdown = Arc::new(AtomicBool::new(false));
        assert!(matches!(
            search(&block, U256::one(), 1, Duration::from_secs(1), &shutdown),
            Err(PowError::NoExtranonceSlot)
        ));
    }

    #[test]
    fn test_breaker_trips_and_recovers() {
        let mut b = CircuitBreaker::new();
        let t0 = Instant::now();
        assert!(b.admit(t0).is_ok());

        for _ in 0..BREAKER_TRIP_FAILURES {
            b.record_failure(t0);
        }
        assert!(matches!(b.admit(t0), Err(PowError::CircuitOpen(_))));

        // After the cooldown the breaker half-opens and admits 3 probes
        let later = t0 + BREAKER_COOLDOWN + Duration::from_millis(1);
        assert!(b.admit(later).is_ok());
        assert!(b.admit(later).is_ok());
        assert!(b.admit(later).is_ok());
        assert!(matches!(b.admit(later), Err(PowError::CircuitOpen(_))));

        // A successful probe closes it again
        b.record_success();
        assert!(b.admit(later).is_ok());
    }

    #[test]
    fn test_breaker_reopens_on_half_open_failure() {
        let mut b = CircuitBreaker::new();
        let t0 = Instant::now();
        for _ in 0..BREAKER_TRIP_FAILURES {
            b.record_failure(t0);
        }
        let later = t0 + BREAKER_COOLDOWN + Duration::from_millis(1);
        assert!(b.admit(later).is_ok());
        b.record_failure(later);
        assert!(matches!(b.admit(later), Err(PowError::CircuitOpen(_))));
    }
}

// Proof-of-work: target arithmetic, retargeting, nonce search
pub mod engine;
pub mod retarget;
pub mod target;

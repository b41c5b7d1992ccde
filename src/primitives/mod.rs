// Consensus data structures and their canonical encodings
pub mod block;
pub mod codec;
pub mod coin;
pub mod transaction;

// Error taxonomy
//
// Every error surfaced across a module boundary carries one of the stable
// kind codes below. The codes are part of the external contract; the
// human-readable messages are not.

use crate::crypto::hash::Hash;

/// Closed set of surfaced error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed framing, bad checksum, bad varint, bad address format
    Encoding,
    /// Unknown command, oversize frame, message out of handshake order
    ProtocolViolation,
    /// Bad PoW, merkle, difficulty, timestamp, size, coinbase
    BlockInvalid,
    /// Structure, missing input, coin policy, conservation, signature
    TxInvalid,
    /// Parent not yet known; buffered, not a failure
    Orphan,
    /// Mempool / orphan pool / worker table full
    ResourceExhausted,
    /// Chain store invariants violated; fatal
    StorageCorrupt,
    /// Mining or peer I/O deadline expired
    Timeout,
}

impl ErrorKind {
    /// Stable wire/log code for this kind.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Encoding => "encoding",
            ErrorKind::ProtocolViolation => "protocol_violation",
            ErrorKind::BlockInvalid => "block_invalid",
            ErrorKind::TxInvalid => "tx_invalid",
            ErrorKind::Orphan => "orphan",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::StorageCorrupt => "storage_corrupt",
            ErrorKind::Timeout => "timeout",
        }
    }
}

/// Top-level error type returned by the node surface.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("encoding: {0}")]
    Encoding(&'static str),
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
    #[error("invalid block {hash}: {reason}")]
    BlockInvalid { hash: Hash, reason: String },
    #[error("invalid transaction: {0}")]
    TxInvalid(String),
    #[error("orphan block {0}: parent unknown")]
    Orphan(Hash),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),
    #[error("chain store corrupt: {0}")]
    StorageCorrupt(String),
    #[error("timed out: {0}")]
    Timeout(&'static str),
}

impl From<crate::store::StoreError> for NodeError {
    fn from(e: crate::store::StoreError) -> Self {
        NodeError::StorageCorrupt(e.to_string())
    }
}

impl NodeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NodeError::Encoding(_) => ErrorKind::Encoding,
            NodeError::Protocol(_) => ErrorKind::ProtocolViolation,
            NodeError::BlockInvalid { .. } => ErrorKind::BlockInvalid,
            NodeError::TxInvalid(_) => ErrorKind::TxInvalid,
            NodeError::Orphan(_) => ErrorKind::Orphan,
            NodeError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            NodeError::StorageCorrupt(_) => ErrorKind::StorageCorrupt,
            NodeError::Timeout(_) => ErrorKind::Timeout,
        }
    }

    /// Storage corruption is the only kind that takes the process down.
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::StorageCorrupt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_codes_are_stable() {
        assert_eq!(ErrorKind::Encoding.code(), "encoding");
        assert_eq!(ErrorKind::BlockInvalid.code(), "block_invalid");
        assert_eq!(ErrorKind::StorageCorrupt.code(), "storage_corrupt");
    }

    #[test]
    fn test_only_corruption_is_fatal() {
        assert!(NodeError::StorageCorrupt("bad tip".into()).is_fatal());
        assert!(!NodeError::Timeout("mining").is_fatal());
        assert!(!NodeError::Orphan(Hash::ZERO).is_fatal());
    }
}

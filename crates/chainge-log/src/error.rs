//! Error types for Chainge Log.

use chainge_log_core::CoreError;
use chainge_log_store::StoreError;
use thiserror::Error;

/// Errors that can occur during chain operations.
#[derive(Debug, Error)]
pub enum ChainError {
    /// Invalid construction options.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Operation needs an opened chain.
    #[error("chain is not ready")]
    NotReady,

    /// Index beyond the committed length.
    #[error("index {index} out of range (length {length})")]
    OutOfRange { index: u64, length: u64 },

    /// Append or truncate without a usable secret key.
    #[error("chain is not writable")]
    NotWritable,

    /// A supplied key does not match the chain's public key.
    #[error("key does not match the chain's public key")]
    InvalidKey,

    /// Signature or Merkle path invalid.
    #[error("verification failed: {0}")]
    Verification(CoreError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Operation on a closed chain or session.
    #[error("chain is closed")]
    Closed,

    /// A value could not be encoded or decoded.
    #[error("value encoding error: {0}")]
    Encoding(String),

    /// A stored block could not be sealed or opened with the encryption key.
    #[error("block encryption error: {0}")]
    Encryption(String),
}

impl From<CoreError> for ChainError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::OutOfRange { index, length } => ChainError::OutOfRange { index, length },
            CoreError::MissingNode(index) => {
                ChainError::Store(StoreError::NotFound(format!("tree node {index}")))
            }
            CoreError::Encoding(msg) | CoreError::Decoding(msg) => {
                ChainError::Store(StoreError::InvalidData(msg))
            }
            CoreError::Encryption(msg) => ChainError::Encryption(msg),
            e => ChainError::Verification(e),
        }
    }
}

/// Result type for chain operations.
pub type Result<T> = std::result::Result<T, ChainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_errors_map_to_taxonomy() {
        let err: ChainError = CoreError::OutOfRange {
            index: 4,
            length: 3,
        }
        .into();
        assert!(matches!(err, ChainError::OutOfRange { index: 4, length: 3 }));

        let err: ChainError = CoreError::InvalidSignature.into();
        assert!(matches!(err, ChainError::Verification(_)));

        let err: ChainError = CoreError::Conflict { index: 2 }.into();
        assert!(matches!(err, ChainError::Verification(_)));

        let err: ChainError = CoreError::Encryption("block 1".into()).into();
        assert!(matches!(err, ChainError::Encryption(_)));

        let err: ChainError = CoreError::MissingNode(6).into();
        assert!(matches!(err, ChainError::Store(StoreError::NotFound(_))));
    }
}

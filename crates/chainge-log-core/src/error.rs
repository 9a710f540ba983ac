//! Error types for Chainge Log Core.

use thiserror::Error;

/// Errors raised by tree computation, proof handling, and signing.
#[derive(Debug, Error)]
pub enum CoreError {
    /// An index or length lies past the committed tree.
    #[error("index {index} is out of range for length {length}")]
    OutOfRange { index: u64, length: u64 },

    /// A node needed for the computation is not held by this tree.
    #[error("missing tree node {0}")]
    MissingNode(u64),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid public key")]
    InvalidPublicKey,

    /// The proof is malformed, incomplete, or its hashes do not link up.
    #[error("invalid proof: {0}")]
    InvalidProof(String),

    /// Signed history under the same fork disagrees with local history.
    #[error("conflicting history at tree index {index}")]
    Conflict { index: u64 },

    /// A block could not be sealed or opened with the encryption key.
    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("decoding error: {0}")]
    Decoding(String),
}

impl CoreError {
    /// True for errors that mean a peer handed us bad data.
    pub fn is_verification_failure(&self) -> bool {
        matches!(
            self,
            CoreError::InvalidSignature
                | CoreError::InvalidPublicKey
                | CoreError::InvalidProof(_)
                | CoreError::Conflict { .. }
        )
    }
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

//! # Chainge Log Core
//!
//! Pure primitives for Chainge Log: flat-tree arithmetic, the signed Merkle
//! tree, proofs, and the persisted header model.
//!
//! This crate contains no I/O, no storage, no networking. It is pure computation
//! over cryptographic data structures.
//!
//! ## Key Types
//!
//! - [`MerkleTree`] - Sparse, signed Merkle tree over a chain's blocks
//! - [`TreeChangeset`] - A computed change, persisted before it is committed
//! - [`Proof`] / [`ProofRequest`] - What peers exchange to replicate a chain
//! - [`VerifyOutcome`] / [`ReorgDescriptor`] - Results of checking a proof
//! - [`Header`] - Signer key, tree summary, fork hints, and user data
//!
//! ## Hashing
//!
//! Leaves, parents, and root sets are hashed with Blake3 under distinct
//! one-byte prefixes. Blocks may be sealed at rest with an [`EncryptionKey`].
//! See [`crypto`].

pub mod crypto;
pub mod error;
pub mod flat;
pub mod header;
pub mod node;
pub mod proof;
pub mod tree;
pub mod verify;

pub use crypto::{
    signable, signer_matches, Blake3Hash, Ed25519PublicKey, Ed25519Signature, EncryptionKey,
    Keypair, SharedSigner, Signer, SEAL_OVERHEAD,
};
pub use error::CoreError;
pub use header::{Header, Hints, ReorgHint, SignerInfo, UserDataEntry, HEADER_VERSION};
pub use node::Node;
pub use proof::{BlockProof, BlockRequest, Proof, ProofRequest, UpgradeProof, UpgradeRequest};
pub use tree::{
    MerkleTree, TreeChangeset, TreeState, UpdateRange, VerifiedBlock, STATUS_APPENDED,
    STATUS_TRUNCATED,
};
pub use verify::{ReorgDescriptor, VerifyOutcome};

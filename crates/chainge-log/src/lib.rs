//! # Chainge Log
//!
//! A self-verifying, append-only log of blocks. Every head is committed under
//! a signed Merkle tree, so a replica holding only the public key can check
//! data from untrusted peers, including after the writer rewrites history.
//!
//! ## Overview
//!
//! - **Append**: the writer hashes new blocks, extends the tree, signs the new
//!   head and persists it
//! - **Verify**: a replica checks a peer's [`Proof`](core::Proof) against the
//!   public key and applies it, reorganizing when the writer forked
//! - **Sessions**: several handles share one chain, each with its own signer
//!   and value encoding; storage is released with the last one
//! - **Encryption**: with an [`EncryptionKey`] block contents are sealed at
//!   rest and on the wire; the tree commits to the sealed bytes
//!
//! ## Usage
//!
//! ```rust,no_run
//! use chainge_log::{Chain, ChainConfig, Utf8};
//! use chainge_log::store::MemoryStorage;
//! use std::sync::Arc;
//!
//! async fn example() {
//!     let chain: Chain<Utf8> =
//!         Chain::open(ChainConfig::new().storage(Arc::new(MemoryStorage::new())))
//!             .await
//!             .unwrap();
//!
//!     let first = chain
//!         .append(&["hello".to_string(), "world".to_string()])
//!         .await
//!         .unwrap();
//!     assert_eq!(first, 0);
//!     assert_eq!(chain.get(1).await.unwrap(), "world");
//!
//!     chain.close().await.unwrap();
//! }
//! ```
//!
//! ## Re-exports
//!
//! This crate re-exports the component crates for convenience:
//!
//! - `chainge_log::core` - Merkle tree, proofs, header model, signing
//! - `chainge_log::store` - Storage abstraction, SQLite and in-memory backends

pub mod chain;
mod chain_core;
pub mod config;
pub mod encoding;
pub mod error;
pub mod events;
mod session;
pub mod snapshot;

// Re-export component crates
pub use chainge_log_core as core;
pub use chainge_log_store as store;

// Re-export main types for convenience
pub use chain::{Chain, ChainInfo, ChainRef};
pub use chain_core::UpdateStatus;
pub use config::{
    ChainConfig, Preload, PreloadFuture, PreloadHook, SessionOptions, SessionPreloadFuture,
    SessionPreloadHook,
};
pub use encoding::{Encoding, Json, Raw, Utf8};
pub use error::{ChainError, Result};
pub use events::{ChainEvent, PeerId, Update, UpdateHook};
pub use snapshot::Snapshot;

// Re-export commonly used core types
pub use chainge_log_core::{
    Blake3Hash, Ed25519PublicKey, Ed25519Signature, EncryptionKey, Header, Keypair, Proof, ProofRequest,
    ReorgDescriptor, SharedSigner, Signer, UpdateRange, STATUS_APPENDED, STATUS_TRUNCATED,
};

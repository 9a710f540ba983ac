//! # Chainge Log Store
//!
//! Storage abstraction for Chainge Log. Provides a byte-range interface over
//! named regions with SQLite and in-memory implementations, plus the
//! region-level stores a chain reads and writes through.
//!
//! ## Overview
//!
//! A chain persists into four regions (see [`Region`]): block bytes, tree
//! node records, block presence, and the header. The [`Storage`] trait only
//! knows about byte ranges; [`BlockStore`], [`TreeStore`], [`Bitfield`] and
//! [`HeaderStore`] give those bytes meaning.
//!
//! ## Key Types
//!
//! - [`Storage`] - The async trait for byte-range access
//! - [`SqliteStorage`] - SQLite-based persistent storage
//! - [`MemoryStorage`] - In-memory storage for tests
//!
//! ## Usage
//!
//! ```rust,no_run
//! use chainge_log_store::{HeaderStore, SqliteStorage, Storage};
//! use std::sync::Arc;
//!
//! async fn example() {
//!     let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::open("chain.db").unwrap());
//!     let headers = HeaderStore::new(storage.clone());
//!     let header = headers.load().await.unwrap();
//!     assert!(header.is_none());
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Zero means absent**: deleted ranges read back as zeros; a deleted tree
//!   record is indistinguishable from one never written.
//! - **Single-write header**: the header is persisted in one write, which is
//!   the commit point of every chain mutation.

pub mod bitfield;
pub mod blocks;
pub mod error;
pub mod header_store;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;
pub mod tree_store;

pub use bitfield::Bitfield;
pub use blocks::BlockStore;
pub use error::{Result, StoreError};
pub use header_store::HeaderStore;
pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;
pub use traits::{Region, Storage, StorageExt};
pub use tree_store::{TreeStore, NODE_RECORD_SIZE};

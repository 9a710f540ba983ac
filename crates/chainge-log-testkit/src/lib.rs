//! # Chainge Log Testkit
//!
//! Testing utilities for Chainge Log.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: memory-backed writers and replicas, reopening, proof sync helpers
//! - **Generators**: Proptest strategies for property-based testing
//! - **Faults**: storage that fails writes to chosen regions
//!
//! ## Test Fixtures
//!
//! Quickly set up a writer and a replica holding only its public key:
//!
//! ```rust,no_run
//! use chainge_log_testkit::fixtures::{sync_upgrade, TestFixture};
//!
//! async fn example() {
//!     let fixture = TestFixture::new();
//!     let writer = fixture.open_writer::<chainge_log::Raw>().await.unwrap();
//!     let replica = fixture.open_replica::<chainge_log::Raw>().await.unwrap();
//!
//!     writer.append(&[b"hello".to_vec()]).await.unwrap();
//!     sync_upgrade(&writer, &replica).await.unwrap();
//!     assert_eq!(replica.info().await.unwrap().length, 1);
//! }
//! ```
//!
//! ## Property Testing
//!
//! Use the generators with proptest:
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use chainge_log_testkit::generators::ChainOp;
//!
//! proptest! {
//!     #[test]
//!     fn ops_never_panic(ops in prop::collection::vec(any::<ChainOp>(), 0..20)) {
//!         // apply ops to a chain
//!     }
//! }
//! ```

pub mod faults;
pub mod fixtures;
pub mod generators;

pub use faults::FaultyStorage;
pub use fixtures::{random_peer, sync_block, sync_upgrade, TestFixture};
pub use generators::{apply_ops, blocks, ChainOp};

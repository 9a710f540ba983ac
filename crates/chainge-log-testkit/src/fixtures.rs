//! Test fixtures and helpers.
//!
//! Common setup code for integration tests.

use std::sync::Arc;

use chainge_log::core::{flat, Keypair, ProofRequest};
use chainge_log::store::MemoryStorage;
use chainge_log::{Chain, ChainConfig, Encoding, PeerId, Result, UpdateStatus};
use rand::Rng;

/// A writer keypair with separate in-memory storage for a writer and a replica.
///
/// Memory storage keeps its data across [`Chain::close`], so opening again
/// from the same fixture reopens the same chain.
pub struct TestFixture {
    pub keypair: Keypair,
    pub writer_storage: Arc<MemoryStorage>,
    pub replica_storage: Arc<MemoryStorage>,
}

impl TestFixture {
    /// Create a new test fixture with a random keypair.
    pub fn new() -> Self {
        Self::with_keypair(Keypair::generate())
    }

    /// Create with a deterministic keypair from seed.
    pub fn with_seed(seed: [u8; 32]) -> Self {
        Self::with_keypair(Keypair::from_seed(&seed))
    }

    fn with_keypair(keypair: Keypair) -> Self {
        Self {
            keypair,
            writer_storage: Arc::new(MemoryStorage::new()),
            replica_storage: Arc::new(MemoryStorage::new()),
        }
    }

    pub fn public_key(&self) -> chainge_log::Ed25519PublicKey {
        self.keypair.public_key()
    }

    /// Config for the writer: its storage and the full keypair.
    pub fn writer_config(&self) -> ChainConfig {
        ChainConfig::new()
            .storage(self.writer_storage.clone())
            .key_pair(self.keypair.clone())
    }

    /// Config for a replica: its own storage and only the public key.
    pub fn replica_config(&self) -> ChainConfig {
        ChainConfig::new()
            .storage(self.replica_storage.clone())
            .public_key(self.public_key())
    }

    /// Open (or reopen) the writer.
    pub async fn open_writer<E: Encoding>(&self) -> Result<Chain<E>> {
        Chain::open(self.writer_config()).await
    }

    /// Open (or reopen) the replica.
    pub async fn open_replica<E: Encoding>(&self) -> Result<Chain<E>> {
        Chain::open(self.replica_config()).await
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// A random peer token.
pub fn random_peer() -> PeerId {
    PeerId::from_bytes(rand::thread_rng().gen())
}

/// Bring `replica` up to the writer's head with an upgrade proof.
///
/// A replica on another fork is sent the whole tree.
pub async fn sync_upgrade<W: Encoding, R: Encoding>(
    writer: &Chain<W>,
    replica: &Chain<R>,
) -> Result<UpdateStatus> {
    let head = writer.info().await?;
    let local = replica.info().await?;

    let start = if local.fork == head.fork {
        local.length.min(head.length)
    } else {
        0
    };
    let proof = writer
        .proof(&ProofRequest::upgrade(start, head.length - start))
        .await?;
    replica.verify(&proof, None).await
}

/// Send block `index` with its value, upgrading the replica if needed.
pub async fn sync_block<W: Encoding, R: Encoding>(
    writer: &Chain<W>,
    replica: &Chain<R>,
    index: u64,
) -> Result<UpdateStatus> {
    let head = writer.info().await?;
    let local = replica.info().await?;

    let nodes = replica.missing_nodes(flat::leaf(index)).await?;
    let mut request = ProofRequest::block(index, u32::try_from(nodes).unwrap_or(0), true);
    if local.length <= index && local.fork == head.fork {
        request = request.with_upgrade(local.length, head.length - local.length);
    }

    let proof = writer.proof(&request).await?;
    replica.verify(&proof, None).await
}

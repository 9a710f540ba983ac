//! The shared chain state every handle operates on.
//!
//! ## Overview
//!
//! [`ChainCore`] owns the storage, the in-memory [`MerkleTree`] and the
//! [`Header`]. Mutations run one at a time through the write queue and follow
//! validate-then-commit ordering:
//!
//! 1. compute a [`TreeChangeset`] against a snapshot of the tree
//! 2. write blocks, nodes and block presence
//! 3. persist the header (the commit point)
//! 4. commit in memory, then notify observers
//! 5. reclaim space left over from dropped history
//!
//! A failure before step 3 leaves the persisted header and the in-memory
//! state as they were. Step 2 never clears what the committed head still
//! needs: truncation clears presence only in step 5, and a verified update
//! that overwrites live records puts them back when its header fails to
//! persist. Reads take a point-in-time view of the tree and never wait on
//! the write queue.
//!
//! With an [`EncryptionKey`], blocks are sealed before they are hashed and
//! stored, and opened again on read. Proofs carry the sealed bytes.

use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bytes::Bytes;
use chainge_log_core::{
    signer_matches, Blake3Hash, Ed25519PublicKey, EncryptionKey, Header, Keypair, MerkleTree,
    Node, Proof, ProofRequest, ReorgDescriptor, SharedSigner, TreeChangeset, TreeState,
    UpdateRange, VerifyOutcome,
};
use chainge_log_store::{Bitfield, BlockStore, HeaderStore, Storage, StoreError, TreeStore};
use tokio::sync::{Mutex, MutexGuard};

use crate::config::ResolvedConfig;
use crate::error::{ChainError, Result};
use crate::events::{ChainEvent, Notifier, PeerId, Update};

/// Outcome of [`Chain::verify`](crate::Chain::verify) and
/// [`Chain::reorg`](crate::Chain::reorg).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateStatus {
    /// Applied; carries the status mask and the affected range.
    Applied {
        status: u8,
        range: Option<UpdateRange>,
    },
    /// Nothing new, or built against a state this chain has moved past.
    Stale,
}

impl UpdateStatus {
    pub fn status(&self) -> u8 {
        match self {
            UpdateStatus::Applied { status, .. } => *status,
            UpdateStatus::Stale => 0,
        }
    }

    pub fn range(&self) -> Option<UpdateRange> {
        match self {
            UpdateStatus::Applied { range, .. } => *range,
            UpdateStatus::Stale => None,
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, UpdateStatus::Stale)
    }
}

struct CoreState {
    tree: MerkleTree,
    header: Header,
}

/// Records a staged update overwrote, written back if its header fails.
#[derive(Default)]
struct Rollback {
    replaced: Vec<Node>,
    absent: Vec<u64>,
    presence: Vec<(u64, Vec<u8>)>,
    presence_size: u64,
}

impl Rollback {
    /// Prior state of the node records about to be written.
    fn nodes(tree: &MerkleTree, written: &[Node]) -> Self {
        let mut rollback = Self::default();
        for node in written {
            match tree.get(node.index) {
                Some(old) if old == node => {}
                Some(old) => rollback.replaced.push(*old),
                None => rollback.absent.push(node.index),
            }
        }
        rollback
    }
}

pub(crate) struct ChainCore {
    storage: Arc<dyn Storage>,
    blocks: BlockStore,
    tree_store: TreeStore,
    bitfield: Bitfield,
    headers: HeaderStore,
    public_key: Ed25519PublicKey,
    /// Signer of handles that were not given their own key.
    signer: Option<SharedSigner>,
    encryption_key: Option<EncryptionKey>,
    queue: Mutex<()>,
    state: RwLock<CoreState>,
    closed: AtomicBool,
    notifier: Arc<Notifier>,
}

impl ChainCore {
    /// Load or create the header and rebuild the tree.
    pub async fn open(config: ResolvedConfig, notifier: Arc<Notifier>) -> Result<Self> {
        let storage = config.storage;
        let headers = HeaderStore::new(storage.clone());
        let tree_store = TreeStore::new(storage.clone());

        let mut key_pair = config.key_pair;
        let mut dirty = false;

        let mut header = match headers.load().await? {
            Some(header) => {
                if let Some(public_key) = &config.public_key {
                    if *public_key != header.signer.public_key {
                        return Err(ChainError::InvalidKey);
                    }
                }
                header
            }
            None => {
                if key_pair.is_none() && config.public_key.is_none() && config.signer.is_none() {
                    key_pair = Some(Keypair::generate());
                }
                let public_key = config
                    .public_key
                    .or_else(|| key_pair.as_ref().map(Keypair::public_key))
                    .ok_or_else(|| {
                        ChainError::Config("a custom signer needs a public key".into())
                    })?;
                dirty = true;
                Header::new(public_key, None)
            }
        };
        let public_key = header.signer.public_key;

        if let Some(key_pair) = &key_pair {
            if key_pair.public_key() != public_key {
                return Err(ChainError::InvalidKey);
            }
            if header.signer.secret_key.is_none() {
                header.signer.secret_key = Some(key_pair.seed());
                dirty = true;
            }
        }

        let signer: Option<SharedSigner> = match config.signer {
            Some(signer) => {
                if !signer_matches(signer.as_ref(), &public_key) {
                    return Err(ChainError::InvalidKey);
                }
                Some(signer)
            }
            None => key_pair
                .or_else(|| header.signer.keypair())
                .map(|k| Arc::new(k) as SharedSigner),
        };

        for (key, value) in config.user_data {
            header.set_user_data(&key, Some(value));
            dirty = true;
        }

        let nodes = tree_store.load().await?;
        let tree = MerkleTree::open(&header.tree, nodes)?;

        if dirty {
            headers.save(&header).await?;
        }

        // Presence past the head is left over from an interrupted truncate.
        let bitfield = Bitfield::new(storage.clone());
        bitfield.truncate(tree.length()).await?;

        tracing::info!(
            public_key = ?public_key,
            length = tree.length(),
            fork = tree.fork(),
            writable = signer.is_some(),
            encrypted = config.encryption_key.is_some(),
            "chain opened"
        );

        Ok(Self {
            blocks: BlockStore::new(storage.clone()),
            bitfield,
            storage,
            tree_store,
            headers,
            public_key,
            signer,
            encryption_key: config.encryption_key,
            queue: Mutex::new(()),
            state: RwLock::new(CoreState { tree, header }),
            closed: AtomicBool::new(false),
            notifier,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn public_key(&self) -> Ed25519PublicKey {
        self.public_key
    }

    pub fn default_signer(&self) -> Option<SharedSigner> {
        self.signer.clone()
    }

    pub fn tree_state(&self) -> TreeState {
        self.read().tree.state()
    }

    pub fn header(&self) -> Header {
        self.read().header.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn read(&self) -> RwLockReadGuard<'_, CoreState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, CoreState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ChainError::Closed);
        }
        Ok(())
    }

    /// Take the write queue, failing once the chain closed.
    async fn lock_queue(&self) -> Result<MutexGuard<'_, ()>> {
        let guard = self.queue.lock().await;
        self.ensure_open()?;
        Ok(guard)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────────

    /// Block bytes at `index`, opened with the encryption key if there is one.
    ///
    /// A replica that has not stored the block yet fails with
    /// [`StoreError::NotFound`].
    pub async fn get(&self, index: u64) -> Result<Bytes> {
        let stored = self.get_stored(index).await?;
        match &self.encryption_key {
            Some(key) => Ok(Bytes::from(key.open(index, &stored)?)),
            None => Ok(stored),
        }
    }

    /// Block bytes at `index` as they are stored and hashed.
    async fn get_stored(&self, index: u64) -> Result<Bytes> {
        self.ensure_open()?;
        let (offset, size) = {
            let state = self.read();
            (
                state.tree.byte_offset(index)?,
                state.tree.block_size(index)?,
            )
        };

        if !self.bitfield.get(index).await? {
            return Err(StoreError::NotFound(format!("block {index}")).into());
        }
        Ok(self.blocks.get(offset, size).await?)
    }

    pub async fn has(&self, index: u64) -> Result<bool> {
        self.ensure_open()?;
        if index >= self.read().tree.length() {
            return Ok(false);
        }
        Ok(self.bitfield.get(index).await?)
    }

    pub fn tree_hash(&self, length: u64) -> Result<Blake3Hash> {
        self.ensure_open()?;
        Ok(self.read().tree.tree_hash(length)?)
    }

    pub fn missing_nodes(&self, index: u64) -> Result<u64> {
        self.ensure_open()?;
        Ok(self.read().tree.missing_nodes(index))
    }

    /// Build a proof, filling the block value from storage when requested.
    pub async fn proof(&self, request: &ProofRequest) -> Result<Proof> {
        self.ensure_open()?;
        let mut proof = self.read().tree.proof(request)?;

        if let (Some(wanted), Some(block)) = (&request.block, &mut proof.block) {
            if wanted.value {
                block.value = Some(self.get_stored(block.index).await?);
            }
        }
        Ok(proof)
    }

    pub fn get_user_data(&self, key: &str) -> Result<Option<Bytes>> {
        self.ensure_open()?;
        Ok(self.read().header.get_user_data(key).cloned())
    }

    /// Classify a proof without applying it.
    pub fn check(&self, proof: &Proof) -> Result<VerifyOutcome> {
        self.ensure_open()?;
        Ok(self.read().tree.verify(proof, &self.public_key)?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Local mutations
    // ─────────────────────────────────────────────────────────────────────────

    /// Append encoded blocks; returns the index of the first one.
    pub async fn append(&self, signer: Option<SharedSigner>, blocks: &[Vec<u8>]) -> Result<u64> {
        let signer = signer.ok_or(ChainError::NotWritable)?;
        let _queue = self.lock_queue().await?;
        if blocks.is_empty() {
            return Ok(self.read().tree.length());
        }

        let blocks = self.seal(blocks)?;
        let (mut cs, mut header, offset) = {
            let state = self.read();
            (
                state.tree.append(&*blocks),
                state.header.clone(),
                state.tree.byte_length(),
            )
        };
        let first = cs.from_length;

        cs.sign(signer.as_ref());

        self.blocks.append(offset, &*blocks).await?;
        self.tree_store.put(&cs.nodes).await?;
        self.bitfield.set_range(first, cs.length - first, true).await?;

        header.tree = cs.state();
        self.headers.save(&header).await?;

        tracing::debug!(first, count = blocks.len(), length = cs.length, "appended");
        self.commit(cs, header, None, None);
        Ok(first)
    }

    /// Blocks as they will be stored: sealed under the next indices when the
    /// chain encrypts. Caller holds the queue.
    fn seal<'a>(&self, blocks: &'a [Vec<u8>]) -> Result<Cow<'a, [Vec<u8>]>> {
        let Some(key) = &self.encryption_key else {
            return Ok(Cow::Borrowed(blocks));
        };
        let (first, fork) = {
            let state = self.read();
            (state.tree.length(), state.tree.fork())
        };
        let sealed = blocks
            .iter()
            .zip(first..)
            .map(|(block, index)| key.seal(index, fork, block))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Cow::Owned(sealed))
    }

    /// Cut the chain to `length` blocks under `fork`.
    pub async fn truncate(
        &self,
        signer: Option<SharedSigner>,
        length: u64,
        fork: u64,
    ) -> Result<()> {
        let signer = signer.ok_or(ChainError::NotWritable)?;
        let _queue = self.lock_queue().await?;

        let (mut cs, mut header) = {
            let state = self.read();
            (state.tree.truncate(length, fork)?, state.header.clone())
        };
        cs.sign(signer.as_ref());

        header.tree = cs.state();
        if fork != cs.from_fork {
            header.add_reorg_hint(cs.from_fork, fork, length);
        }
        self.headers.save(&header).await?;

        tracing::info!(
            from_length = cs.from_length,
            length,
            from_fork = cs.from_fork,
            fork,
            "truncated"
        );

        let dropped = cs.dropped.clone();
        let byte_length = cs.byte_length;
        self.commit(cs, header, None, None);

        if let Err(e) = self.bitfield.truncate(length).await {
            tracing::warn!(error = %e, "failed to clear truncated block presence");
        }
        if let Err(e) = self.tree_store.delete(&dropped).await {
            tracing::warn!(error = %e, "failed to reclaim dropped tree nodes");
        }
        if let Err(e) = self.blocks.truncate(byte_length).await {
            tracing::warn!(error = %e, "failed to reclaim truncated blocks");
        }
        Ok(())
    }

    /// Upsert (or with `None` delete) a header user data entry.
    pub async fn set_user_data(&self, key: &str, value: Option<Bytes>) -> Result<()> {
        let _queue = self.lock_queue().await?;

        let mut header = self.read().header.clone();
        header.set_user_data(key, value);
        self.headers.save(&header).await?;

        self.write().header = header;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Remote mutations
    // ─────────────────────────────────────────────────────────────────────────

    /// Verify a proof and apply it, reorganizing onto a newer fork if needed.
    pub async fn verify(&self, proof: &Proof, from: Option<PeerId>) -> Result<UpdateStatus> {
        // Invalid and stale proofs are rejected without queueing.
        if let VerifyOutcome::Stale = self.check(proof)? {
            tracing::debug!(fork = proof.fork, "stale proof");
            return Ok(UpdateStatus::Stale);
        }

        let _queue = self.lock_queue().await?;
        let outcome = self.read().tree.verify(proof, &self.public_key)?;
        let cs = match outcome {
            VerifyOutcome::Accepted(cs) => cs,
            VerifyOutcome::Reorg(descriptor) => {
                let planned = self.read().tree.reorg(&descriptor, &self.public_key)?;
                match planned {
                    Some(cs) => cs,
                    None => return Ok(UpdateStatus::Stale),
                }
            }
            VerifyOutcome::Stale => {
                tracing::debug!(fork = proof.fork, "proof went stale while queued");
                return Ok(UpdateStatus::Stale);
            }
        };
        self.apply(cs, from).await
    }

    /// The reorg a proof implies, if it is signed under a newer fork.
    pub fn compute_reorg(&self, proof: &Proof) -> Result<Option<ReorgDescriptor>> {
        match self.check(proof)? {
            VerifyOutcome::Reorg(descriptor) => Ok(Some(descriptor)),
            _ => Ok(None),
        }
    }

    /// Apply a reorg computed by [`Self::compute_reorg`].
    pub async fn reorg(
        &self,
        descriptor: &ReorgDescriptor,
        from: Option<PeerId>,
    ) -> Result<UpdateStatus> {
        let _queue = self.lock_queue().await?;
        let cs = self.read().tree.reorg(descriptor, &self.public_key)?;
        match cs {
            Some(cs) => self.apply(cs, from).await,
            None => {
                tracing::debug!(fork = descriptor.fork, "reorg computed against an older state");
                Ok(UpdateStatus::Stale)
            }
        }
    }

    /// Persist and commit a verified changeset. Caller holds the queue.
    async fn apply(&self, cs: TreeChangeset, from: Option<PeerId>) -> Result<UpdateStatus> {
        let mut written = cs.nodes.clone();
        written.extend_from_slice(&cs.roots);

        let (mut next, mut header, mut rollback) = {
            let state = self.read();
            (
                state.tree.clone(),
                state.header.clone(),
                Rollback::nodes(&state.tree, &written),
            )
        };
        next.commit(cs.clone());

        let stored = match &cs.block {
            Some(block) => match &block.value {
                Some(value) => Some((block.index, next.byte_offset(block.index)?, value.clone())),
                None => None,
            },
            None => None,
        };

        // A block past the shared prefix may land on bytes of the dropped
        // history, so it is only written once the header is persisted.
        let replaces_dropped = cs.truncated()
            && stored
                .as_ref()
                .is_some_and(|(index, ..)| *index >= cs.ancestors);
        let (early, late) = if replaces_dropped {
            (None, stored.clone())
        } else {
            (stored.clone(), None)
        };

        rollback.presence_size = self.bitfield.size().await?;
        if cs.truncated() {
            let start = cs.ancestors;
            let saved = self.bitfield.snapshot(start, cs.from_length - start).await?;
            rollback.presence.push((start, saved));
        }
        if let Some((index, ..)) = &early {
            rollback
                .presence
                .push((*index, self.bitfield.snapshot(*index, 1).await?));
        }

        header.tree = cs.state();
        if cs.fork != cs.from_fork {
            header.add_reorg_hint(cs.from_fork, cs.fork, cs.ancestors);
        }

        if let Err(e) = self.persist(&cs, &written, early.as_ref(), &header).await {
            self.roll_back(rollback).await;
            return Err(e);
        }

        if cs.fork != cs.from_fork {
            tracing::info!(
                from_fork = cs.from_fork,
                fork = cs.fork,
                ancestors = cs.ancestors,
                length = cs.length,
                "reorganized onto new fork"
            );
        } else {
            tracing::debug!(length = cs.length, block = ?cs.block.as_ref().map(|b| b.index), "verified");
        }

        let status = cs.status();
        let range = cs.range();
        let reclaim: Vec<u64> = cs
            .dropped
            .iter()
            .copied()
            .filter(|index| next.get(*index).is_none())
            .collect();
        self.commit(cs, header, stored.map(|(_, _, value)| value), from);

        if let Some((index, offset, value)) = &late {
            if let Err(e) = self.store_block(*index, *offset, value).await {
                tracing::warn!(error = %e, index, "failed to store verified block");
            }
        }
        if !reclaim.is_empty() {
            if let Err(e) = self.tree_store.delete(&reclaim).await {
                tracing::warn!(error = %e, "failed to reclaim dropped tree nodes");
            }
        }
        Ok(UpdateStatus::Applied { status, range })
    }

    /// Write a verified changeset's records, then its header.
    async fn persist(
        &self,
        cs: &TreeChangeset,
        nodes: &[Node],
        block: Option<&(u64, u64, Bytes)>,
        header: &Header,
    ) -> Result<()> {
        if cs.truncated() {
            self.bitfield
                .set_range(cs.ancestors, cs.from_length - cs.ancestors, false)
                .await?;
        }
        if let Some((index, offset, value)) = block {
            self.store_block(*index, *offset, value).await?;
        }
        self.tree_store.put(nodes).await?;
        self.headers.save(header).await?;
        Ok(())
    }

    async fn store_block(&self, index: u64, offset: u64, value: &[u8]) -> Result<()> {
        self.blocks.put(offset, value).await?;
        self.bitfield.set_range(index, 1, true).await?;
        Ok(())
    }

    /// Put back what a failed [`Self::persist`] overwrote.
    async fn roll_back(&self, rollback: Rollback) {
        let restored = async {
            self.tree_store.delete(&rollback.absent).await?;
            self.tree_store.put(&rollback.replaced).await?;
            for (start, bytes) in rollback.presence.iter().rev() {
                self.bitfield.restore(*start, bytes).await?;
            }
            self.bitfield.truncate(rollback.presence_size).await
        };
        match restored.await {
            Ok(()) => tracing::debug!("rolled back a failed update"),
            Err(e) => tracing::warn!(error = %e, "failed to roll back a failed update"),
        }
    }

    /// Commit in memory and notify. Caller holds the queue.
    fn commit(
        &self,
        cs: TreeChangeset,
        header: Header,
        value: Option<Bytes>,
        from: Option<PeerId>,
    ) {
        let update = Update {
            status: cs.status(),
            range: cs.range(),
            value,
            from,
        };
        let forked = cs.truncated() || cs.fork != cs.from_fork;
        let truncate = forked.then_some(ChainEvent::Truncate {
            ancestors: cs.ancestors,
            fork: cs.fork,
        });
        let append = update.appended().then_some(ChainEvent::Append {
            length: cs.length,
            byte_length: cs.byte_length,
        });

        {
            let mut state = self.write();
            state.tree.commit(cs);
            state.header = header;
        }

        self.notifier.update(&update);
        if let Some(event) = truncate {
            self.notifier.emit(event);
        }
        if let Some(event) = append {
            self.notifier.emit(event);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Teardown
    // ─────────────────────────────────────────────────────────────────────────

    /// Wait for in-flight mutations, then release storage.
    pub async fn close(&self) -> Result<()> {
        let _queue = self.queue.lock().await;
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.storage.close().await?;
        tracing::info!(public_key = ?self.public_key, "chain closed");
        Ok(())
    }
}

/// Check a session key against the chain's public key.
pub(crate) fn session_signer(
    public_key: &Ed25519PublicKey,
    key_pair: Option<Keypair>,
    signer: Option<SharedSigner>,
) -> Result<Option<SharedSigner>> {
    if let Some(signer) = signer {
        if !signer_matches(signer.as_ref(), public_key) {
            return Err(ChainError::InvalidKey);
        }
        return Ok(Some(signer));
    }
    if let Some(key_pair) = key_pair {
        if key_pair.public_key() != *public_key {
            return Err(ChainError::InvalidKey);
        }
        return Ok(Some(Arc::new(key_pair)));
    }
    Ok(None)
}

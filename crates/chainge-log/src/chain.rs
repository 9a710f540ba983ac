//! The Chain handle: the public API over a shared chain core.
//!
//! ## Overview
//!
//! A [`Chain`] moves through `Uninitialized -> Opening -> Ready -> Closed`.
//! [`Chain::new`] only records the configuration; the first operation (or an
//! explicit [`Chain::ready`]) resolves it and opens storage. Concurrent opens
//! share one in-flight attempt.
//!
//! Every handle, root or session, reads and writes the same core. Handles
//! differ in how they sign and in their value [`Encoding`].
//!
//! A chain whose configuration names another chain through a [`ChainRef`]
//! does not open storage: it joins that chain's handles when it resolves,
//! opening the other chain first if needed.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use chainge_log_core::{
    Blake3Hash, Ed25519PublicKey, Header, Proof, ProofRequest, ReorgDescriptor, SharedSigner,
};
use tokio::sync::{broadcast, OnceCell};

use crate::chain_core::{session_signer, ChainCore, UpdateStatus};
use crate::config::{ChainConfig, Inherited, Resolution, SessionOptions};
use crate::encoding::{Encoding, Raw};
use crate::error::{ChainError, Result};
use crate::events::{ChainEvent, Notifier, PeerId, UpdateHook};
use crate::session::{HandleState, Release, Sessions};
use crate::snapshot::Snapshot;

/// Summary of an opened chain as seen from one handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainInfo {
    pub public_key: Ed25519PublicKey,
    pub length: u64,
    pub byte_length: u64,
    pub fork: u64,
    /// True if this handle can append and truncate.
    pub writable: bool,
}

/// State shared by every handle of one chain.
struct Shared {
    core: Arc<ChainCore>,
    sessions: Sessions,
    notifier: Arc<Notifier>,
    auto_close: bool,
    teardown: OnceCell<()>,
}

impl Shared {
    fn new(core: ChainCore, notifier: Arc<Notifier>, auto_close: bool) -> Self {
        Self {
            core: Arc::new(core),
            sessions: Sessions::new(notifier.clone()),
            notifier,
            auto_close,
            teardown: OnceCell::new(),
        }
    }

    /// Release storage, once.
    async fn teardown(&self) -> Result<()> {
        let mut failure = None;
        let slot = &mut failure;
        self.teardown
            .get_or_init(move || async move {
                if let Err(e) = self.core.close().await {
                    *slot = Some(e);
                }
            })
            .await;
        failure.map_or(Ok(()), Err)
    }

    /// Finish closing `handle` according to `release`.
    async fn settle(&self, handle: &HandleState, release: Release) -> Result<()> {
        match release {
            Release::Keep => {
                handle.finish(&self.notifier, false);
                Ok(())
            }
            Release::Teardown => {
                let result = self.teardown().await;
                handle.finish(&self.notifier, true);
                result
            }
            Release::AutoClose(last) => {
                let mut failure = None;
                let slot = &mut failure;
                let survivor = last.clone();
                last.closed
                    .get_or_init(move || async move {
                        let teardown =
                            matches!(self.sessions.release(survivor.id, false), Release::Teardown);
                        if teardown {
                            if let Err(e) = self.teardown().await {
                                *slot = Some(e);
                            }
                        }
                        survivor.finish(&self.notifier, teardown);
                    })
                    .await;
                handle.finish(&self.notifier, false);
                failure.map_or(Ok(()), Err)
            }
        }
    }
}

type SharedFuture<'a> = Pin<Box<dyn Future<Output = Result<Arc<Shared>>> + Send + 'a>>;

/// One handle and the chain it is bound to.
///
/// A handle made by [`Chain::new`] binds on first use: it opens storage, or
/// joins the chain its configuration inherits from. Sessions are bound from
/// the start.
struct Link {
    handle: Arc<HandleState>,
    config: Option<ChainConfig>,
    /// Hook slot of the chain this handle opens; replaced by the joined
    /// chain's when inheriting.
    notifier: Arc<Notifier>,
    shared: OnceCell<Arc<Shared>>,
}

impl Link {
    fn unbound(config: ChainConfig) -> Self {
        Self {
            handle: HandleState::unbound(),
            config: Some(config),
            notifier: Arc::new(Notifier::new()),
            shared: OnceCell::new(),
        }
    }

    fn bound(handle: Arc<HandleState>, shared: Arc<Shared>) -> Self {
        Self {
            handle,
            config: None,
            notifier: shared.notifier.clone(),
            shared: OnceCell::new_with(Some(shared)),
        }
    }

    /// The chain this handle operates on, binding it on first use.
    async fn shared(&self) -> Result<&Arc<Shared>> {
        if self.handle.closed.initialized() {
            return Err(ChainError::Closed);
        }
        let shared = self.shared.get_or_try_init(|| self.bind()).await?;
        if shared.sessions.is_torn_down() {
            return Err(ChainError::Closed);
        }
        Ok(shared)
    }

    /// Boxed [`Self::shared`], for binding through another handle.
    fn shared_boxed(&self) -> SharedFuture<'_> {
        Box::pin(async move { self.shared().await.cloned() })
    }

    async fn bind(&self) -> Result<Arc<Shared>> {
        let config = self.config.clone().ok_or(ChainError::Closed)?;
        let auto_close = config.auto_close;

        match config.resolve().await? {
            Resolution::Open(resolved) => {
                let core = ChainCore::open(resolved, self.notifier.clone()).await?;
                let shared = Arc::new(Shared::new(core, self.notifier.clone(), auto_close));
                let _ = self.handle.signer.set(shared.core.default_signer());
                shared.sessions.join(self.handle.clone())?;
                Ok(shared)
            }
            Resolution::Inherit(inherited) => self.inherit(inherited).await,
        }
    }

    /// Join the chain behind `inherited.from`, opening it first if needed.
    async fn inherit(&self, inherited: Inherited) -> Result<Arc<Shared>> {
        let Inherited {
            from,
            public_key,
            key_pair,
            signer,
        } = inherited;

        let shared = from.link.shared_boxed().await?;
        let chain_key = shared.core.public_key();
        if public_key.is_some_and(|key| key != chain_key) {
            return Err(ChainError::InvalidKey);
        }
        let signer =
            session_signer(&chain_key, key_pair, signer)?.or_else(|| from.link.handle.signer());

        let _ = self.handle.signer.set(signer);
        shared.sessions.join(self.handle.clone())?;
        if let Some(hook) = self.notifier.hook() {
            shared.notifier.set_hook(Some(hook));
        }

        tracing::debug!(
            handle = self.handle.id,
            from = from.link.handle.id,
            "inherited an open chain"
        );
        Ok(shared)
    }
}

/// A type-erased reference to a chain handle, for inheriting its chain.
#[derive(Clone)]
pub struct ChainRef {
    link: Arc<Link>,
}

impl<E: Encoding> From<&Chain<E>> for ChainRef {
    fn from(chain: &Chain<E>) -> Self {
        Self {
            link: chain.link.clone(),
        }
    }
}

impl fmt::Debug for ChainRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainRef")
            .field("handle", &self.link.handle.id)
            .finish()
    }
}

/// A handle onto a chain: the root handle or a session.
///
/// Cloning a handle yields the same handle, not a new session.
pub struct Chain<E: Encoding = Raw> {
    link: Arc<Link>,
    _encoding: PhantomData<fn() -> E>,
}

impl<E: Encoding> Clone for Chain<E> {
    fn clone(&self) -> Self {
        Self {
            link: self.link.clone(),
            _encoding: PhantomData,
        }
    }
}

impl<E: Encoding> fmt::Debug for Chain<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain")
            .field("handle", &self.link.handle.id)
            .field("info", &self.try_info().ok())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<E: Encoding> Chain<E> {
    /// Create an unopened chain.
    pub fn new(config: ChainConfig) -> Self {
        Self {
            link: Arc::new(Link::unbound(config)),
            _encoding: PhantomData,
        }
    }

    /// Create and open a chain.
    pub async fn open(config: ChainConfig) -> Result<Self> {
        let chain = Self::new(config);
        chain.ready().await?;
        Ok(chain)
    }

    /// Open storage and load the chain. Idempotent.
    pub async fn ready(&self) -> Result<()> {
        self.core().await.map(|_| ())
    }

    async fn core(&self) -> Result<&Arc<ChainCore>> {
        Ok(&self.link.shared().await?.core)
    }

    /// A reference other chains can inherit from.
    pub fn to_ref(&self) -> ChainRef {
        ChainRef::from(self)
    }

    fn signer(&self) -> Option<SharedSigner> {
        self.link.handle.signer()
    }

    fn info_of(&self, core: &ChainCore) -> ChainInfo {
        let state = core.tree_state();
        ChainInfo {
            public_key: core.public_key(),
            length: state.length,
            byte_length: state.byte_length,
            fork: state.fork,
            writable: self.signer().is_some(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // State
    // ─────────────────────────────────────────────────────────────────────────

    /// Current summary without waiting for the chain to open.
    pub fn try_info(&self) -> Result<ChainInfo> {
        if self.is_closed() {
            return Err(ChainError::Closed);
        }
        let shared = self.link.shared.get().ok_or(ChainError::NotReady)?;
        Ok(self.info_of(&shared.core))
    }

    /// Current summary.
    pub async fn info(&self) -> Result<ChainInfo> {
        let core = self.core().await?;
        Ok(self.info_of(core))
    }

    /// True if this handle is open and can append.
    pub fn writable(&self) -> bool {
        self.try_info().map(|info| info.writable).unwrap_or(false)
    }

    /// A copy of the persisted header.
    pub async fn header(&self) -> Result<Header> {
        Ok(self.core().await?.header())
    }

    /// Root hash the chain had at `length` blocks.
    pub async fn tree_hash(&self, length: u64) -> Result<Blake3Hash> {
        self.core().await?.tree_hash(length)
    }

    /// A view frozen at the current length.
    pub async fn snapshot(&self) -> Result<Snapshot<E>> {
        let core = self.core().await?;
        Ok(Snapshot::new(core.clone(), core.tree_state()))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Blocks
    // ─────────────────────────────────────────────────────────────────────────

    /// Append values; returns the index of the first one.
    ///
    /// Concurrent appends are applied in the order they reach the write queue.
    pub async fn append(&self, values: &[E::Value]) -> Result<u64> {
        let core = self.core().await?;
        let blocks = values
            .iter()
            .map(E::encode)
            .collect::<Result<Vec<Vec<u8>>>>()?;
        core.append(self.signer(), &blocks).await
    }

    /// The value at `index`.
    pub async fn get(&self, index: u64) -> Result<E::Value> {
        let bytes = self.core().await?.get(index).await?;
        E::decode(bytes)
    }

    /// Values in `start..end`.
    pub async fn get_range(&self, start: u64, end: u64) -> Result<Vec<E::Value>> {
        let core = self.core().await?;
        let length = core.tree_state().length;
        if start > end || end > length {
            return Err(ChainError::OutOfRange {
                index: end.max(start),
                length,
            });
        }

        let mut values = Vec::with_capacity((end - start) as usize);
        for index in start..end {
            values.push(E::decode(core.get(index).await?)?);
        }
        Ok(values)
    }

    /// True if block `index` is stored locally.
    pub async fn has(&self, index: u64) -> Result<bool> {
        self.core().await?.has(index).await
    }

    /// Destructively cut the chain to `length` blocks under `fork`.
    pub async fn truncate(&self, length: u64, fork: u64) -> Result<()> {
        let core = self.core().await?;
        core.truncate(self.signer(), length, fork).await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Proofs
    // ─────────────────────────────────────────────────────────────────────────

    /// Build a proof, with the block value filled from storage if requested.
    pub async fn proof(&self, request: &ProofRequest) -> Result<Proof> {
        self.core().await?.proof(request).await
    }

    /// Verify and apply a proof from the local writer (`None`) or a peer.
    ///
    /// A valid proof signed under a newer fork reorganizes the chain.
    pub async fn verify(&self, proof: &Proof, from: Option<PeerId>) -> Result<UpdateStatus> {
        self.core().await?.verify(proof, from).await
    }

    /// The reorg a proof from a newer fork implies, without applying it.
    pub async fn compute_reorg(&self, proof: &Proof) -> Result<Option<ReorgDescriptor>> {
        self.core().await?.compute_reorg(proof)
    }

    /// Apply a reorg from [`Chain::compute_reorg`].
    ///
    /// Returns [`UpdateStatus::Stale`] if the chain moved since.
    pub async fn reorg(
        &self,
        descriptor: &ReorgDescriptor,
        from: Option<PeerId>,
    ) -> Result<UpdateStatus> {
        self.core().await?.reorg(descriptor, from).await
    }

    /// Nodes a block proof for tree index `index` must carry.
    pub async fn missing_nodes(&self, index: u64) -> Result<u64> {
        self.core().await?.missing_nodes(index)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // User data
    // ─────────────────────────────────────────────────────────────────────────

    /// Set (or with `None` delete) a user data entry; persisted on return.
    pub async fn user_data(&self, key: &str, value: Option<Bytes>) -> Result<()> {
        self.core().await?.set_user_data(key, value).await
    }

    pub async fn get_user_data(&self, key: &str) -> Result<Option<Bytes>> {
        self.core().await?.get_user_data(key)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Sessions
    // ─────────────────────────────────────────────────────────────────────────

    /// Open another handle onto this chain.
    ///
    /// A key in `options` (or from its preload hook) must match the chain's
    /// public key; it makes the session writable even if this handle is not.
    /// Without a key the session signs like this handle.
    pub async fn session<E2: Encoding>(&self, options: SessionOptions) -> Result<Chain<E2>> {
        let shared = self.link.shared().await?;
        let options = options.resolve().await?;
        let signer = session_signer(&shared.core.public_key(), options.key_pair, options.signer)?
            .or_else(|| self.signer());

        let handle = HandleState::with_signer(signer);
        shared.sessions.join(handle.clone())?;

        tracing::debug!(session = handle.id, "session opened");
        Ok(Chain {
            link: Arc::new(Link::bound(handle, shared.clone())),
            _encoding: PhantomData,
        })
    }

    /// Build a chain on top of an already opened one instead of reopening
    /// its storage. The new chain counts as a session of `other`.
    ///
    /// [`ChainConfig::inherit_from`] does the same lazily, when the new
    /// chain opens.
    pub async fn inherit<E2: Encoding>(other: &Chain<E2>, options: SessionOptions) -> Result<Self> {
        other.session::<E>(options).await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Observers
    // ─────────────────────────────────────────────────────────────────────────

    /// Install (or with `None` clear) the chain's single update hook.
    ///
    /// The slot is shared by every handle of the chain.
    pub fn on_update(&self, hook: Option<UpdateHook>) {
        match self.link.shared.get() {
            Some(shared) => shared.notifier.set_hook(hook),
            None => self.link.notifier.set_hook(hook),
        }
    }

    /// Events for this handle.
    pub fn subscribe(&self) -> broadcast::Receiver<ChainEvent> {
        self.link.handle.events.subscribe()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Close
    // ─────────────────────────────────────────────────────────────────────────

    /// Close this handle. Idempotent; concurrent callers all wait for the one
    /// close to finish.
    ///
    /// Storage is released with the last open handle. A chain that never
    /// opened is closed without touching storage, unless its configuration
    /// has a preload hook or inherits another chain: then it is resolved
    /// first, as it may be one of another chain's handles.
    pub async fn close(&self) -> Result<()> {
        let mut failure = None;
        let slot = &mut failure;
        let link = &self.link;
        link.handle
            .closed
            .get_or_init(move || async move {
                let deferred = link.config.as_ref().is_some_and(ChainConfig::is_deferred);
                let shared = if deferred {
                    match link.shared.get_or_try_init(|| link.bind()).await {
                        Ok(shared) => Some(shared),
                        Err(e) => {
                            tracing::debug!(error = %e, "closing a chain that failed to open");
                            None
                        }
                    }
                } else {
                    link.shared.get()
                };

                match shared {
                    Some(shared) => {
                        let release = shared.sessions.release(link.handle.id, shared.auto_close);
                        if let Err(e) = shared.settle(&link.handle, release).await {
                            *slot = Some(e);
                        }
                    }
                    None => {
                        let _ = link.handle.events.send(ChainEvent::Close { last: true });
                    }
                }
                tracing::debug!(handle = link.handle.id, "handle closed");
            })
            .await;
        failure.map_or(Ok(()), Err)
    }

    pub fn is_closed(&self) -> bool {
        self.link.handle.closed.initialized()
    }

    /// Number of open handles onto this chain.
    pub fn sessions(&self) -> usize {
        match self.link.shared.get() {
            Some(shared) => shared.sessions.count(),
            None => usize::from(!self.is_closed()),
        }
    }
}

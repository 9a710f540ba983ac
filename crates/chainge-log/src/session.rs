//! Reference counting across the handles of one chain.
//!
//! ## Overview
//!
//! The root [`Chain`](crate::Chain), every session created from it, and every
//! chain configured to inherit it are handles onto one shared core.
//! [`Sessions`] tracks which handles are still open and decides, as each one
//! closes, whether the core must be torn down:
//!
//! - the last open handle closing releases storage
//! - under auto-close, a handle closing while exactly one other handle stays
//!   open closes that remaining handle too
//!
//! Once torn down, no new handle can join.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use chainge_log_core::SharedSigner;
use tokio::sync::{broadcast, OnceCell};

use crate::error::{ChainError, Result};
use crate::events::{ChainEvent, Notifier, EVENT_CAPACITY};

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(0);

/// Per-handle state, shared by clones of the same handle.
pub(crate) struct HandleState {
    pub id: u64,
    /// How the handle signs; set once it joins a chain.
    pub signer: OnceLock<Option<SharedSigner>>,
    pub events: broadcast::Sender<ChainEvent>,
    /// Set once this handle finished closing.
    pub closed: OnceCell<()>,
}

impl HandleState {
    /// A handle whose signer is decided when it binds to a chain.
    pub fn unbound() -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            id: NEXT_HANDLE.fetch_add(1, Ordering::Relaxed),
            signer: OnceLock::new(),
            events,
            closed: OnceCell::new(),
        })
    }

    pub fn with_signer(signer: Option<SharedSigner>) -> Arc<Self> {
        let handle = Self::unbound();
        let _ = handle.signer.set(signer);
        handle
    }

    pub fn signer(&self) -> Option<SharedSigner> {
        self.signer.get().cloned().flatten()
    }

    /// Stop receiving chain events and announce the close.
    pub fn finish(&self, notifier: &Notifier, last: bool) {
        notifier.unregister(self.id);
        let _ = self.events.send(ChainEvent::Close { last });
    }
}

/// What closing a handle requires.
pub(crate) enum Release {
    /// Other handles keep the core alive.
    Keep,
    /// Auto-close: the given handle is the only one left and closes too.
    AutoClose(Arc<HandleState>),
    /// No handle is left; release storage.
    Teardown,
}

struct Inner {
    open: Vec<Arc<HandleState>>,
    torn_down: bool,
}

pub(crate) struct Sessions {
    inner: Mutex<Inner>,
    notifier: Arc<Notifier>,
}

impl Sessions {
    pub fn new(notifier: Arc<Notifier>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                open: Vec::new(),
                torn_down: false,
            }),
            notifier,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a handle, unless the chain was already torn down.
    pub fn join(&self, handle: Arc<HandleState>) -> Result<()> {
        let mut inner = self.lock();
        if inner.torn_down {
            return Err(ChainError::Closed);
        }
        self.notifier.register(handle.id, handle.events.clone());
        inner.open.push(handle);
        Ok(())
    }

    /// Remove handle `id` and decide what its close requires.
    pub fn release(&self, id: u64, auto_close: bool) -> Release {
        let mut inner = self.lock();
        inner.open.retain(|h| h.id != id);

        match inner.open.len() {
            0 => {
                inner.torn_down = true;
                Release::Teardown
            }
            1 if auto_close => Release::AutoClose(inner.open[0].clone()),
            _ => Release::Keep,
        }
    }

    pub fn is_torn_down(&self) -> bool {
        self.lock().torn_down
    }

    /// Number of open handles.
    pub fn count(&self) -> usize {
        self.lock().open.len()
    }
}

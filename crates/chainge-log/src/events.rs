//! Update hook and observer events.
//!
//! ## Overview
//!
//! A chain reports every applied mutation two ways:
//!
//! - **Update hook**: one settable callback per chain (see
//!   [`Chain::on_update`](crate::Chain::on_update)) receiving an [`Update`]
//!   with the status mask, affected range, verified value and peer.
//! - **Events**: every handle has its own broadcast channel of
//!   [`ChainEvent`]s. Append and truncate events reach every open handle;
//!   a close event only reaches the handle that closed.
//!
//! Both fire while the mutation still holds the chain's write queue, so an
//! observer never sees a later mutation's state before an earlier event.

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use bytes::Bytes;
use chainge_log_core::{UpdateRange, STATUS_APPENDED, STATUS_TRUNCATED};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Opaque token identifying the peer a proof came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

/// What an applied mutation changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Update {
    /// Bit 0: length increased. Bit 1: committed blocks were invalidated.
    pub status: u8,
    /// Net affected range; `range.drop` mirrors bit 1.
    pub range: Option<UpdateRange>,
    /// The verified block content, when the proof carried one.
    pub value: Option<Bytes>,
    /// `None` for local mutations.
    pub from: Option<PeerId>,
}

impl Update {
    pub fn appended(&self) -> bool {
        self.status & STATUS_APPENDED != 0
    }

    pub fn truncated(&self) -> bool {
        self.status & STATUS_TRUNCATED != 0
    }
}

/// Callback installed with [`Chain::on_update`](crate::Chain::on_update).
pub type UpdateHook = Arc<dyn Fn(&Update) + Send + Sync>;

/// Notifications for observers such as replication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    /// The chain grew.
    Append { length: u64, byte_length: u64 },
    /// History was cut back to `ancestors` blocks under `fork`.
    Truncate { ancestors: u64, fork: u64 },
    /// This handle closed; `last` is set when storage was released with it.
    Close { last: bool },
}

/// Capacity of each handle's event channel.
pub(crate) const EVENT_CAPACITY: usize = 256;

/// The hook slot and the event channels of every open handle.
#[derive(Default)]
pub(crate) struct Notifier {
    hook: RwLock<Option<UpdateHook>>,
    listeners: Mutex<Vec<(u64, broadcast::Sender<ChainEvent>)>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_hook(&self, hook: Option<UpdateHook>) {
        *self.hook.write().unwrap_or_else(PoisonError::into_inner) = hook;
    }

    pub fn hook(&self) -> Option<UpdateHook> {
        self.hook
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Invoke the update hook, if one is installed.
    pub fn update(&self, update: &Update) {
        if let Some(hook) = self.hook() {
            hook(update);
        }
    }

    pub fn register(&self, id: u64, sender: broadcast::Sender<ChainEvent>) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, sender));
    }

    pub fn unregister(&self, id: u64) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(listener, _)| *listener != id);
    }

    /// Send an event to every open handle.
    pub fn emit(&self, event: ChainEvent) {
        let listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        for (_, sender) in listeners.iter() {
            // No receivers is fine.
            let _ = sender.send(event.clone());
        }
    }
}

//! Frozen views of a chain.

use std::marker::PhantomData;
use std::sync::Arc;

use chainge_log_core::{Blake3Hash, Ed25519Signature, TreeState};

use crate::chain_core::ChainCore;
use crate::encoding::Encoding;
use crate::error::{ChainError, Result};

/// The chain as it was when [`Chain::snapshot`](crate::Chain::snapshot) was
/// called.
///
/// Length, root and signature are captured by value; later appends are not
/// visible through the snapshot.
pub struct Snapshot<E: Encoding> {
    core: Arc<ChainCore>,
    state: TreeState,
    _encoding: PhantomData<fn() -> E>,
}

impl<E: Encoding> Snapshot<E> {
    pub(crate) fn new(core: Arc<ChainCore>, state: TreeState) -> Self {
        Self {
            core,
            state,
            _encoding: PhantomData,
        }
    }

    pub fn length(&self) -> u64 {
        self.state.length
    }

    pub fn byte_length(&self) -> u64 {
        self.state.byte_length
    }

    pub fn fork(&self) -> u64 {
        self.state.fork
    }

    pub fn root_hash(&self) -> Blake3Hash {
        self.state.root_hash
    }

    pub fn signature(&self) -> Ed25519Signature {
        self.state.signature
    }

    pub fn state(&self) -> &TreeState {
        &self.state
    }

    /// The value at `index`, which must lie within the snapshot.
    pub async fn get(&self, index: u64) -> Result<E::Value> {
        if index >= self.state.length {
            return Err(ChainError::OutOfRange {
                index,
                length: self.state.length,
            });
        }
        E::decode(self.core.get(index).await?)
    }
}

//! Storage that fails on demand.

use std::collections::BTreeSet;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chainge_log::store::{Region, Storage, StoreError};

/// Wraps another storage and fails writes and deletes to chosen regions.
///
/// Reads always pass through, so a chain can be reopened from the inner
/// storage after a failed operation to see what was persisted.
pub struct FaultyStorage {
    inner: Arc<dyn Storage>,
    failing: Mutex<BTreeSet<Region>>,
}

impl FaultyStorage {
    pub fn new(inner: Arc<dyn Storage>) -> Self {
        Self {
            inner,
            failing: Mutex::new(BTreeSet::new()),
        }
    }

    fn failing(&self) -> MutexGuard<'_, BTreeSet<Region>> {
        self.failing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every later write or delete to `region` fail.
    pub fn fail_writes(&self, region: Region) {
        self.failing().insert(region);
    }

    /// Stop failing.
    pub fn heal(&self) {
        self.failing().clear();
    }

    fn check(&self, region: Region) -> Result<(), StoreError> {
        if self.failing().contains(&region) {
            return Err(StoreError::Io(io::Error::other(format!(
                "injected {} write failure",
                region.as_str()
            ))));
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for FaultyStorage {
    async fn read(&self, region: Region, offset: u64, len: u64) -> Result<Vec<u8>, StoreError> {
        self.inner.read(region, offset, len).await
    }

    async fn write(&self, region: Region, offset: u64, data: &[u8]) -> Result<(), StoreError> {
        self.check(region)?;
        self.inner.write(region, offset, data).await
    }

    async fn delete(&self, region: Region, offset: u64, len: u64) -> Result<(), StoreError> {
        self.check(region)?;
        self.inner.delete(region, offset, len).await
    }

    async fn stat(&self, region: Region) -> Result<u64, StoreError> {
        self.inner.stat(region).await
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.inner.close().await
    }
}

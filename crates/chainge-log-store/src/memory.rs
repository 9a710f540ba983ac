//! In-memory implementation of the Storage trait.
//!
//! This is primarily for testing. It has the same semantics as SQLite
//! but keeps everything in memory with no persistence.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::{Result, StoreError};
use crate::traits::{out_of_bounds, Region, Storage};

/// In-memory storage.
///
/// Closing does not drop the data, so a chain can be reopened on the same
/// instance. Thread-safe via RwLock.
pub struct MemoryStorage {
    inner: RwLock<MemoryStorageInner>,
}

struct MemoryStorageInner {
    regions: HashMap<Region, Vec<u8>>,
    closes: usize,
}

impl MemoryStorage {
    /// Create a new empty in-memory storage.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryStorageInner {
                regions: HashMap::new(),
                closes: 0,
            }),
        }
    }

    /// Number of times `close` has been called.
    pub fn close_count(&self) -> usize {
        self.inner.read().map(|inner| inner.closes).unwrap_or(0)
    }

    fn poisoned() -> StoreError {
        StoreError::InvalidData("memory storage lock poisoned".into())
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn read(&self, region: Region, offset: u64, len: u64) -> Result<Vec<u8>> {
        let inner = self.inner.read().map_err(|_| Self::poisoned())?;
        let bytes = inner.regions.get(&region).map(Vec::as_slice).unwrap_or(&[]);

        let end = offset + len;
        if end > bytes.len() as u64 {
            return Err(out_of_bounds(region, offset, len, bytes.len() as u64));
        }
        Ok(bytes[offset as usize..end as usize].to_vec())
    }

    async fn write(&self, region: Region, offset: u64, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.write().map_err(|_| Self::poisoned())?;
        let bytes = inner.regions.entry(region).or_default();

        let end = offset as usize + data.len();
        if bytes.len() < end {
            bytes.resize(end, 0);
        }
        bytes[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    async fn delete(&self, region: Region, offset: u64, len: u64) -> Result<()> {
        let mut inner = self.inner.write().map_err(|_| Self::poisoned())?;
        let Some(bytes) = inner.regions.get_mut(&region) else {
            return Ok(());
        };

        let size = bytes.len() as u64;
        if offset >= size {
            return Ok(());
        }
        if offset + len >= size {
            bytes.truncate(offset as usize);
        } else {
            bytes[offset as usize..(offset + len) as usize].fill(0);
        }
        Ok(())
    }

    async fn stat(&self, region: Region) -> Result<u64> {
        let inner = self.inner.read().map_err(|_| Self::poisoned())?;
        Ok(inner.regions.get(&region).map_or(0, |b| b.len() as u64))
    }

    async fn close(&self) -> Result<()> {
        let mut inner = self.inner.write().map_err(|_| Self::poisoned())?;
        inner.closes += 1;
        Ok(())
    }
}

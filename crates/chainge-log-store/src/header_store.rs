//! The header record: `u32 LE length || CBOR header`.

use std::sync::Arc;

use chainge_log_core::Header;

use crate::error::{Result, StoreError};
use crate::traits::{Region, Storage, StorageExt};

#[derive(Clone)]
pub struct HeaderStore {
    storage: Arc<dyn Storage>,
}

impl HeaderStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Load the header, or `None` for fresh storage.
    pub async fn load(&self) -> Result<Option<Header>> {
        let size = self.storage.stat(Region::Header).await?;
        if size == 0 {
            return Ok(None);
        }
        if size < 4 {
            return Err(StoreError::InvalidData(format!(
                "header region is only {size} bytes"
            )));
        }

        let prefix = self.storage.read(Region::Header, 0, 4).await?;
        let len = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as u64;
        if 4 + len > size {
            return Err(StoreError::InvalidData(format!(
                "header record claims {len} bytes, region holds {}",
                size - 4
            )));
        }

        let body = self.storage.read(Region::Header, 4, len).await?;
        let header =
            Header::from_bytes(&body).map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(Some(header))
    }

    /// Persist the header in a single write.
    pub async fn save(&self, header: &Header) -> Result<()> {
        let body = header
            .to_bytes()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let len = u32::try_from(body.len())
            .map_err(|_| StoreError::Serialization("header exceeds 4 GiB".into()))?;

        let mut record = Vec::with_capacity(4 + body.len());
        record.extend_from_slice(&len.to_le_bytes());
        record.extend_from_slice(&body);

        self.storage.write(Region::Header, 0, &record).await?;
        self.storage
            .truncate(Region::Header, record.len() as u64)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStorage;
    use bytes::Bytes;
    use chainge_log_core::Keypair;

    #[tokio::test]
    async fn test_save_load() {
        let store = HeaderStore::new(Arc::new(MemoryStorage::new()));
        assert!(store.load().await.unwrap().is_none());

        let keypair = Keypair::generate();
        let mut header = Header::new(keypair.public_key(), Some(keypair.seed()));
        header.set_user_data("hello", Some(Bytes::from_static(b"world")));
        store.save(&header).await.unwrap();

        assert_eq!(store.load().await.unwrap(), Some(header));
    }

    #[tokio::test]
    async fn test_shorter_header_replaces_longer() {
        let storage = Arc::new(MemoryStorage::new());
        let store = HeaderStore::new(storage.clone());

        let keypair = Keypair::generate();
        let mut header = Header::new(keypair.public_key(), None);
        header.set_user_data("big", Some(Bytes::from(vec![1u8; 500])));
        store.save(&header).await.unwrap();

        header.set_user_data("big", None);
        store.save(&header).await.unwrap();

        assert_eq!(store.load().await.unwrap(), Some(header));
        assert!(storage.stat(Region::Header).await.unwrap() < 500);
    }

    #[tokio::test]
    async fn test_corrupt_header_is_rejected() {
        let storage = Arc::new(MemoryStorage::new());
        storage.write(Region::Header, 0, &[200, 0, 0, 0, 1, 2]).await.unwrap();
        let store = HeaderStore::new(storage);
        assert!(matches!(store.load().await, Err(StoreError::InvalidData(_))));
    }
}

//! Chain configuration and its one-time resolution at open.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use chainge_log_core::{Ed25519PublicKey, EncryptionKey, Keypair, SharedSigner};
use chainge_log_store::Storage;

use crate::chain::ChainRef;
use crate::error::{ChainError, Result};

/// Future returned by a preload hook.
pub type PreloadFuture = Pin<Box<dyn Future<Output = Result<Preload>> + Send>>;

/// Async hook run once while the chain opens.
pub type PreloadHook = Arc<dyn Fn() -> PreloadFuture + Send + Sync>;

/// Late configuration supplied by a preload hook.
///
/// Fields only fill in what the [`ChainConfig`] left unset.
#[derive(Default)]
pub struct Preload {
    pub storage: Option<Arc<dyn Storage>>,
    pub key_pair: Option<Keypair>,
    pub signer: Option<SharedSigner>,
    /// Join this chain instead of opening storage.
    pub from: Option<ChainRef>,
}

/// Configuration for a [`Chain`](crate::Chain).
#[derive(Clone, Default)]
pub struct ChainConfig {
    /// Backing storage. Required, here or from the preload hook.
    pub storage: Option<Arc<dyn Storage>>,
    /// Expected public key. Opening storage signed by another key fails.
    pub public_key: Option<Ed25519PublicKey>,
    /// Keypair used to sign; its secret is persisted with a fresh chain.
    pub key_pair: Option<Keypair>,
    /// Custom sign function, checked against the public key at open.
    pub signer: Option<SharedSigner>,
    /// User data upserted into the header on every open.
    pub user_data: Vec<(String, Bytes)>,
    /// Close the last remaining handle once every other handle has closed.
    pub auto_close: bool,
    /// Seal block contents at rest.
    pub encryption_key: Option<EncryptionKey>,
    /// Join this chain as one more of its handles instead of opening
    /// storage. Storage, user data and the encryption key are then ignored.
    pub from: Option<ChainRef>,
    pub preload: Option<PreloadHook>,
}

impl ChainConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn public_key(mut self, public_key: Ed25519PublicKey) -> Self {
        self.public_key = Some(public_key);
        self
    }

    pub fn key_pair(mut self, key_pair: Keypair) -> Self {
        self.key_pair = Some(key_pair);
        self
    }

    pub fn signer(mut self, signer: SharedSigner) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn user_data(mut self, key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.user_data.push((key.into(), value.into()));
        self
    }

    pub fn auto_close(mut self, auto_close: bool) -> Self {
        self.auto_close = auto_close;
        self
    }

    pub fn encryption_key(mut self, key: EncryptionKey) -> Self {
        self.encryption_key = Some(key);
        self
    }

    /// Inherit `chain` when this one opens; `chain` is opened first if needed.
    pub fn inherit_from(mut self, chain: impl Into<ChainRef>) -> Self {
        self.from = Some(chain.into());
        self
    }

    pub fn preload<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Preload>> + Send + 'static,
    {
        self.preload = Some(Arc::new(move || Box::pin(hook()) as PreloadFuture));
        self
    }

    /// True if opening must run a hook or join another chain.
    pub(crate) fn is_deferred(&self) -> bool {
        self.preload.is_some() || self.from.is_some()
    }

    /// Run the preload hook and validate the result.
    pub(crate) async fn resolve(self) -> Result<Resolution> {
        let mut storage = self.storage;
        let mut key_pair = self.key_pair;
        let mut signer = self.signer;
        let mut from = self.from;

        if let Some(hook) = &self.preload {
            let preload = hook().await?;
            storage = storage.or(preload.storage);
            key_pair = key_pair.or(preload.key_pair);
            signer = signer.or(preload.signer);
            from = from.or(preload.from);
        }

        if let (Some(public_key), Some(key_pair)) = (&self.public_key, &key_pair) {
            if key_pair.public_key() != *public_key {
                return Err(ChainError::InvalidKey);
            }
        }

        if let Some(from) = from {
            return Ok(Resolution::Inherit(Inherited {
                from,
                public_key: self.public_key,
                key_pair,
                signer,
            }));
        }

        let storage =
            storage.ok_or_else(|| ChainError::Config("no storage configured".into()))?;

        Ok(Resolution::Open(ResolvedConfig {
            storage,
            public_key: self.public_key,
            key_pair,
            signer,
            user_data: self.user_data,
            encryption_key: self.encryption_key,
        }))
    }
}

impl fmt::Debug for ChainConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainConfig")
            .field("storage", &self.storage.is_some())
            .field("public_key", &self.public_key)
            .field("key_pair", &self.key_pair)
            .field("signer", &self.signer.is_some())
            .field("user_data", &self.user_data.len())
            .field("auto_close", &self.auto_close)
            .field("encryption_key", &self.encryption_key.is_some())
            .field("from", &self.from)
            .field("preload", &self.preload.is_some())
            .finish()
    }
}

/// Where a chain gets its core from, once its configuration is resolved.
pub(crate) enum Resolution {
    /// Open storage as a new chain.
    Open(ResolvedConfig),
    /// Join an existing chain.
    Inherit(Inherited),
}

/// Configuration with the preload hook applied and storage present.
pub(crate) struct ResolvedConfig {
    pub storage: Arc<dyn Storage>,
    pub public_key: Option<Ed25519PublicKey>,
    pub key_pair: Option<Keypair>,
    pub signer: Option<SharedSigner>,
    pub user_data: Vec<(String, Bytes)>,
    pub encryption_key: Option<EncryptionKey>,
}

/// A chain joining `from`, signing with its own key if it has one.
pub(crate) struct Inherited {
    pub from: ChainRef,
    pub public_key: Option<Ed25519PublicKey>,
    pub key_pair: Option<Keypair>,
    pub signer: Option<SharedSigner>,
}

/// Future returned by a session preload hook.
pub type SessionPreloadFuture = Pin<Box<dyn Future<Output = Result<SessionOptions>> + Send>>;

/// Async hook run once while a session opens.
pub type SessionPreloadHook = Arc<dyn Fn() -> SessionPreloadFuture + Send + Sync>;

/// Options for [`Chain::session`](crate::Chain::session).
///
/// A session without a key signs like the handle it was created from.
#[derive(Clone, Default)]
pub struct SessionOptions {
    pub key_pair: Option<Keypair>,
    pub signer: Option<SharedSigner>,
    /// Supplies keys the options left unset; its own hook is ignored.
    pub preload: Option<SessionPreloadHook>,
}

impl SessionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key_pair(mut self, key_pair: Keypair) -> Self {
        self.key_pair = Some(key_pair);
        self
    }

    pub fn signer(mut self, signer: SharedSigner) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn preload<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<SessionOptions>> + Send + 'static,
    {
        self.preload = Some(Arc::new(move || Box::pin(hook()) as SessionPreloadFuture));
        self
    }

    /// Run the preload hook, if any, and fill in unset keys.
    pub(crate) async fn resolve(self) -> Result<SessionOptions> {
        let Some(hook) = &self.preload else {
            return Ok(self);
        };
        let preload = hook().await?;
        Ok(SessionOptions {
            key_pair: self.key_pair.or(preload.key_pair),
            signer: self.signer.or(preload.signer),
            preload: None,
        })
    }
}

impl fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionOptions")
            .field("key_pair", &self.key_pair)
            .field("signer", &self.signer.is_some())
            .field("preload", &self.preload.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainge_log_store::MemoryStorage;

    fn opened(resolution: Resolution) -> ResolvedConfig {
        match resolution {
            Resolution::Open(resolved) => resolved,
            Resolution::Inherit(_) => panic!("expected storage to be opened"),
        }
    }

    #[tokio::test]
    async fn test_missing_storage_is_config_error() {
        let result = ChainConfig::new().resolve().await;
        assert!(matches!(result, Err(ChainError::Config(_))));
    }

    #[tokio::test]
    async fn test_preload_fills_unset_fields() {
        let keypair = Keypair::generate();
        let preloaded = keypair.clone();
        let config = ChainConfig::new().preload(move || {
            let key_pair = preloaded.clone();
            async move {
                Ok::<_, ChainError>(Preload {
                    storage: Some(Arc::new(MemoryStorage::new()) as Arc<dyn Storage>),
                    key_pair: Some(key_pair),
                    ..Preload::default()
                })
            }
        });

        let resolved = opened(config.resolve().await.unwrap());
        assert_eq!(
            resolved.key_pair.map(|k| k.public_key()),
            Some(keypair.public_key())
        );
    }

    #[tokio::test]
    async fn test_mismatched_key_pair_is_rejected() {
        let config = ChainConfig::new()
            .storage(Arc::new(MemoryStorage::new()))
            .public_key(Keypair::generate().public_key())
            .key_pair(Keypair::generate());
        assert!(matches!(config.resolve().await, Err(ChainError::InvalidKey)));
    }

    #[tokio::test]
    async fn test_encryption_key_reaches_resolved_config() {
        let key = EncryptionKey::from_bytes([1u8; 32]);
        let config = ChainConfig::new()
            .storage(Arc::new(MemoryStorage::new()))
            .encryption_key(key.clone());
        assert!(!config.is_deferred());

        let resolved = opened(config.resolve().await.unwrap());
        assert_eq!(resolved.encryption_key, Some(key));
    }

    #[tokio::test]
    async fn test_session_preload_fills_unset_keys() {
        let keypair = Keypair::generate();
        let preloaded = keypair.clone();
        let options = SessionOptions::new().preload(move || {
            let key_pair = preloaded.clone();
            async move { Ok::<_, ChainError>(SessionOptions::new().key_pair(key_pair)) }
        });

        let resolved = options.resolve().await.unwrap();
        assert_eq!(
            resolved.key_pair.map(|k| k.public_key()),
            Some(keypair.public_key())
        );
        assert!(resolved.preload.is_none());
    }
}

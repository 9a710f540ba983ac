//! Cryptographic primitives for Chainge Log.
//!
//! Blake3 node hashing with one-byte type prefixes, Ed25519 signing of
//! tree summaries, and ChaCha20-Poly1305 sealing of blocks at rest.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::CoreError;

const LEAF_TYPE: u8 = 0x00;
const PARENT_TYPE: u8 = 0x01;
const ROOT_TYPE: u8 = 0x02;

/// Domain prefix of every signed tree summary.
pub const SIGN_DOMAIN: &[u8] = b"chainge-log-tree-v0:";

/// A 32-byte Blake3 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Blake3Hash(pub [u8; 32]);

impl Blake3Hash {
    /// Compute the plain Blake3 hash of the given data.
    pub fn hash(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Hash a block as a tree leaf.
    pub fn leaf(data: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&[LEAF_TYPE]);
        hasher.update(&(data.len() as u64).to_le_bytes());
        hasher.update(data);
        Self(*hasher.finalize().as_bytes())
    }

    /// Combine two sibling hashes into their parent.
    pub fn parent(size: u64, left: &Blake3Hash, right: &Blake3Hash) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&[PARENT_TYPE]);
        hasher.update(&size.to_le_bytes());
        hasher.update(&left.0);
        hasher.update(&right.0);
        Self(*hasher.finalize().as_bytes())
    }

    /// Hash the ordered full roots of a tree into its root hash.
    pub fn roots<'a>(roots: impl IntoIterator<Item = (&'a Blake3Hash, u64, u64)>) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&[ROOT_TYPE]);
        for (hash, index, size) in roots {
            hasher.update(&hash.0);
            hasher.update(&index.to_le_bytes());
            hasher.update(&size.to_le_bytes());
        }
        Self(*hasher.finalize().as_bytes())
    }

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Blake3Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Blake3({})", &self.to_hex()[..16])
    }
}

/// A 32-byte Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ed25519PublicKey(pub [u8; 32]);

impl Ed25519PublicKey {
    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(arr))
    }

    /// Verify a signature over a message.
    pub fn verify(&self, message: &[u8], signature: &Ed25519Signature) -> Result<(), CoreError> {
        let verifying_key =
            VerifyingKey::from_bytes(&self.0).map_err(|_| CoreError::InvalidPublicKey)?;
        let sig = Signature::from_bytes(&signature.0);
        verifying_key
            .verify(message, &sig)
            .map_err(|_| CoreError::InvalidSignature)
    }
}

impl fmt::Debug for Ed25519PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ed25519Pub({})", &self.to_hex()[..16])
    }
}

/// A 64-byte Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Ed25519Signature(pub [u8; 64]);

impl Ed25519Signature {
    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The zero signature, carried by a tree that was never signed.
    pub const ZERO: Self = Self([0u8; 64]);
}

// serde only derives arrays up to 32 elements, so go through a byte string.
impl Serialize for Ed25519Signature {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serde_bytes::Bytes::new(&self.0).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Ed25519Signature {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = serde_bytes::ByteBuf::deserialize(deserializer)?;
        let arr: [u8; 64] = bytes
            .into_vec()
            .try_into()
            .map_err(|_| serde::de::Error::invalid_length(64, &"a 64-byte signature"))?;
        Ok(Self(arr))
    }
}

impl fmt::Debug for Ed25519Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ed25519Sig({}...)", &self.to_hex()[..16])
    }
}

/// Anything able to sign tree summaries for a chain.
///
/// A [`Keypair`] is the usual signer; closures let callers keep the secret
/// key elsewhere.
pub trait Signer: Send + Sync {
    /// Sign a message.
    fn sign(&self, message: &[u8]) -> Ed25519Signature;
}

impl<F> Signer for F
where
    F: Fn(&[u8]) -> Ed25519Signature + Send + Sync,
{
    fn sign(&self, message: &[u8]) -> Ed25519Signature {
        self(message)
    }
}

/// Shared, type-erased signer.
pub type SharedSigner = Arc<dyn Signer>;

/// Check that `signer` produces signatures the given public key accepts.
pub fn signer_matches(signer: &dyn Signer, public_key: &Ed25519PublicKey) -> bool {
    let message = b"chainge-log-signer-check";
    public_key.verify(message, &signer.sign(message)).is_ok()
}

/// An Ed25519 keypair owning the chain's secret key.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let signing_key = SigningKey::generate(&mut rng);
        Self { signing_key }
    }

    /// Create from a 32-byte seed (the secret key).
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        Self { signing_key }
    }

    /// Get the public key.
    pub fn public_key(&self) -> Ed25519PublicKey {
        Ed25519PublicKey(self.signing_key.verifying_key().to_bytes())
    }

    /// Sign a message.
    pub fn sign(&self, message: &[u8]) -> Ed25519Signature {
        let sig = self.signing_key.sign(message);
        Ed25519Signature(sig.to_bytes())
    }

    /// Get the raw seed bytes (secret key material).
    pub fn seed(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }
}

impl Signer for Keypair {
    fn sign(&self, message: &[u8]) -> Ed25519Signature {
        Keypair::sign(self, message)
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Keypair({:?})", self.public_key())
    }
}

/// Domain prefix of every block nonce.
const NONCE_DOMAIN: &[u8] = b"chainge-log-block-nonce-v0:";

/// Bytes a sealed block carries beyond its plaintext: the fork and the tag.
pub const SEAL_OVERHEAD: usize = 8 + 16;

/// A 256-bit key encrypting block contents at rest.
///
/// A sealed block is `fork (u64 LE) || ciphertext || tag`, with the nonce
/// derived from the block index and the fork it was written under. The tree
/// commits to the sealed bytes, so replicas without the key still verify.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    /// Generate a new random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    fn nonce(index: u64, fork: u64) -> [u8; 12] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(NONCE_DOMAIN);
        hasher.update(&index.to_le_bytes());
        hasher.update(&fork.to_le_bytes());
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&hasher.finalize().as_bytes()[..12]);
        nonce
    }

    /// Encrypt the block at `index`, written under `fork`.
    pub fn seal(&self, index: u64, fork: u64, plaintext: &[u8]) -> Result<Vec<u8>, CoreError> {
        let cipher = ChaCha20Poly1305::new_from_slice(&self.0)
            .map_err(|e| CoreError::Encryption(e.to_string()))?;
        let nonce = Self::nonce(index, fork);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| CoreError::Encryption(e.to_string()))?;

        let mut sealed = Vec::with_capacity(8 + ciphertext.len());
        sealed.extend_from_slice(&fork.to_le_bytes());
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Decrypt the sealed block at `index`.
    pub fn open(&self, index: u64, sealed: &[u8]) -> Result<Vec<u8>, CoreError> {
        if sealed.len() < SEAL_OVERHEAD {
            return Err(CoreError::Encryption(format!(
                "block {index} is too short to be sealed"
            )));
        }
        let (fork, ciphertext) = sealed.split_at(8);
        let mut fork_bytes = [0u8; 8];
        fork_bytes.copy_from_slice(fork);
        let nonce = Self::nonce(index, u64::from_le_bytes(fork_bytes));

        let cipher = ChaCha20Poly1305::new_from_slice(&self.0)
            .map_err(|e| CoreError::Encryption(e.to_string()))?;
        cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|_| CoreError::Encryption(format!("block {index} failed to decrypt")))
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

/// The message signed for a tree summary: domain, root hash, length, fork.
pub fn signable(root_hash: &Blake3Hash, length: u64, fork: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(SIGN_DOMAIN.len() + 48);
    buf.extend_from_slice(SIGN_DOMAIN);
    buf.extend_from_slice(&root_hash.0);
    buf.extend_from_slice(&length.to_le_bytes());
    buf.extend_from_slice(&fork.to_le_bytes());
    buf
}

//! The persisted chain header.
//!
//! The header is the durability boundary of a chain: a mutation counts as
//! committed once the header describing it has been written.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::crypto::{Ed25519PublicKey, Keypair};
use crate::error::{CoreError, Result};
use crate::tree::TreeState;

/// Current header format version.
pub const HEADER_VERSION: u32 = 1;

/// Everything a chain persists besides blocks and tree nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub version: u32,
    pub signer: SignerInfo,
    pub tree: TreeState,
    pub hints: Hints,
    pub user_data: Vec<UserDataEntry>,
}

/// The chain's key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignerInfo {
    pub public_key: Ed25519PublicKey,
    /// Secret seed, kept when this storage belongs to the writer.
    pub secret_key: Option<[u8; 32]>,
}

impl SignerInfo {
    /// The writer keypair, if the secret is known.
    pub fn keypair(&self) -> Option<Keypair> {
        self.secret_key.as_ref().map(Keypair::from_seed)
    }
}

/// Bookkeeping about past fork transitions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hints {
    pub reorgs: Vec<ReorgHint>,
}

/// One fork transition: `from` fork to `to` fork, keeping `ancestors` blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReorgHint {
    pub from: u64,
    pub to: u64,
    pub ancestors: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDataEntry {
    pub key: String,
    pub value: Bytes,
}

impl Header {
    /// A fresh header for an empty chain.
    pub fn new(public_key: Ed25519PublicKey, secret_key: Option<[u8; 32]>) -> Self {
        Self {
            version: HEADER_VERSION,
            signer: SignerInfo {
                public_key,
                secret_key,
            },
            tree: TreeState::empty(),
            hints: Hints::default(),
            user_data: Vec::new(),
        }
    }

    /// Record a fork transition. Hints are only ever appended.
    pub fn add_reorg_hint(&mut self, from: u64, to: u64, ancestors: u64) {
        self.hints.reorgs.push(ReorgHint {
            from,
            to,
            ancestors,
        });
    }

    /// Look up a user data value.
    pub fn get_user_data(&self, key: &str) -> Option<&Bytes> {
        self.user_data
            .iter()
            .find(|e| e.key == key)
            .map(|e| &e.value)
    }

    /// Insert, overwrite, or (with `None`) delete a user data entry.
    ///
    /// Overwriting keeps the entry in place; other entries keep their order.
    pub fn set_user_data(&mut self, key: &str, value: Option<Bytes>) {
        let position = self.user_data.iter().position(|e| e.key == key);
        match (position, value) {
            (Some(i), Some(value)) => self.user_data[i].value = value,
            (Some(i), None) => {
                self.user_data.remove(i);
            }
            (None, Some(value)) => self.user_data.push(UserDataEntry {
                key: key.to_string(),
                value,
            }),
            (None, None) => {}
        }
    }

    /// Encode as CBOR.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf).map_err(|e| CoreError::Encoding(e.to_string()))?;
        Ok(buf)
    }

    /// Decode from CBOR.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let header: Header =
            ciborium::from_reader(bytes).map_err(|e| CoreError::Decoding(e.to_string()))?;
        if header.version > HEADER_VERSION {
            return Err(CoreError::Decoding(format!(
                "unsupported header version {}",
                header.version
            )));
        }
        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> Header {
        let keypair = Keypair::from_seed(&[5u8; 32]);
        Header::new(keypair.public_key(), Some(keypair.seed()))
    }

    #[test]
    fn test_user_data_upsert_and_delete() {
        let mut h = header();
        h.set_user_data("a", Some(Bytes::from_static(b"1")));
        h.set_user_data("b", Some(Bytes::from_static(b"2")));
        h.set_user_data("c", Some(Bytes::from_static(b"3")));

        h.set_user_data("a", Some(Bytes::from_static(b"9")));
        let keys: Vec<&str> = h.user_data.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert_eq!(h.get_user_data("a").unwrap().as_ref(), b"9");

        h.set_user_data("b", None);
        let keys: Vec<&str> = h.user_data.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "c"]);
        assert!(h.get_user_data("b").is_none());

        h.set_user_data("missing", None);
        assert_eq!(h.user_data.len(), 2);
    }

    #[test]
    fn test_hints_are_appended() {
        let mut h = header();
        h.add_reorg_hint(0, 1, 3);
        h.add_reorg_hint(0, 1, 3);
        assert_eq!(h.hints.reorgs.len(), 2);
    }

    #[test]
    fn test_header_cbor_roundtrip() {
        let mut h = header();
        h.set_user_data("hej", Some(Bytes::from_static(b"world")));
        h.add_reorg_hint(0, 1, 2);

        let decoded = Header::from_bytes(&h.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, h);
        assert!(decoded.signer.keypair().is_some());
    }

    #[test]
    fn test_header_rejects_future_version() {
        let mut h = header();
        h.version = HEADER_VERSION + 1;
        assert!(Header::from_bytes(&h.to_bytes().unwrap()).is_err());
    }
}

//! Value encodings.
//!
//! A chain stores opaque bytes. An [`Encoding`] picks the type a handle reads
//! and writes; sessions over the same chain may use different encodings.

use std::marker::PhantomData;

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{ChainError, Result};

/// Converts between block bytes and a typed value.
pub trait Encoding: Send + Sync + 'static {
    type Value: Send + Sync;

    fn encode(value: &Self::Value) -> Result<Vec<u8>>;

    fn decode(bytes: Bytes) -> Result<Self::Value>;
}

/// Blocks as raw bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Raw;

impl Encoding for Raw {
    type Value = Vec<u8>;

    fn encode(value: &Vec<u8>) -> Result<Vec<u8>> {
        Ok(value.clone())
    }

    fn decode(bytes: Bytes) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

/// Blocks as UTF-8 strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8;

impl Encoding for Utf8 {
    type Value = String;

    fn encode(value: &String) -> Result<Vec<u8>> {
        Ok(value.as_bytes().to_vec())
    }

    fn decode(bytes: Bytes) -> Result<String> {
        String::from_utf8(bytes.to_vec()).map_err(|e| ChainError::Encoding(e.to_string()))
    }
}

/// Blocks as JSON documents of type `T`.
pub struct Json<T>(PhantomData<fn() -> T>);

impl<T> Encoding for Json<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    type Value = T;

    fn encode(value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| ChainError::Encoding(e.to_string()))
    }

    fn decode(bytes: Bytes) -> Result<T> {
        serde_json::from_slice(&bytes).map_err(|e| ChainError::Encoding(e.to_string()))
    }
}

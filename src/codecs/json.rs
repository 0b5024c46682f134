//! JSON Codec using `serde_json`
//!
//! Default codec of the cache service. Integers encode as plain decimal text, so a
//! value written by `increment` reads back as a number and vice versa.

use crate::traits::CacheCodec;
use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// JSON Codec using `serde_json`
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl CacheCodec for JsonCodec {
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).context("Failed to encode cache value as JSON")
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).with_context(|| {
            format!(
                "Failed to decode cached JSON as {}",
                std::any::type_name::<T>()
            )
        })
    }

    fn name(&self) -> &'static str {
        "serde_json"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integers_share_counter_encoding() {
        let codec = JsonCodec;
        assert_eq!(codec.serialize(&42_i64).unwrap(), b"42");
        assert_eq!(codec.deserialize::<i64>(b"-7").unwrap(), -7);
    }

    #[test]
    fn test_type_mismatch_is_an_error() {
        let codec = JsonCodec;
        let bytes = codec.serialize(&serde_json::json!({"name": "alice"})).unwrap();
        let err = codec.deserialize::<Vec<u32>>(&bytes).unwrap_err();
        assert!(err.to_string().contains("Vec<u32>"));
    }
}

// SPDX-License-Identifier: MIT OR Apache-2.0

//! CBOR encoding and decoding helpers used for all wire formats.
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

pub fn encode_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, CborError> {
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(value, &mut bytes)
        .map_err(|err| CborError::Encode(err.to_string()))?;
    Ok(bytes)
}

pub fn decode_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CborError> {
    ciborium::de::from_reader(bytes).map_err(|err| CborError::Decode(err.to_string()))
}

#[derive(Debug, Error)]
pub enum CborError {
    /// A value could not be serialized.
    #[error("cbor encoding failed: {0}")]
    Encode(String),

    /// Bytes could not be parsed or did not match the expected shape.
    #[error("cbor decoding failed: {0}")]
    Decode(String),
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::{decode_cbor, encode_cbor};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Pair {
        left: u64,
        right: Vec<u8>,
    }

    #[test]
    fn round_trip() {
        let pair = Pair {
            left: 12,
            right: vec![0, 1, 2],
        };
        let bytes = encode_cbor(&pair).unwrap();
        assert_eq!(decode_cbor::<Pair>(&bytes).unwrap(), pair);
    }

    #[test]
    fn decode_failure() {
        assert!(decode_cbor::<Pair>(&[0xff, 0x00]).is_err());
    }
}

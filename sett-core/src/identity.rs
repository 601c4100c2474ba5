// SPDX-License-Identifier: MIT OR Apache-2.0

//! Ed25519 signing identities.
//!
//! Every member, device and group in the protocol is identified by an
//! Ed25519 public key. Key agreement is a separate concern: peers carry
//! dedicated X25519 exchange keys next to their signing identity.
use std::fmt;
use std::str::FromStr;

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::{RngCore, SeedableRng};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Length of an Ed25519 public key or private key seed in bytes.
pub const KEY_LEN: usize = 32;

/// Length of an Ed25519 signature in bytes.
pub const SIGNATURE_LEN: usize = 64;

/// Private Ed25519 key used for signing.
#[derive(Clone)]
pub struct PrivateKey(SigningKey);

impl PrivateKey {
    /// Generates a new private key, seeded from the operating system's
    /// entropy source.
    pub fn new() -> Self {
        let mut csprng = rand_chacha::ChaCha20Rng::from_os_rng();
        let mut seed = [0u8; KEY_LEN];
        csprng.fill_bytes(&mut seed);
        Self(SigningKey::from_bytes(&seed))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdentityError> {
        let seed: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| IdentityError::InvalidKeyLength(bytes.len()))?;
        Ok(Self(SigningKey::from_bytes(&seed)))
    }

    /// Builds a private key from exactly 32 seed bytes. Any 32-byte string
    /// is a valid seed, so this cannot fail.
    pub fn from_seed(seed: [u8; KEY_LEN]) -> Self {
        Self(SigningKey::from_bytes(&seed))
    }

    pub fn to_bytes(&self) -> [u8; KEY_LEN] {
        self.0.to_bytes()
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.verifying_key().to_bytes())
    }

    pub fn sign(&self, bytes: &[u8]) -> Signature {
        Signature(self.0.sign(bytes))
    }
}

impl Default for PrivateKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print the secret part.
        f.debug_tuple("PrivateKey").field(&"***").finish()
    }
}

/// Public Ed25519 key identifying a member, device or group.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; KEY_LEN]);

impl PublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdentityError> {
        let raw: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| IdentityError::InvalidKeyLength(bytes.len()))?;
        // Reject byte strings which are not valid curve points.
        VerifyingKey::from_bytes(&raw).map_err(|_| IdentityError::InvalidKey)?;
        Ok(Self(raw))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn verify(&self, bytes: &[u8], signature: &Signature) -> bool {
        match VerifyingKey::from_bytes(&self.0) {
            Ok(key) => key.verify(bytes, &signature.0).is_ok(),
            Err(_) => false,
        }
    }
}

impl From<VerifyingKey> for PublicKey {
    fn from(value: VerifyingKey) -> Self {
        Self(value.to_bytes())
    }
}

impl AsRef<[u8]> for PublicKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl FromStr for PublicKey {
    type Err = IdentityError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::from_bytes(&hex::decode(value)?)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PublicKey").field(&self.to_hex()).finish()
    }
}

impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_hex())
        } else {
            serde_bytes::Bytes::new(&self.0).serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let hex_str = String::deserialize(deserializer)?;
            hex_str.parse().map_err(serde::de::Error::custom)
        } else {
            let bytes = serde_bytes::ByteBuf::deserialize(deserializer)?;
            PublicKey::from_bytes(&bytes).map_err(serde::de::Error::custom)
        }
    }
}

/// Ed25519 signature over arbitrary bytes.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature(ed25519_dalek::Signature);

impl Signature {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdentityError> {
        let raw: [u8; SIGNATURE_LEN] = bytes
            .try_into()
            .map_err(|_| IdentityError::InvalidSignatureLength(bytes.len()))?;
        Ok(Self(ed25519_dalek::Signature::from_bytes(&raw)))
    }

    pub fn to_bytes(&self) -> [u8; SIGNATURE_LEN] {
        self.0.to_bytes()
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Signature")
            .field(&hex::encode(self.to_bytes()))
            .finish()
    }
}

impl Serialize for Signature {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serde_bytes::Bytes::new(&self.to_bytes()).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes = serde_bytes::ByteBuf::deserialize(deserializer)?;
        Signature::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("invalid key length {0} bytes, expected 32 bytes")]
    InvalidKeyLength(usize),

    #[error("bytes do not form a valid ed25519 key")]
    InvalidKey,

    #[error("invalid signature length {0} bytes, expected 64 bytes")]
    InvalidSignatureLength(usize),

    #[error("invalid hex encoding in key string")]
    InvalidHexEncoding(#[from] hex::FromHexError),
}

#[cfg(test)]
mod tests {
    use super::{PrivateKey, PublicKey, Signature};

    #[test]
    fn sign_and_verify() {
        let private_key = PrivateKey::new();
        let public_key = private_key.public_key();

        let signature = private_key.sign(b"a claim worth signing");
        assert!(public_key.verify(b"a claim worth signing", &signature));
        assert!(!public_key.verify(b"a different claim", &signature));
    }

    #[test]
    fn wrong_key_does_not_verify() {
        let signature = PrivateKey::new().sign(b"message");
        let other = PrivateKey::new().public_key();
        assert!(!other.verify(b"message", &signature));
    }

    #[test]
    fn key_bytes_round_trip() {
        let private_key = PrivateKey::new();
        let restored = PrivateKey::from_bytes(&private_key.to_bytes()).unwrap();
        assert_eq!(private_key.public_key(), restored.public_key());

        let public_key = private_key.public_key();
        let restored = PublicKey::from_bytes(public_key.as_bytes()).unwrap();
        assert_eq!(public_key, restored);
    }

    #[test]
    fn signature_bytes_round_trip() {
        let signature = PrivateKey::new().sign(b"payload");
        let restored = Signature::from_bytes(&signature.to_bytes()).unwrap();
        assert_eq!(signature, restored);
    }
}

// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cryptographic helpers for the group layer.
//!
//! Algorithms:
//! - SHA256 HKDF for all key derivation
//! - ChaCha20Poly1305 AEAD
//! - X25519 Diffie-Hellman, with exchange keys kept next to the Ed25519
//!   signing identities
//! - ChaCha20 CSPRNG, seeded via the operating system
pub mod ratchet;
mod rng;
mod sealed;
mod secret;
pub mod x25519;

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;

pub use rng::{Rng, RngError};
pub use sealed::{open_sealed, seal_to};
pub use secret::Secret;

/// Length of AEAD and derived keys in bytes.
pub const KEY_LEN: usize = 32;

/// Length of a ChaCha20Poly1305 nonce in bytes.
pub const NONCE_LEN: usize = 12;

/// Derives a 32-byte key from input key material and a domain-separating
/// info tag (HKDF-SHA256, no salt).
pub fn derive_key(ikm: &[u8], info: &[&[u8]]) -> Secret<KEY_LEN> {
    let hkdf = Hkdf::<Sha256>::new(None, ikm);
    let mut okm = [0u8; KEY_LEN];
    let info: Vec<u8> = info.concat();
    hkdf.expand(&info, &mut okm)
        .expect("32 bytes is a valid hkdf output length");
    Secret::from_bytes(okm)
}

pub(crate) fn aead_encrypt(
    key: &Secret<KEY_LEN>,
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Encrypt)
}

pub(crate) fn aead_decrypt(
    key: &Secret<KEY_LEN>,
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Decrypt)
}

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("aead encryption failed")]
    Encrypt,

    #[error("aead decryption failed")]
    Decrypt,

    #[error("peer key is not usable for key exchange")]
    InvalidPeerKey,

    #[error("malformed sealed payload")]
    MalformedSealed,

    #[error(transparent)]
    Rng(#[from] RngError),
}

#[cfg(test)]
mod tests {
    use super::{aead_decrypt, aead_encrypt, derive_key};

    #[test]
    fn derivation_is_deterministic_and_separated() {
        let a = derive_key(b"ikm", &[b"tag-one"]);
        let b = derive_key(b"ikm", &[b"tag-one"]);
        let c = derive_key(b"ikm", &[b"tag-two"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn aead_round_trip() {
        let key = derive_key(b"ikm", &[b"aead"]);
        let nonce = [3u8; 12];

        let ciphertext = aead_encrypt(&key, &nonce, b"payload", b"aad").unwrap();
        let plaintext = aead_decrypt(&key, &nonce, &ciphertext, b"aad").unwrap();
        assert_eq!(plaintext, b"payload");

        // Tampering with the additional data must fail authentication.
        assert!(aead_decrypt(&key, &nonce, &ciphertext, b"other").is_err());
    }
}

// SPDX-License-Identifier: MIT OR Apache-2.0

//! Anonymous sealed boxes towards an X25519 exchange key.
//!
//! Used to deliver a sender's device secret so that only the destination
//! member can read it. An ephemeral X25519 key performs a Diffie-Hellman
//! exchange against the recipient's exchange key; key and nonce are derived
//! from the shared secret with HKDF-SHA256 and the payload is encrypted
//! with ChaCha20Poly1305.
use serde::{Deserialize, Serialize};
use sett_core::{decode_cbor, encode_cbor};

use crate::crypto::x25519::{PublicKey, SecretKey, PUBLIC_KEY_SIZE};
use crate::crypto::{aead_decrypt, aead_encrypt, CryptoError, Rng, NONCE_LEN};

const SEAL_INFO: &[u8] = b"sett/sealed/v1";

#[derive(Serialize, Deserialize)]
struct SealedBox {
    ephemeral_pk: PublicKey,
    #[serde(with = "serde_bytes")]
    ciphertext: Vec<u8>,
}

/// Seals `plaintext` so that only the holder of the secret half of
/// `recipient` can open it. The sender stays anonymous.
pub fn seal_to(
    rng: &Rng,
    recipient: &PublicKey,
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let ephemeral_secret = SecretKey::from_bytes(rng.random_array()?);
    let ephemeral_pk = ephemeral_secret.public_key();

    let shared = ephemeral_secret
        .calculate_agreement(recipient)
        .map_err(|_| CryptoError::InvalidPeerKey)?;

    let (key, nonce) = derive_box_key(&shared, &ephemeral_pk, recipient);
    let ciphertext = aead_encrypt(&key, &nonce, plaintext, recipient.as_bytes())?;

    encode_cbor(&SealedBox {
        ephemeral_pk,
        ciphertext,
    })
    .map_err(|_| CryptoError::Encrypt)
}

/// Opens a payload produced by [`seal_to`] with the recipient's exchange
/// secret.
pub fn open_sealed(recipient: &SecretKey, bytes: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let sealed: SealedBox = decode_cbor(bytes).map_err(|_| CryptoError::MalformedSealed)?;

    let shared = recipient
        .calculate_agreement(&sealed.ephemeral_pk)
        .map_err(|_| CryptoError::InvalidPeerKey)?;
    let recipient_pk = recipient.public_key();

    let (key, nonce) = derive_box_key(&shared, &sealed.ephemeral_pk, &recipient_pk);
    aead_decrypt(&key, &nonce, &sealed.ciphertext, recipient_pk.as_bytes())
}

fn derive_box_key(
    shared: &[u8; PUBLIC_KEY_SIZE],
    ephemeral_pk: &PublicKey,
    recipient: &PublicKey,
) -> (crate::crypto::Secret<32>, [u8; NONCE_LEN]) {
    let key = crate::crypto::derive_key(
        shared,
        &[SEAL_INFO, ephemeral_pk.as_bytes(), recipient.as_bytes()],
    );
    // The key is unique per ephemeral exchange, a derived nonce is enough.
    let nonce_key =
        crate::crypto::derive_key(shared, &[SEAL_INFO, b"nonce", ephemeral_pk.as_bytes()]);
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&nonce_key.as_bytes()[..NONCE_LEN]);
    (key, nonce)
}

#[cfg(test)]
mod tests {
    use super::{open_sealed, seal_to};
    use crate::crypto::x25519::SecretKey;
    use crate::crypto::Rng;

    #[test]
    fn seal_and_open() {
        let rng = Rng::from_seed([1; 32]);
        let recipient = SecretKey::from_bytes(rng.random_array().unwrap());

        let sealed = seal_to(&rng, &recipient.public_key(), b"chain key material").unwrap();
        let opened = open_sealed(&recipient, &sealed).unwrap();
        assert_eq!(opened, b"chain key material");
    }

    #[test]
    fn wrong_recipient_cannot_open() {
        let rng = Rng::from_seed([2; 32]);
        let recipient = SecretKey::from_bytes(rng.random_array().unwrap());
        let eavesdropper = SecretKey::from_bytes(rng.random_array().unwrap());

        let sealed = seal_to(&rng, &recipient.public_key(), b"secret").unwrap();
        assert!(open_sealed(&eavesdropper, &sealed).is_err());
    }

    #[test]
    fn garbage_is_rejected() {
        let rng = Rng::from_seed([3; 32]);
        let recipient = SecretKey::from_bytes(rng.random_array().unwrap());
        assert!(open_sealed(&recipient, b"not a sealed box").is_err());
    }
}

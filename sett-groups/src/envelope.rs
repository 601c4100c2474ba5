// SPDX-License-Identifier: MIT OR Apache-2.0

//! Wire envelopes binding log entries to a sender device inside a group.
//!
//! Two shapes exist. The *group envelope* wraps a typed metadata event and
//! is protected by a signature only: the event is public to everyone who
//! can read the log. The *message envelope* is a two-layer AEAD
//! construction: an outer layer encrypts the per-message headers with a key
//! every group member can derive from the group's shared secret, the inner
//! layer encrypts the payload with the one-shot message key of the sender's
//! ratchet at the claimed counter.
use serde::{Deserialize, Serialize};
use sett_core::{decode_cbor, encode_cbor, Hash, PrivateKey, PublicKey, Signature};
use thiserror::Error;

use crate::crypto::ratchet::message_nonce;
use crate::crypto::{aead_decrypt, aead_encrypt, derive_key, Rng, Secret, NONCE_LEN};
use crate::event::{EventType, GroupMetadata, MessageHeaders, MetadataEvent};
use crate::group::Group;
use crate::keystore::{DecryptInfo, KeySource, KeyStore, KeyStoreError};

const HEADERS_KEY_INFO: &[u8] = b"sett/envelope/headers";

#[derive(Serialize, Deserialize)]
struct GroupEnvelope {
    event_type: EventType,
    #[serde(with = "serde_bytes")]
    payload: Vec<u8>,
    sig: Signature,
    device_pk: PublicKey,
}

#[derive(Serialize, Deserialize)]
struct MessageEnvelope {
    #[serde(with = "serde_bytes")]
    nonce: [u8; NONCE_LEN],
    #[serde(with = "serde_bytes")]
    headers: Vec<u8>,
    #[serde(with = "serde_bytes")]
    message: Vec<u8>,
}

/// Marshals a metadata event with its signature and type tag into bytes
/// suitable for a log append.
///
/// The signature must cover the CBOR encoding of `event`, made with the
/// sender's device key, or with the group's private key for
/// [`EventType::MultiMemberInitialMember`].
pub fn seal_group_envelope(
    _group: &Group,
    event: &MetadataEvent,
    sig: Signature,
    device_pk: PublicKey,
) -> Result<Vec<u8>, EnvelopeError> {
    let payload = encode_cbor(event).map_err(|err| EnvelopeError::Serialization(err.to_string()))?;
    encode_cbor(&GroupEnvelope {
        event_type: event.event_type(),
        payload,
        sig,
        device_pk,
    })
    .map_err(|err| EnvelopeError::Serialization(err.to_string()))
}

/// Parses and verifies a group envelope, returning its authenticated header
/// fields and the decoded event.
pub fn open_group_envelope(
    group: &Group,
    bytes: &[u8],
) -> Result<(GroupMetadata, MetadataEvent), EnvelopeError> {
    let envelope: GroupEnvelope =
        decode_cbor(bytes).map_err(|_| EnvelopeError::MalformedEnvelope)?;

    let event: MetadataEvent =
        decode_cbor(&envelope.payload).map_err(|_| EnvelopeError::MalformedEnvelope)?;
    if event.event_type() != envelope.event_type {
        return Err(EnvelopeError::MalformedEnvelope);
    }

    // Initial-member claims prove knowledge of the group's own key;
    // everything else is authenticated by the sending device.
    let verification_key = match envelope.event_type {
        EventType::MultiMemberInitialMember => group.public_key(),
        _ => envelope.device_pk,
    };
    if !verification_key.verify(&envelope.payload, &envelope.sig) {
        return Err(EnvelopeError::InvalidSignature);
    }

    Ok((
        GroupMetadata {
            event_type: envelope.event_type,
            device_pk: envelope.device_pk,
            sig: envelope.sig,
        },
        event,
    ))
}

/// Advances the sender's ratchet, encrypts `payload` under the new one-shot
/// message key and wraps it with the authenticated per-message headers.
pub fn seal_envelope(
    keys: &KeyStore,
    rng: &Rng,
    group: &Group,
    device: &PrivateKey,
    payload: &[u8],
) -> Result<Vec<u8>, EnvelopeError> {
    let group_pk = group.public_key();
    let device_pk = device.public_key();

    let (counter, message_key) = keys.seal_advance(rng, group_pk, device_pk)?;

    let message = aead_encrypt(
        &message_key,
        &message_nonce(counter),
        payload,
        &message_aad(&group_pk, &device_pk, counter),
    )
    .map_err(|_| EnvelopeError::Encrypt)?;

    let headers = MessageHeaders {
        counter,
        device_pk,
        sig: device.sign(&message),
    };
    let headers_bytes =
        encode_cbor(&headers).map_err(|err| EnvelopeError::Serialization(err.to_string()))?;

    let nonce: [u8; NONCE_LEN] = rng.random_array().map_err(|_| EnvelopeError::Encrypt)?;
    let headers_sealed = aead_encrypt(
        &headers_key(group),
        &nonce,
        &headers_bytes,
        group_pk.as_bytes(),
    )
    .map_err(|_| EnvelopeError::Encrypt)?;

    encode_cbor(&MessageEnvelope {
        nonce,
        headers: headers_sealed,
        message,
    })
    .map_err(|err| EnvelopeError::Serialization(err.to_string()))
}

/// Identifies the sender device, resolves the message key for the claimed
/// counter and decrypts. Returns the headers, the plaintext and the
/// [`DecryptInfo`] to be passed to [`post_decrypt_actions`].
pub fn open_envelope(
    keys: &KeyStore,
    group: &Group,
    bytes: &[u8],
    entry_hash: Hash,
) -> Result<(MessageHeaders, Vec<u8>, DecryptInfo), EnvelopeError> {
    let envelope: MessageEnvelope =
        decode_cbor(bytes).map_err(|_| EnvelopeError::MalformedEnvelope)?;

    let group_pk = group.public_key();
    let headers_bytes = aead_decrypt(
        &headers_key(group),
        &envelope.nonce,
        &envelope.headers,
        group_pk.as_bytes(),
    )
    .map_err(|_| EnvelopeError::DecryptFailed)?;
    let headers: MessageHeaders =
        decode_cbor(&headers_bytes).map_err(|_| EnvelopeError::MalformedEnvelope)?;

    if !headers.device_pk.verify(&envelope.message, &headers.sig) {
        return Err(EnvelopeError::InvalidSignature);
    }

    let (message_key, source) =
        match keys.lookup_key(group_pk, headers.device_pk, headers.counter, entry_hash) {
            Ok(found) => found,
            Err(KeyStoreError::UnknownDevice) => return Err(EnvelopeError::UnknownDevice),
            Err(KeyStoreError::ReplayedCounter(counter)) => {
                return Err(EnvelopeError::ReplayedCounter(counter))
            }
            Err(KeyStoreError::OutsideWindow { .. }) => return Err(EnvelopeError::DecryptFailed),
            Err(err) => return Err(EnvelopeError::KeyStore(err)),
        };

    let plaintext = aead_decrypt(
        &message_key,
        &message_nonce(headers.counter),
        &envelope.message,
        &message_aad(&group_pk, &headers.device_pk, headers.counter),
    )
    .map_err(|_| EnvelopeError::DecryptFailed)?;

    keys.commit_key(
        group_pk,
        headers.device_pk,
        headers.counter,
        entry_hash,
        message_key,
        &source,
    )?;

    let info = DecryptInfo {
        device_pk: headers.device_pk,
        counter: headers.counter,
        source,
    };
    Ok((headers, plaintext, info))
}

/// Advances the stored ratchet of a remote device after a successful
/// decrypt, caching the message keys of stepped-over counters for
/// out-of-order delivery. A no-op when the entry was authored by the local
/// device.
pub fn post_decrypt_actions(
    keys: &KeyStore,
    info: &DecryptInfo,
    group: &Group,
    own_device_pk: Option<PublicKey>,
    headers: &MessageHeaders,
) -> Result<(), KeyStoreError> {
    if own_device_pk == Some(headers.device_pk) {
        return Ok(());
    }
    match &info.source {
        KeySource::Derived { new_chain } => {
            keys.advance_remote_chain(group.public_key(), headers.device_pk, new_chain)
        }
        KeySource::Cached | KeySource::ByEntry => Ok(()),
    }
}

fn headers_key(group: &Group) -> Secret<32> {
    derive_key(
        group.shared_secret().as_bytes(),
        &[HEADERS_KEY_INFO, group.public_key().as_bytes()],
    )
}

fn message_aad(group_pk: &PublicKey, device_pk: &PublicKey, counter: u64) -> Vec<u8> {
    let mut aad = Vec::with_capacity(72);
    aad.extend_from_slice(group_pk.as_bytes());
    aad.extend_from_slice(device_pk.as_bytes());
    aad.extend_from_slice(&counter.to_le_bytes());
    aad
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("envelope bytes could not be parsed")]
    MalformedEnvelope,

    #[error("envelope signature does not verify")]
    InvalidSignature,

    #[error("sender device is not known in this group")]
    UnknownDevice,

    #[error("envelope could not be decrypted")]
    DecryptFailed,

    #[error("counter {0} was already consumed by another entry")]
    ReplayedCounter(u64),

    #[error("envelope encryption failed")]
    Encrypt,

    #[error("envelope serialization failed: {0}")]
    Serialization(String),

    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),
}

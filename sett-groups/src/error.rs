// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error surface of the group stores.
use thiserror::Error;

use crate::crypto::{CryptoError, RngError};
use crate::envelope::EnvelopeError;
use crate::keystore::KeyStoreError;
use crate::log::LogError;

/// Errors returned by the producer and query surface of the metadata and
/// message stores.
///
/// Ingest-path failures never surface here; they are logged and the faulty
/// entry is ignored.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid input")]
    InvalidInput,

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("deserialization failed: {0}")]
    Deserialization(String),

    #[error("signing failed")]
    SignatureFailed,

    #[error("operation is not valid on a {0:?} group")]
    GroupKindMismatch(crate::group::GroupKind),

    #[error("contact state does not allow this transition")]
    InvalidTransition,

    #[error("member has no admitted device in this group")]
    UnknownMember,

    #[error("secret key generation failed")]
    SecretKeyGenerationFailed,

    #[error("appending to the underlying log failed: {0}")]
    LogAppendFailed(#[source] LogError),

    #[error("initialising the underlying log failed: {0}")]
    LogInitFailed(#[source] LogError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<RngError> for StoreError {
    fn from(_: RngError) -> Self {
        StoreError::SecretKeyGenerationFailed
    }
}

impl From<sett_core::CborError> for StoreError {
    fn from(err: sett_core::CborError) -> Self {
        match err {
            sett_core::CborError::Encode(msg) => StoreError::Serialization(msg),
            sett_core::CborError::Decode(msg) => StoreError::Deserialization(msg),
        }
    }
}

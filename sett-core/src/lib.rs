// SPDX-License-Identifier: MIT OR Apache-2.0

//! `sett-core` provides the identity, hashing and encoding primitives shared
//! by all layers of the sett protocol: Ed25519 signing keys, BLAKE3 content
//! hashes and CBOR helpers.
//!
//! Everything above this crate (replicated logs, group stores, envelopes)
//! expresses its wire formats and identities in these types.
pub mod cbor;
pub mod hash;
pub mod identity;

pub use cbor::{decode_cbor, encode_cbor, CborError};
pub use hash::{Hash, HashError, HASH_LEN};
pub use identity::{IdentityError, PrivateKey, PublicKey, Signature};

// SPDX-License-Identifier: MIT OR Apache-2.0

//! Deterministic forward-secret key evolution per (group, device).
//!
//! Every device holds one chain key per group. Sending a message advances
//! the chain by one step and derives a one-shot message key for the new
//! counter value; receivers replay the same derivation from the chain state
//! they learned through a device-secret event. Knowing a message key reveals
//! nothing about earlier keys, and knowing a chain state reveals nothing
//! about the steps before it.
use serde::{Deserialize, Serialize};

use crate::crypto::{derive_key, Rng, RngError, Secret, KEY_LEN, NONCE_LEN};

const CHAIN_INFO: &[u8] = b"sett/ratchet/chain";
const MESSAGE_INFO: &[u8] = b"sett/ratchet/message";

/// Ratchet state of one device within one group: the current chain key and
/// the counter of the last message key derived from it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSecret {
    chain_key: Secret<KEY_LEN>,
    counter: u64,
}

impl DeviceSecret {
    /// Fresh ratchet state with a random chain key. The first sent message
    /// will carry counter 1.
    pub fn generate(rng: &Rng) -> Result<Self, RngError> {
        Ok(Self {
            chain_key: Secret::from_bytes(rng.random_array()?),
            counter: 0,
        })
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Advances the chain by one step.
    pub fn advance(&self) -> Self {
        Self {
            chain_key: derive_key(self.chain_key.as_bytes(), &[CHAIN_INFO]),
            counter: self.counter + 1,
        }
    }

    /// One-shot message key for the current counter position.
    pub fn message_key(&self) -> Secret<KEY_LEN> {
        derive_key(self.chain_key.as_bytes(), &[MESSAGE_INFO])
    }
}

/// Nonce for a one-shot message key. Keys are never reused across counters,
/// a counter-derived nonce is therefore unique per key.
pub fn message_nonce(counter: u64) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[..8].copy_from_slice(&counter.to_le_bytes());
    nonce
}

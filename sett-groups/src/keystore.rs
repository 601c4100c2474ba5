// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory key material for message envelopes.
//!
//! The store keeps one ratchet chain per (group, device), a bounded cache of
//! precomputed message keys for counters which were skipped by out-of-order
//! delivery, and the keys of already-opened entries addressed by entry hash.
//! The latter keeps `list_messages` re-callable: once an entry was opened,
//! its key is found again without touching the ratchet.
//!
//! All state sits behind one mutex; ratchet advancement is therefore atomic
//! per (group, device).
use std::collections::HashMap;
use std::sync::Mutex;

use sett_core::{Hash, PublicKey};
use thiserror::Error;

use crate::crypto::ratchet::DeviceSecret;
use crate::crypto::{Rng, RngError, Secret};

/// Number of message keys a receiver tolerates a counter to be ahead of the
/// known chain position.
pub const PRECOMPUTE_WINDOW: u64 = 100;

type ChainId = (PublicKey, PublicKey);

#[derive(Debug, Default)]
struct KeyStoreState {
    chains: HashMap<ChainId, DeviceSecret>,
    cache: HashMap<(PublicKey, PublicKey, u64), Secret<32>>,
    by_entry: HashMap<Hash, Secret<32>>,
}

/// Shared key store, one per peer (across all of its groups).
#[derive(Debug)]
pub struct KeyStore {
    state: Mutex<KeyStoreState>,
    window: u64,
}

impl Default for KeyStore {
    fn default() -> Self {
        Self::new()
    }
}

/// How the key for an entry was obtained.
#[derive(Clone, Debug)]
pub(crate) enum KeySource {
    /// The entry was opened before; its key is stored under its hash.
    ByEntry,

    /// The counter was precomputed earlier (skipped by out-of-order
    /// delivery or cached at seal time).
    Cached,

    /// The key was derived by advancing the chain forward; the advanced
    /// state still has to be persisted by post-decrypt actions.
    Derived { new_chain: DeviceSecret },
}

/// Outcome of a key lookup, handed back to [`post_decrypt_actions`] after a
/// successful decrypt.
///
/// [`post_decrypt_actions`]: crate::envelope::post_decrypt_actions
#[derive(Clone, Debug)]
pub struct DecryptInfo {
    pub device_pk: PublicKey,
    pub counter: u64,
    pub(crate) source: KeySource,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::with_window(PRECOMPUTE_WINDOW)
    }

    pub fn with_window(window: u64) -> Self {
        Self {
            state: Mutex::new(KeyStoreState::default()),
            window,
        }
    }

    /// Current ratchet state of the local device in `group`, created with a
    /// random chain key on first use.
    pub fn own_device_secret(
        &self,
        rng: &Rng,
        group_pk: PublicKey,
        device_pk: PublicKey,
    ) -> Result<DeviceSecret, KeyStoreError> {
        let mut state = self.lock()?;
        if let Some(secret) = state.chains.get(&(group_pk, device_pk)) {
            return Ok(secret.clone());
        }
        let secret = DeviceSecret::generate(rng)?;
        state.chains.insert((group_pk, device_pk), secret.clone());
        Ok(secret)
    }

    /// Seeds the chain of a remote device, learned through a device-secret
    /// metadata event. A chain that already advanced further is kept.
    pub fn register_chain_key(
        &self,
        group_pk: PublicKey,
        device_pk: PublicKey,
        secret: DeviceSecret,
    ) -> Result<(), KeyStoreError> {
        let mut state = self.lock()?;
        match state.chains.get(&(group_pk, device_pk)) {
            Some(existing) if existing.counter() >= secret.counter() => {}
            _ => {
                state.chains.insert((group_pk, device_pk), secret);
            }
        }
        Ok(())
    }

    /// Advances the local device's chain by one step and returns the new
    /// counter with its one-shot message key. The key is also cached so the
    /// local device can re-open its own entries.
    pub(crate) fn seal_advance(
        &self,
        rng: &Rng,
        group_pk: PublicKey,
        device_pk: PublicKey,
    ) -> Result<(u64, Secret<32>), KeyStoreError> {
        let mut state = self.lock()?;
        let chain = match state.chains.get(&(group_pk, device_pk)) {
            Some(chain) => chain.clone(),
            None => DeviceSecret::generate(rng)?,
        };

        let next = chain.advance();
        let key = next.message_key();
        state
            .cache
            .insert((group_pk, device_pk, next.counter()), key.clone());
        state.chains.insert((group_pk, device_pk), next.clone());
        Ok((next.counter(), key))
    }

    /// Resolves the message key for an entry without mutating any state.
    pub(crate) fn lookup_key(
        &self,
        group_pk: PublicKey,
        device_pk: PublicKey,
        counter: u64,
        entry_hash: Hash,
    ) -> Result<(Secret<32>, KeySource), KeyStoreError> {
        let state = self.lock()?;

        if let Some(key) = state.by_entry.get(&entry_hash) {
            return Ok((key.clone(), KeySource::ByEntry));
        }
        if let Some(key) = state.cache.get(&(group_pk, device_pk, counter)) {
            return Ok((key.clone(), KeySource::Cached));
        }

        let chain = state
            .chains
            .get(&(group_pk, device_pk))
            .ok_or(KeyStoreError::UnknownDevice)?;

        if counter <= chain.counter() {
            // The key was consumed (or never issued): a fresh entry cannot
            // legitimately claim this counter again.
            return Err(KeyStoreError::ReplayedCounter(counter));
        }
        if counter - chain.counter() > self.window {
            return Err(KeyStoreError::OutsideWindow {
                counter,
                horizon: chain.counter() + self.window,
            });
        }

        let mut cursor = chain.clone();
        while cursor.counter() < counter {
            cursor = cursor.advance();
        }
        let key = cursor.message_key();
        Ok((key, KeySource::Derived { new_chain: cursor }))
    }

    /// Marks an entry's key as used after a successful decrypt: stores it
    /// under the entry hash and removes it from the counter cache.
    pub(crate) fn commit_key(
        &self,
        group_pk: PublicKey,
        device_pk: PublicKey,
        counter: u64,
        entry_hash: Hash,
        key: Secret<32>,
        source: &KeySource,
    ) -> Result<(), KeyStoreError> {
        let mut state = self.lock()?;
        state.by_entry.insert(entry_hash, key);
        if matches!(source, KeySource::Cached) {
            state.cache.remove(&(group_pk, device_pk, counter));
        }
        Ok(())
    }

    /// Persists an advanced remote chain and caches the message keys of the
    /// counters that were stepped over, so they stay decryptable when their
    /// entries arrive later.
    pub(crate) fn advance_remote_chain(
        &self,
        group_pk: PublicKey,
        device_pk: PublicKey,
        new_chain: &DeviceSecret,
    ) -> Result<(), KeyStoreError> {
        let mut state = self.lock()?;
        let Some(stored) = state.chains.get(&(group_pk, device_pk)).cloned() else {
            return Err(KeyStoreError::UnknownDevice);
        };
        if stored.counter() >= new_chain.counter() {
            // A concurrent open advanced further already.
            return Ok(());
        }

        let mut cursor = stored;
        while cursor.counter() + 1 < new_chain.counter() {
            cursor = cursor.advance();
            state
                .cache
                .insert((group_pk, device_pk, cursor.counter()), cursor.message_key());
        }
        state.chains.insert((group_pk, device_pk), new_chain.clone());
        Ok(())
    }

    /// Whether a chain for (group, device) is known.
    pub fn has_chain(&self, group_pk: PublicKey, device_pk: PublicKey) -> bool {
        self.lock()
            .map(|state| state.chains.contains_key(&(group_pk, device_pk)))
            .unwrap_or(false)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, KeyStoreState>, KeyStoreError> {
        self.state.lock().map_err(|_| KeyStoreError::LockPoisoned)
    }
}

#[derive(Clone, Debug, Error)]
pub enum KeyStoreError {
    #[error("no ratchet chain known for this device")]
    UnknownDevice,

    #[error("counter {0} was already consumed")]
    ReplayedCounter(u64),

    #[error("counter {counter} is beyond the precompute horizon {horizon}")]
    OutsideWindow { counter: u64, horizon: u64 },

    #[error("key store lock is poisoned")]
    LockPoisoned,

    #[error("not enough randomness to create a chain key")]
    Rng,
}

impl From<RngError> for KeyStoreError {
    fn from(_: RngError) -> Self {
        KeyStoreError::Rng
    }
}

#[cfg(test)]
mod tests {
    use sett_core::{Hash, PrivateKey};

    use super::{KeySource, KeyStore, KeyStoreError};
    use crate::crypto::ratchet::DeviceSecret;
    use crate::crypto::Rng;

    fn ids() -> (sett_core::PublicKey, sett_core::PublicKey) {
        (
            PrivateKey::new().public_key(),
            PrivateKey::new().public_key(),
        )
    }

    #[test]
    fn seal_then_open_own_key() {
        let rng = Rng::from_seed([1; 32]);
        let keys = KeyStore::new();
        let (group, device) = ids();

        let (counter, sealed_key) = keys.seal_advance(&rng, group, device).unwrap();
        assert_eq!(counter, 1);

        let (found, source) = keys
            .lookup_key(group, device, counter, Hash::new(b"entry"))
            .unwrap();
        assert_eq!(found, sealed_key);
        assert!(matches!(source, KeySource::Cached));
    }

    #[test]
    fn remote_chain_derives_forward_within_window() {
        let rng = Rng::from_seed([2; 32]);
        let keys = KeyStore::with_window(10);
        let (group, device) = ids();

        let secret = DeviceSecret::generate(&rng).unwrap();
        keys.register_chain_key(group, device, secret).unwrap();

        // Counter 5 is ahead but within the window.
        let (_, source) = keys
            .lookup_key(group, device, 5, Hash::new(b"e5"))
            .unwrap();
        let KeySource::Derived { new_chain } = source else {
            panic!("expected derived key");
        };
        assert_eq!(new_chain.counter(), 5);

        // Outside the window is rejected.
        assert!(matches!(
            keys.lookup_key(group, device, 11, Hash::new(b"e11")),
            Err(KeyStoreError::OutsideWindow { .. })
        ));
    }

    #[test]
    fn skipped_counters_stay_available() {
        let rng = Rng::from_seed([3; 32]);
        let keys = KeyStore::new();
        let (group, device) = ids();

        let secret = DeviceSecret::generate(&rng).unwrap();
        keys.register_chain_key(group, device, secret).unwrap();

        // Message 4 arrives first; the chain advances past 1..3.
        let (key_4, source) = keys
            .lookup_key(group, device, 4, Hash::new(b"e4"))
            .unwrap();
        let KeySource::Derived { new_chain } = source.clone() else {
            panic!("expected derived key");
        };
        keys.commit_key(group, device, 4, Hash::new(b"e4"), key_4, &source)
            .unwrap();
        keys.advance_remote_chain(group, device, &new_chain).unwrap();

        // The stepped-over counters can still be resolved from the cache.
        for counter in 1..=3 {
            let (_, source) = keys
                .lookup_key(group, device, counter, Hash::new(b"late"))
                .unwrap();
            assert!(matches!(source, KeySource::Cached));
        }
    }

    #[test]
    fn consumed_counter_is_replay() {
        let rng = Rng::from_seed([4; 32]);
        let keys = KeyStore::new();
        let (group, device) = ids();

        let secret = DeviceSecret::generate(&rng).unwrap();
        keys.register_chain_key(group, device, secret).unwrap();

        let entry = Hash::new(b"first");
        let (key, source) = keys.lookup_key(group, device, 1, entry).unwrap();
        let KeySource::Derived { new_chain } = source.clone() else {
            panic!("expected derived key");
        };
        keys.commit_key(group, device, 1, entry, key, &source).unwrap();
        keys.advance_remote_chain(group, device, &new_chain).unwrap();

        // Re-opening the same entry works through the entry-hash store.
        let (_, source) = keys.lookup_key(group, device, 1, entry).unwrap();
        assert!(matches!(source, KeySource::ByEntry));

        // A different entry claiming the same counter is a replay.
        assert!(matches!(
            keys.lookup_key(group, device, 1, Hash::new(b"other")),
            Err(KeyStoreError::ReplayedCounter(1))
        ));
    }

    #[test]
    fn unknown_device_is_rejected() {
        let keys = KeyStore::new();
        let (group, device) = ids();
        assert!(matches!(
            keys.lookup_key(group, device, 1, Hash::new(b"e")),
            Err(KeyStoreError::UnknownDevice)
        ));
    }
}

// SPDX-License-Identifier: MIT OR Apache-2.0

//! The local account's key material.
//!
//! An account owns one long-term signing key, one proof key used to assert
//! the account identity across contact groups, and a per-device seed. From
//! these it derives a stable (member, device) pair for every group it
//! participates in: the member key is a pure function of the account key
//! and the group, the device key additionally depends on the device seed so
//! every physical device of the same human shows up as its own device under
//! the same member.
//!
//! Signing and key agreement stay separate: next to each Ed25519 identity
//! the account derives a dedicated X25519 exchange key, one at account
//! level (contact-group agreement) and one per group member (device-secret
//! delivery).
use sett_core::{PrivateKey, PublicKey};

use crate::crypto::x25519;
use crate::crypto::{derive_key, Rng, Secret};
use crate::error::StoreError;
use crate::group::{Group, OwnMemberDevice};

const MEMBER_INFO: &[u8] = b"sett/account/member";
const DEVICE_INFO: &[u8] = b"sett/account/device";
const EXCHANGE_INFO: &[u8] = b"sett/account/exchange";
const MEMBER_EXCHANGE_INFO: &[u8] = b"sett/account/member-exchange";

#[derive(Debug)]
pub struct Account {
    account_key: PrivateKey,
    proof_key: PrivateKey,
    device_seed: Secret<32>,
}

impl Account {
    /// Creates a fresh account with a new device seed.
    pub fn generate(rng: &Rng) -> Result<Self, StoreError> {
        Ok(Self {
            account_key: PrivateKey::from_seed(rng.random_array()?),
            proof_key: PrivateKey::from_seed(rng.random_array()?),
            device_seed: Secret::from_bytes(rng.random_array()?),
        })
    }

    /// Restores an account on a new device: same account and proof keys,
    /// fresh device seed.
    pub fn with_new_device(&self, rng: &Rng) -> Result<Self, StoreError> {
        Ok(Self {
            account_key: self.account_key.clone(),
            proof_key: self.proof_key.clone(),
            device_seed: Secret::from_bytes(rng.random_array()?),
        })
    }

    pub fn account_key(&self) -> &PrivateKey {
        &self.account_key
    }

    pub fn account_pk(&self) -> PublicKey {
        self.account_key.public_key()
    }

    /// Key proving the account identity towards contacts without linking
    /// group memberships together.
    pub fn proof_key(&self) -> &PrivateKey {
        &self.proof_key
    }

    /// The account-level X25519 exchange key, used to agree on contact
    /// groups with peers.
    pub fn exchange_key(&self) -> x25519::SecretKey {
        let seed = derive_key(&self.account_key.to_bytes(), &[EXCHANGE_INFO]);
        x25519::SecretKey::from_bytes(*seed.as_bytes())
    }

    /// Public half of [`Account::exchange_key`], shared with peers during
    /// the contact handshake.
    pub fn exchange_pk(&self) -> x25519::PublicKey {
        self.exchange_key().public_key()
    }

    /// The (member, device) key material this account uses within `group`.
    pub fn member_device_for_group(&self, group: &Group) -> OwnMemberDevice {
        let group_pk = group.public_key();
        let member_seed = derive_key(
            &self.account_key.to_bytes(),
            &[MEMBER_INFO, group_pk.as_bytes()],
        );
        let device_seed = derive_key(
            self.device_seed.as_bytes(),
            &[DEVICE_INFO, group_pk.as_bytes()],
        );
        let exchange_seed = derive_key(
            &self.account_key.to_bytes(),
            &[MEMBER_EXCHANGE_INFO, group_pk.as_bytes()],
        );
        OwnMemberDevice::new(
            PrivateKey::from_seed(*member_seed.as_bytes()),
            PrivateKey::from_seed(*device_seed.as_bytes()),
            x25519::SecretKey::from_bytes(*exchange_seed.as_bytes()),
        )
    }

    /// This account's own private root group.
    pub fn account_group(&self) -> Group {
        Group::account_group(&self.account_key)
    }

    /// The contact group shared with the peer behind `peer_exchange`.
    pub fn contact_group(&self, peer_exchange: &x25519::PublicKey) -> Result<Group, StoreError> {
        Group::contact_group(&self.exchange_key(), peer_exchange)
    }
}

#[cfg(test)]
mod tests {
    use super::Account;
    use crate::crypto::Rng;

    #[test]
    fn member_device_is_stable_per_group() {
        let rng = Rng::from_seed([1; 32]);
        let account = Account::generate(&rng).unwrap();
        let group = account.account_group();

        let one = account.member_device_for_group(&group);
        let two = account.member_device_for_group(&group);
        assert_eq!(one.member_pk(), two.member_pk());
        assert_eq!(one.device_pk(), two.device_pk());
    }

    #[test]
    fn groups_get_distinct_keys() {
        let rng = Rng::from_seed([2; 32]);
        let account = Account::generate(&rng).unwrap();
        let peer = Account::generate(&rng).unwrap();

        let account_group = account.account_group();
        let contact_group = account.contact_group(&peer.exchange_pk()).unwrap();

        let in_account = account.member_device_for_group(&account_group);
        let in_contact = account.member_device_for_group(&contact_group);
        assert_ne!(in_account.member_pk(), in_contact.member_pk());
        assert_ne!(in_account.device_pk(), in_contact.device_pk());
        assert_ne!(
            in_account.exchange_pk().as_bytes(),
            in_contact.exchange_pk().as_bytes()
        );
    }

    #[test]
    fn contact_group_agrees_from_both_sides() {
        let rng = Rng::from_seed([4; 32]);
        let alice = Account::generate(&rng).unwrap();
        let bob = Account::generate(&rng).unwrap();

        let from_alice = alice.contact_group(&bob.exchange_pk()).unwrap();
        let from_bob = bob.contact_group(&alice.exchange_pk()).unwrap();
        assert_eq!(from_alice, from_bob);
    }

    #[test]
    fn second_device_same_member() {
        let rng = Rng::from_seed([3; 32]);
        let account = Account::generate(&rng).unwrap();
        let second_device = account.with_new_device(&rng).unwrap();
        let group = account.account_group();

        let first = account.member_device_for_group(&group);
        let second = second_device.member_device_for_group(&group);
        assert_eq!(first.member_pk(), second.member_pk());
        assert_ne!(first.device_pk(), second.device_pk());
    }
}

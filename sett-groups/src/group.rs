// SPDX-License-Identifier: MIT OR Apache-2.0

//! Group identities and the member-device pair a caller owns within one.
use serde::{Deserialize, Serialize};
use sett_core::{PrivateKey, PublicKey};

use crate::crypto::x25519;
use crate::crypto::{derive_key, CryptoError, Rng, Secret};
use crate::error::StoreError;

const ACCOUNT_GROUP_INFO: &[u8] = b"sett/group/account";
const CONTACT_GROUP_INFO: &[u8] = b"sett/group/contact";
const SHARED_SECRET_INFO: &[u8] = b"sett/group/shared-secret";

/// Kind of a group, fixed at creation.
///
/// Operations are only valid on the kinds they are declared for; everything
/// else is rejected with [`StoreError::GroupKindMismatch`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupKind {
    /// The local user's private root group, holding contacts and
    /// joined-group bookkeeping. Exactly one per account.
    Account,

    /// Two-party group with exactly one remote member. One per contact.
    Contact,

    /// Shared group with any number of members and an explicit admin claim.
    MultiMember,
}

/// A replicated conversation: a cryptographic identity plus a kind.
///
/// The shared secret is known to all members and protects message envelope
/// headers from non-members. Groups are immutable once created.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    public_key: PublicKey,
    shared_secret: Secret<32>,
    kind: GroupKind,
}

impl Group {
    /// Creates a new multi-member group. Returns the group and its private
    /// key; whoever holds the private key can claim ownership of the group
    /// via the metadata store.
    pub fn new_multi_member(rng: &Rng) -> Result<(Self, PrivateKey), StoreError> {
        let group_key = PrivateKey::from_seed(rng.random_array()?);
        let group = Self {
            public_key: group_key.public_key(),
            shared_secret: Secret::from_bytes(rng.random_array()?),
            kind: GroupKind::MultiMember,
        };
        Ok((group, group_key))
    }

    /// The account group of the holder of `account_key`, derived
    /// deterministically so every device of the account opens the same
    /// group.
    pub fn account_group(account_key: &PrivateKey) -> Self {
        let seed = derive_key(&account_key.to_bytes(), &[ACCOUNT_GROUP_INFO]);
        let group_key = PrivateKey::from_seed(*seed.as_bytes());
        Self {
            public_key: group_key.public_key(),
            shared_secret: derive_key(seed.as_bytes(), &[SHARED_SECRET_INFO]),
            kind: GroupKind::Account,
        }
    }

    /// The contact group between the holder of `own_exchange` and `peer`.
    /// Both sides derive the same group from the Diffie-Hellman agreement
    /// of their account exchange keys.
    pub fn contact_group(
        own_exchange: &x25519::SecretKey,
        peer: &x25519::PublicKey,
    ) -> Result<Self, StoreError> {
        let shared = own_exchange
            .calculate_agreement(peer)
            .map_err(|_| StoreError::Crypto(CryptoError::InvalidPeerKey))?;

        // Order the two exchange keys so both sides derive identical bytes.
        let own_pk = own_exchange.public_key();
        let (low, high) = if own_pk.as_bytes() <= peer.as_bytes() {
            (own_pk, *peer)
        } else {
            (*peer, own_pk)
        };

        let seed = derive_key(
            &shared,
            &[CONTACT_GROUP_INFO, low.as_bytes(), high.as_bytes()],
        );
        let group_key = PrivateKey::from_seed(*seed.as_bytes());
        Ok(Self {
            public_key: group_key.public_key(),
            shared_secret: derive_key(seed.as_bytes(), &[SHARED_SECRET_INFO]),
            kind: GroupKind::Contact,
        })
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    pub fn kind(&self) -> GroupKind {
        self.kind
    }

    pub(crate) fn shared_secret(&self) -> &Secret<32> {
        &self.shared_secret
    }

    /// Rejects operations invoked on a group of the wrong kind.
    pub fn require_kind(&self, kinds: &[GroupKind]) -> Result<(), StoreError> {
        if kinds.contains(&self.kind) {
            Ok(())
        } else {
            Err(StoreError::GroupKindMismatch(self.kind))
        }
    }
}

/// The caller's key material for one group: the member and device signing
/// keys plus the member's X25519 exchange key.
///
/// The member key identifies the human, the device key one of their
/// endpoints. Devices admit themselves with a member countersignature, and
/// ratchet chains are scoped per device. The exchange key is what other
/// members seal device secrets towards; its public half is announced next
/// to the member identity when the device admits itself.
#[derive(Clone, Debug)]
pub struct OwnMemberDevice {
    member: PrivateKey,
    device: PrivateKey,
    exchange: x25519::SecretKey,
}

impl OwnMemberDevice {
    pub(crate) fn new(member: PrivateKey, device: PrivateKey, exchange: x25519::SecretKey) -> Self {
        Self {
            member,
            device,
            exchange,
        }
    }

    pub fn member_pk(&self) -> PublicKey {
        self.member.public_key()
    }

    pub fn device_pk(&self) -> PublicKey {
        self.device.public_key()
    }

    pub fn exchange_pk(&self) -> x25519::PublicKey {
        self.exchange.public_key()
    }

    pub(crate) fn member_key(&self) -> &PrivateKey {
        &self.member
    }

    pub(crate) fn device_key(&self) -> &PrivateKey {
        &self.device
    }

    pub(crate) fn exchange_key(&self) -> &x25519::SecretKey {
        &self.exchange
    }
}

#[cfg(test)]
mod tests {
    use sett_core::PrivateKey;

    use super::{Group, GroupKind};
    use crate::crypto::x25519;
    use crate::crypto::Rng;
    use crate::error::StoreError;

    #[test]
    fn account_group_is_stable() {
        let account_key = PrivateKey::new();
        let one = Group::account_group(&account_key);
        let two = Group::account_group(&account_key);
        assert_eq!(one, two);
        assert_eq!(one.kind(), GroupKind::Account);
    }

    #[test]
    fn contact_group_is_symmetric() {
        let rng = Rng::from_seed([8; 32]);
        let alice = x25519::SecretKey::from_bytes(rng.random_array().unwrap());
        let bob = x25519::SecretKey::from_bytes(rng.random_array().unwrap());

        let from_alice = Group::contact_group(&alice, &bob.public_key()).unwrap();
        let from_bob = Group::contact_group(&bob, &alice.public_key()).unwrap();
        assert_eq!(from_alice, from_bob);
        assert_eq!(from_alice.kind(), GroupKind::Contact);
    }

    #[test]
    fn kind_discrimination() {
        let rng = Rng::from_seed([9; 32]);
        let (group, _) = Group::new_multi_member(&rng).unwrap();

        assert!(group.require_kind(&[GroupKind::MultiMember]).is_ok());
        assert!(matches!(
            group.require_kind(&[GroupKind::Account]),
            Err(StoreError::GroupKindMismatch(GroupKind::MultiMember))
        ));
    }
}

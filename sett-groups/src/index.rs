// SPDX-License-Identifier: MIT OR Apache-2.0

//! Derived state of one metadata log.
//!
//! The index folds every decoded metadata event into queryable state under
//! a single exclusive lock. Folds are pure, idempotent reductions: the
//! resulting state is a function of the set of valid entries observed so
//! far, independent of the causally-valid order they arrived in. Events
//! that do not fit the current state are dropped, never raised — an
//! out-of-order or malicious replicated entry must not wedge a peer.
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use sett_core::{decode_cbor, Hash, PublicKey};
use tracing::{debug, warn};

use crate::crypto::open_sealed;
use crate::crypto::ratchet::DeviceSecret;
use crate::crypto::x25519;
use crate::event::{
    ContactState, GroupJoinState, GroupMetadataEvent, MetadataEvent, ShareableContact,
};
use crate::group::{Group, GroupKind};
use crate::keystore::KeyStore;

#[derive(Debug, Clone)]
struct ContactRecord {
    contact: ShareableContact,
    state: ContactState,
    /// Whether an incoming request from this peer was observed; needed so
    /// the concurrent enqueue/received cross-over converges to the same
    /// state in every delivery order.
    incoming_seen: bool,
}

#[derive(Debug, Clone)]
struct GroupRecord {
    group: Option<Group>,
    state: GroupJoinState,
}

#[derive(Debug, Default)]
struct IndexState {
    seen: HashSet<Hash>,
    devices: HashMap<PublicKey, PublicKey>,
    members: HashMap<PublicKey, Vec<PublicKey>>,
    member_exchange: HashMap<PublicKey, x25519::PublicKey>,
    admins: HashSet<PublicKey>,
    secrets_delivered: HashSet<(PublicKey, PublicKey)>,
    groups: HashMap<PublicKey, GroupRecord>,
    contacts: HashMap<PublicKey, ContactRecord>,
    contact_requests_enabled: bool,
    contact_requests_seed: Vec<u8>,
}

/// In-memory projection of a group's metadata log.
#[derive(Debug)]
pub struct MetadataIndex {
    group: Group,
    own_member_pk: PublicKey,
    own_exchange: x25519::SecretKey,
    keys: Arc<KeyStore>,
    state: RwLock<IndexState>,
}

impl MetadataIndex {
    pub(crate) fn new(
        group: Group,
        own_member_pk: PublicKey,
        own_exchange: x25519::SecretKey,
        keys: Arc<KeyStore>,
    ) -> Self {
        Self {
            group,
            own_member_pk,
            own_exchange,
            keys,
            state: RwLock::new(IndexState::default()),
        }
    }

    /// Folds one decoded event into the index. Re-delivery of an already
    /// handled entry is a no-op.
    pub fn handle_event(&self, event: &GroupMetadataEvent) {
        let mut state = match self.state.write() {
            Ok(state) => state,
            Err(_) => {
                warn!("metadata index lock poisoned, dropping event");
                return;
            }
        };

        if !state.seen.insert(event.context.entry_hash) {
            return;
        }

        match &event.event {
            MetadataEvent::GroupMemberDeviceAdded {
                member_pk,
                device_pk,
                member_sig,
                member_xpk,
            } => {
                if *device_pk != event.metadata.device_pk {
                    debug!(entry = %event.context.entry_hash, "device admission not self-signed, ignoring");
                    return;
                }
                if !member_pk.verify(device_pk.as_bytes(), member_sig) {
                    debug!(entry = %event.context.entry_hash, "member countersignature invalid, ignoring");
                    return;
                }
                if state.devices.contains_key(device_pk) {
                    return;
                }
                state.devices.insert(*device_pk, *member_pk);
                state.members.entry(*member_pk).or_default().push(*device_pk);
                state.member_exchange.insert(*member_pk, *member_xpk);
            }

            MetadataEvent::GroupDeviceSecretAdded {
                device_pk,
                dest_member_pk,
                payload,
            } => {
                state.secrets_delivered.insert((*device_pk, *dest_member_pk));
                if *dest_member_pk == self.own_member_pk {
                    self.seed_chain(*device_pk, payload);
                }
            }

            MetadataEvent::MultiMemberInitialMember { member_pk } => {
                // The group-key signature was checked when the envelope was
                // opened.
                state.admins.insert(*member_pk);
            }

            MetadataEvent::MultiMemberGroupAliasResolverAdded { .. } => {
                // Reserved event shape, nothing to project yet.
            }

            MetadataEvent::AccountGroupJoined { group } => {
                if self.group.kind() != GroupKind::Account {
                    return;
                }
                let record = state.groups.entry(group.public_key()).or_insert(GroupRecord {
                    group: None,
                    state: GroupJoinState::Joined,
                });
                record.group = Some(group.clone());
                record.state = GroupJoinState::Joined;
            }

            MetadataEvent::AccountGroupLeft { group_pk } => {
                if self.group.kind() != GroupKind::Account {
                    return;
                }
                if let Some(record) = state.groups.get_mut(group_pk) {
                    record.state = GroupJoinState::Left;
                }
            }

            MetadataEvent::AccountContactRequestEnabled => {
                if self.group.kind() == GroupKind::Account {
                    state.contact_requests_enabled = true;
                }
            }

            MetadataEvent::AccountContactRequestDisabled => {
                if self.group.kind() == GroupKind::Account {
                    state.contact_requests_enabled = false;
                }
            }

            MetadataEvent::AccountContactRequestReferenceReset { rendezvous_seed } => {
                if self.group.kind() == GroupKind::Account {
                    state.contact_requests_seed = rendezvous_seed.clone();
                }
            }

            MetadataEvent::AccountContactRequestEnqueued {
                contact_pk,
                rendezvous_seed,
                metadata,
            } => {
                if self.group.kind() != GroupKind::Account {
                    return;
                }
                let record = contact_entry(&mut state, *contact_pk, ContactState::ToRequest);
                merge_contact_details(record, rendezvous_seed, metadata);
                match record.state {
                    ContactState::Received => record.state = ContactState::Sent,
                    ContactState::Removed | ContactState::Discarded => {
                        record.state = ContactState::ToRequest
                    }
                    _ => {}
                }
            }

            MetadataEvent::AccountContactRequestSent { contact_pk } => {
                if self.group.kind() != GroupKind::Account {
                    return;
                }
                let record = contact_entry(&mut state, *contact_pk, ContactState::Sent);
                match record.state {
                    ContactState::Added | ContactState::Blocked => {}
                    _ => {
                        record.state = if record.incoming_seen {
                            ContactState::Added
                        } else {
                            ContactState::Sent
                        }
                    }
                }
            }

            MetadataEvent::AccountContactRequestReceived {
                contact_pk,
                rendezvous_seed,
                metadata,
            } => {
                if self.group.kind() != GroupKind::Account {
                    return;
                }
                let record = contact_entry(&mut state, *contact_pk, ContactState::Received);
                merge_contact_details(record, rendezvous_seed, metadata);
                record.incoming_seen = true;
                match record.state {
                    ContactState::ToRequest => record.state = ContactState::Sent,
                    ContactState::Sent => record.state = ContactState::Added,
                    ContactState::Removed | ContactState::Discarded => {
                        record.state = ContactState::Received
                    }
                    _ => {}
                }
            }

            MetadataEvent::AccountContactRequestDiscarded { contact_pk } => {
                if self.group.kind() != GroupKind::Account {
                    return;
                }
                if let Some(record) = state.contacts.get_mut(contact_pk) {
                    if record.state == ContactState::Received {
                        record.state = ContactState::Discarded;
                    }
                }
            }

            MetadataEvent::AccountContactRequestAccepted { contact_pk } => {
                if self.group.kind() != GroupKind::Account {
                    return;
                }
                if let Some(record) = state.contacts.get_mut(contact_pk) {
                    if record.state == ContactState::Received {
                        record.state = ContactState::Added;
                    }
                }
            }

            MetadataEvent::AccountContactBlocked { contact_pk } => {
                if self.group.kind() != GroupKind::Account {
                    return;
                }
                let record = contact_entry(&mut state, *contact_pk, ContactState::Blocked);
                record.state = ContactState::Blocked;
            }

            MetadataEvent::AccountContactUnblocked { contact_pk } => {
                if self.group.kind() != GroupKind::Account {
                    return;
                }
                if let Some(record) = state.contacts.get_mut(contact_pk) {
                    if record.state == ContactState::Blocked {
                        record.state = ContactState::Removed;
                    }
                }
            }

            MetadataEvent::ContactAliasKeyAdded { .. } => {
                // Delivered to subscribers; nothing to project.
            }
        }
    }

    /// Opens a device-secret payload destined to the own member and seeds
    /// the key store with the sender's chain.
    fn seed_chain(&self, sender_device: PublicKey, payload: &[u8]) {
        let opened = match open_sealed(&self.own_exchange, payload) {
            Ok(opened) => opened,
            Err(err) => {
                warn!(%sender_device, "cannot open device secret destined to us: {err}");
                return;
            }
        };
        let secret: DeviceSecret = match decode_cbor(&opened) {
            Ok(secret) => secret,
            Err(err) => {
                warn!(%sender_device, "malformed device secret payload: {err}");
                return;
            }
        };
        if let Err(err) =
            self.keys
                .register_chain_key(self.group.public_key(), sender_device, secret)
        {
            warn!(%sender_device, "cannot register chain key: {err}");
        }
    }

    pub fn get_member_by_device(&self, device_pk: &PublicKey) -> Option<PublicKey> {
        self.read(|state| state.devices.get(device_pk).copied())
    }

    pub fn get_devices_for_member(&self, member_pk: &PublicKey) -> Vec<PublicKey> {
        self.read(|state| state.members.get(member_pk).cloned().unwrap_or_default())
    }

    /// The exchange key a member announced on admission, needed to seal
    /// device secrets towards them.
    pub fn get_member_exchange_key(&self, member_pk: &PublicKey) -> Option<x25519::PublicKey> {
        self.read(|state| state.member_exchange.get(member_pk).copied())
    }

    pub fn list_members(&self) -> Vec<PublicKey> {
        self.read(|state| state.members.keys().copied().collect())
    }

    pub fn list_devices(&self) -> Vec<PublicKey> {
        self.read(|state| state.devices.keys().copied().collect())
    }

    pub fn list_admins(&self) -> Vec<PublicKey> {
        self.read(|state| state.admins.iter().copied().collect())
    }

    /// Whether a device-secret event from `sender_device` towards
    /// `dest_member` has been observed. Monotonic: once true, stays true.
    pub fn are_secrets_already_sent(
        &self,
        sender_device: &PublicKey,
        dest_member: &PublicKey,
    ) -> bool {
        self.read(|state| {
            state
                .secrets_delivered
                .contains(&(*sender_device, *dest_member))
        })
    }

    pub fn get_contact(&self, contact_pk: &PublicKey) -> Option<(ShareableContact, ContactState)> {
        self.read(|state| {
            state
                .contacts
                .get(contact_pk)
                .map(|record| (record.contact.clone(), record.state))
        })
    }

    pub fn contact_state(&self, contact_pk: &PublicKey) -> Option<ContactState> {
        self.read(|state| state.contacts.get(contact_pk).map(|record| record.state))
    }

    pub fn list_contacts_by_status(&self, status: ContactState) -> Vec<ShareableContact> {
        self.read(|state| {
            state
                .contacts
                .values()
                .filter(|record| record.state == status)
                .map(|record| record.contact.clone())
                .collect()
        })
    }

    pub fn contact_requests_enabled(&self) -> bool {
        self.read(|state| state.contact_requests_enabled)
    }

    pub fn contact_requests_seed(&self) -> Vec<u8> {
        self.read(|state| state.contact_requests_seed.clone())
    }

    pub fn list_joined_groups(&self) -> Vec<Group> {
        self.read(|state| {
            state
                .groups
                .values()
                .filter(|record| record.state == GroupJoinState::Joined)
                .filter_map(|record| record.group.clone())
                .collect()
        })
    }

    pub fn is_group_joined(&self, group_pk: &PublicKey) -> bool {
        self.read(|state| {
            state
                .groups
                .get(group_pk)
                .map(|record| record.state == GroupJoinState::Joined)
                .unwrap_or(false)
        })
    }

    fn read<T>(&self, f: impl FnOnce(&IndexState) -> T) -> T
    where
        T: Default,
    {
        match self.state.read() {
            Ok(state) => f(&state),
            Err(_) => {
                warn!("metadata index lock poisoned, returning default");
                T::default()
            }
        }
    }
}

/// Looks up the record of a contact, creating it in `initial` state when
/// this is the first event observed for the peer.
fn contact_entry(
    state: &mut IndexState,
    contact_pk: PublicKey,
    initial: ContactState,
) -> &mut ContactRecord {
    state.contacts.entry(contact_pk).or_insert(ContactRecord {
        contact: ShareableContact::new(contact_pk, Vec::new()),
        state: initial,
        incoming_seen: false,
    })
}

fn merge_contact_details(record: &mut ContactRecord, rendezvous_seed: &[u8], metadata: &[u8]) {
    if !rendezvous_seed.is_empty() {
        record.contact.rendezvous_seed = rendezvous_seed.to_vec();
    }
    if !metadata.is_empty() {
        record.contact.metadata = metadata.to_vec();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use sett_core::{Hash, PrivateKey};

    use super::MetadataIndex;
    use crate::crypto::x25519;
    use crate::crypto::Rng;
    use crate::event::{
        ContactState, EventContext, EventType, GroupMetadata, GroupMetadataEvent, MetadataEvent,
    };
    use crate::group::Group;
    use crate::keystore::KeyStore;

    fn account_index() -> MetadataIndex {
        let account_key = PrivateKey::new();
        let group = Group::account_group(&account_key);
        MetadataIndex::new(
            group,
            PrivateKey::new().public_key(),
            x25519::SecretKey::from_bytes([41; 32]),
            Arc::new(KeyStore::new()),
        )
    }

    fn wrap(index: &MetadataIndex, n: u64, event: MetadataEvent) -> GroupMetadataEvent {
        wrap_from(index, n, event, PrivateKey::new().public_key())
    }

    fn wrap_from(
        index: &MetadataIndex,
        n: u64,
        event: MetadataEvent,
        device_pk: sett_core::PublicKey,
    ) -> GroupMetadataEvent {
        GroupMetadataEvent {
            context: EventContext {
                entry_hash: Hash::new(n.to_le_bytes()),
                parent_hashes: vec![],
                group_pk: index.group.public_key(),
            },
            metadata: GroupMetadata {
                event_type: event.event_type(),
                device_pk,
                sig: PrivateKey::new().sign(b"irrelevant for the index"),
            },
            event,
        }
    }

    fn device_added(index: &MetadataIndex, n: u64) -> (GroupMetadataEvent, PrivateKey, PrivateKey)
    {
        let member = PrivateKey::new();
        let device = PrivateKey::new();
        let exchange = x25519::SecretKey::from_bytes([n as u8; 32]);
        let event = MetadataEvent::GroupMemberDeviceAdded {
            member_pk: member.public_key(),
            device_pk: device.public_key(),
            member_sig: member.sign(device.public_key().as_bytes()),
            member_xpk: exchange.public_key(),
        };
        let wrapped = wrap_from(index, n, event, device.public_key());
        (wrapped, member, device)
    }

    #[test]
    fn admission_requires_countersignature() {
        let index = account_index();

        let member = PrivateKey::new();
        let device = PrivateKey::new();
        let bad = wrap_from(
            &index,
            1,
            MetadataEvent::GroupMemberDeviceAdded {
                member_pk: member.public_key(),
                device_pk: device.public_key(),
                member_sig: PrivateKey::new().sign(device.public_key().as_bytes()),
                member_xpk: x25519::SecretKey::from_bytes([1; 32]).public_key(),
            },
            device.public_key(),
        );
        index.handle_event(&bad);
        assert!(index.list_members().is_empty());

        let (good, member, device) = device_added(&index, 2);
        index.handle_event(&good);
        assert_eq!(index.list_members(), vec![member.public_key()]);
        assert_eq!(
            index.get_member_by_device(&device.public_key()),
            Some(member.public_key())
        );
        assert!(index.get_member_exchange_key(&member.public_key()).is_some());
    }

    #[test]
    fn admission_must_be_self_signed() {
        let index = account_index();

        let member = PrivateKey::new();
        let device = PrivateKey::new();
        let event = MetadataEvent::GroupMemberDeviceAdded {
            member_pk: member.public_key(),
            device_pk: device.public_key(),
            member_sig: member.sign(device.public_key().as_bytes()),
            member_xpk: x25519::SecretKey::from_bytes([2; 32]).public_key(),
        };
        // Envelope authored by a different device than the admitted one.
        let wrapped = wrap_from(&index, 1, event, PrivateKey::new().public_key());
        index.handle_event(&wrapped);
        assert!(index.list_devices().is_empty());
    }

    #[test]
    fn same_entry_twice_is_a_noop() {
        let index = account_index();
        let (event, member, _) = device_added(&index, 1);

        index.handle_event(&event);
        index.handle_event(&event);
        assert_eq!(
            index.get_devices_for_member(&member.public_key()).len(),
            1
        );
    }

    #[test]
    fn secrets_ledger_is_monotonic() {
        let index = account_index();
        let sender = PrivateKey::new().public_key();
        let dest = PrivateKey::new().public_key();

        assert!(!index.are_secrets_already_sent(&sender, &dest));
        index.handle_event(&wrap(
            &index,
            1,
            MetadataEvent::GroupDeviceSecretAdded {
                device_pk: sender,
                dest_member_pk: dest,
                payload: b"opaque to us".to_vec(),
            },
        ));
        assert!(index.are_secrets_already_sent(&sender, &dest));
    }

    #[test]
    fn joined_groups_toggle() {
        let index = account_index();
        let rng = Rng::from_seed([1; 32]);
        let (group, _) = Group::new_multi_member(&rng).unwrap();
        let group_pk = group.public_key();

        index.handle_event(&wrap(&index, 1, MetadataEvent::AccountGroupJoined { group }));
        assert!(index.is_group_joined(&group_pk));
        assert_eq!(index.list_joined_groups().len(), 1);

        index.handle_event(&wrap(&index, 2, MetadataEvent::AccountGroupLeft { group_pk }));
        assert!(!index.is_group_joined(&group_pk));
        assert!(index.list_joined_groups().is_empty());
    }

    #[test]
    fn contact_request_flags() {
        let index = account_index();
        assert!(!index.contact_requests_enabled());

        index.handle_event(&wrap(&index, 1, MetadataEvent::AccountContactRequestEnabled));
        assert!(index.contact_requests_enabled());

        index.handle_event(&wrap(
            &index,
            2,
            MetadataEvent::AccountContactRequestReferenceReset {
                rendezvous_seed: vec![9; 32],
            },
        ));
        assert_eq!(index.contact_requests_seed(), vec![9; 32]);

        index.handle_event(&wrap(
            &index,
            3,
            MetadataEvent::AccountContactRequestDisabled,
        ));
        assert!(!index.contact_requests_enabled());
    }

    #[test]
    fn cross_over_converges_in_every_order() {
        let contact_pk = PrivateKey::new().public_key();
        let enqueued = MetadataEvent::AccountContactRequestEnqueued {
            contact_pk,
            rendezvous_seed: vec![1; 32],
            metadata: vec![],
        };
        let sent = MetadataEvent::AccountContactRequestSent { contact_pk };
        let received = MetadataEvent::AccountContactRequestReceived {
            contact_pk,
            rendezvous_seed: vec![2; 32],
            metadata: vec![],
        };

        // The sent event causally follows the enqueued one; received is
        // concurrent to both. All interleavings must agree.
        let orders: Vec<Vec<&MetadataEvent>> = vec![
            vec![&enqueued, &sent, &received],
            vec![&enqueued, &received, &sent],
            vec![&received, &enqueued, &sent],
        ];

        for order in orders {
            let index = account_index();
            for (n, event) in order.iter().enumerate() {
                index.handle_event(&wrap(&index, n as u64, (*event).clone()));
            }
            assert_eq!(
                index.contact_state(&contact_pk),
                Some(ContactState::Added),
                "all orders resolve the mutual request to Added"
            );
        }
    }

    #[test]
    fn concurrent_enqueue_and_received_resolve_to_sent() {
        let contact_pk = PrivateKey::new().public_key();
        let enqueued = MetadataEvent::AccountContactRequestEnqueued {
            contact_pk,
            rendezvous_seed: vec![1; 32],
            metadata: vec![],
        };
        let received = MetadataEvent::AccountContactRequestReceived {
            contact_pk,
            rendezvous_seed: vec![2; 32],
            metadata: vec![],
        };

        for order in [[&enqueued, &received], [&received, &enqueued]] {
            let index = account_index();
            for (n, event) in order.iter().enumerate() {
                index.handle_event(&wrap(&index, n as u64, (*event).clone()));
            }
            assert_eq!(index.contact_state(&contact_pk), Some(ContactState::Sent));
        }
    }

    #[test]
    fn block_and_unblock() {
        let index = account_index();
        let contact_pk = PrivateKey::new().public_key();

        index.handle_event(&wrap(
            &index,
            1,
            MetadataEvent::AccountContactBlocked { contact_pk },
        ));
        assert_eq!(index.contact_state(&contact_pk), Some(ContactState::Blocked));

        index.handle_event(&wrap(
            &index,
            2,
            MetadataEvent::AccountContactUnblocked { contact_pk },
        ));
        assert_eq!(index.contact_state(&contact_pk), Some(ContactState::Removed));

        // Unblocking an unblocked contact changes nothing.
        index.handle_event(&wrap(
            &index,
            3,
            MetadataEvent::AccountContactUnblocked { contact_pk },
        ));
        assert_eq!(index.contact_state(&contact_pk), Some(ContactState::Removed));
    }

    #[test]
    fn discard_and_accept_only_from_received() {
        let index = account_index();
        let contact_pk = PrivateKey::new().public_key();

        // Discarding an unknown contact is dropped.
        index.handle_event(&wrap(
            &index,
            1,
            MetadataEvent::AccountContactRequestDiscarded { contact_pk },
        ));
        assert_eq!(index.contact_state(&contact_pk), None);

        index.handle_event(&wrap(
            &index,
            2,
            MetadataEvent::AccountContactRequestReceived {
                contact_pk,
                rendezvous_seed: vec![],
                metadata: vec![],
            },
        ));
        index.handle_event(&wrap(
            &index,
            3,
            MetadataEvent::AccountContactRequestAccepted { contact_pk },
        ));
        assert_eq!(index.contact_state(&contact_pk), Some(ContactState::Added));
    }

    #[test]
    fn event_type_helper_matches() {
        // Guards the envelope's tag consistency check.
        let event = MetadataEvent::AccountContactRequestEnabled;
        assert_eq!(event.event_type(), EventType::AccountContactRequestEnabled);
    }
}

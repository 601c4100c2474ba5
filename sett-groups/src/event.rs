// SPDX-License-Identifier: MIT OR Apache-2.0

//! Typed metadata and message events as they appear on the wire and as they
//! are handed to subscribers.
use serde::{Deserialize, Serialize};
use sett_core::{Hash, PublicKey, Signature};

use crate::crypto::x25519;
use crate::error::StoreError;
use crate::group::Group;

/// Length of the rendezvous seed used for contact requests.
pub const RENDEZVOUS_SEED_LEN: usize = 32;

/// Discriminant of a metadata event, carried in the group envelope next to
/// the payload it describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    GroupMemberDeviceAdded,
    GroupDeviceSecretAdded,
    MultiMemberInitialMember,
    MultiMemberGroupAliasResolverAdded,
    AccountGroupJoined,
    AccountGroupLeft,
    AccountContactRequestEnabled,
    AccountContactRequestDisabled,
    AccountContactRequestReferenceReset,
    AccountContactRequestEnqueued,
    AccountContactRequestSent,
    AccountContactRequestReceived,
    AccountContactRequestDiscarded,
    AccountContactRequestAccepted,
    AccountContactBlocked,
    AccountContactUnblocked,
    ContactAliasKeyAdded,
}

/// Tagged union of all metadata events replicated through a group's
/// metadata log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MetadataEvent {
    /// A device admits itself into the group, countersigned by its member
    /// key. The member's exchange key is announced alongside so other
    /// members can seal device secrets towards it.
    GroupMemberDeviceAdded {
        member_pk: PublicKey,
        device_pk: PublicKey,
        member_sig: Signature,
        member_xpk: x25519::PublicKey,
    },

    /// A device shares its ratchet chain state with one destination member.
    /// The payload is sealed towards `dest_member_pk` and opaque to
    /// everyone else.
    GroupDeviceSecretAdded {
        device_pk: PublicKey,
        dest_member_pk: PublicKey,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },

    /// A member announces itself as initial admin of a multi-member group.
    /// The envelope signature is made with the group's private key.
    MultiMemberInitialMember { member_pk: PublicKey },

    /// Reserved: alias resolver and proof are published as empty byte
    /// strings until their construction is specified.
    MultiMemberGroupAliasResolverAdded {
        #[serde(with = "serde_bytes")]
        alias_resolver: Vec<u8>,
        #[serde(with = "serde_bytes")]
        alias_proof: Vec<u8>,
    },

    AccountGroupJoined { group: Group },

    AccountGroupLeft { group_pk: PublicKey },

    AccountContactRequestEnabled,

    AccountContactRequestDisabled,

    AccountContactRequestReferenceReset {
        #[serde(with = "serde_bytes")]
        rendezvous_seed: Vec<u8>,
    },

    AccountContactRequestEnqueued {
        contact_pk: PublicKey,
        #[serde(with = "serde_bytes")]
        rendezvous_seed: Vec<u8>,
        #[serde(with = "serde_bytes")]
        metadata: Vec<u8>,
    },

    AccountContactRequestSent { contact_pk: PublicKey },

    AccountContactRequestReceived {
        contact_pk: PublicKey,
        #[serde(with = "serde_bytes")]
        rendezvous_seed: Vec<u8>,
        #[serde(with = "serde_bytes")]
        metadata: Vec<u8>,
    },

    AccountContactRequestDiscarded { contact_pk: PublicKey },

    AccountContactRequestAccepted { contact_pk: PublicKey },

    AccountContactBlocked { contact_pk: PublicKey },

    AccountContactUnblocked { contact_pk: PublicKey },

    /// Publishes the account proof public key inside a contact group.
    ContactAliasKeyAdded { alias_pk: PublicKey },
}

impl MetadataEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            MetadataEvent::GroupMemberDeviceAdded { .. } => EventType::GroupMemberDeviceAdded,
            MetadataEvent::GroupDeviceSecretAdded { .. } => EventType::GroupDeviceSecretAdded,
            MetadataEvent::MultiMemberInitialMember { .. } => EventType::MultiMemberInitialMember,
            MetadataEvent::MultiMemberGroupAliasResolverAdded { .. } => {
                EventType::MultiMemberGroupAliasResolverAdded
            }
            MetadataEvent::AccountGroupJoined { .. } => EventType::AccountGroupJoined,
            MetadataEvent::AccountGroupLeft { .. } => EventType::AccountGroupLeft,
            MetadataEvent::AccountContactRequestEnabled => EventType::AccountContactRequestEnabled,
            MetadataEvent::AccountContactRequestDisabled => {
                EventType::AccountContactRequestDisabled
            }
            MetadataEvent::AccountContactRequestReferenceReset { .. } => {
                EventType::AccountContactRequestReferenceReset
            }
            MetadataEvent::AccountContactRequestEnqueued { .. } => {
                EventType::AccountContactRequestEnqueued
            }
            MetadataEvent::AccountContactRequestSent { .. } => EventType::AccountContactRequestSent,
            MetadataEvent::AccountContactRequestReceived { .. } => {
                EventType::AccountContactRequestReceived
            }
            MetadataEvent::AccountContactRequestDiscarded { .. } => {
                EventType::AccountContactRequestDiscarded
            }
            MetadataEvent::AccountContactRequestAccepted { .. } => {
                EventType::AccountContactRequestAccepted
            }
            MetadataEvent::AccountContactBlocked { .. } => EventType::AccountContactBlocked,
            MetadataEvent::AccountContactUnblocked { .. } => EventType::AccountContactUnblocked,
            MetadataEvent::ContactAliasKeyAdded { .. } => EventType::ContactAliasKeyAdded,
        }
    }
}

/// Where in the log an event was observed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventContext {
    pub entry_hash: Hash,
    pub parent_hashes: Vec<Hash>,
    pub group_pk: PublicKey,
}

/// Authenticated envelope fields of a metadata event.
#[derive(Clone, Debug, PartialEq)]
pub struct GroupMetadata {
    pub event_type: EventType,
    pub device_pk: PublicKey,
    pub sig: Signature,
}

/// A decoded, verified metadata event as delivered to subscribers and the
/// index.
#[derive(Clone, Debug)]
pub struct GroupMetadataEvent {
    pub context: EventContext,
    pub metadata: GroupMetadata,
    pub event: MetadataEvent,
}

/// Per-message headers, protected by the group-scoped outer envelope layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageHeaders {
    pub counter: u64,
    pub device_pk: PublicKey,
    pub sig: Signature,
}

/// A decrypted message as delivered to subscribers.
#[derive(Clone, Debug)]
pub struct GroupMessageEvent {
    pub context: EventContext,
    pub headers: MessageHeaders,
    pub message: Vec<u8>,
    /// Set when the plaintext was recovered but advancing the sender's
    /// ratchet afterwards failed; recoverable by later re-derivation.
    pub warning: Option<String>,
}

/// State of a contact as tracked by the account group's index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContactState {
    ToRequest,
    Sent,
    Received,
    Added,
    Removed,
    Discarded,
    Blocked,
}

/// Joined-state of a multi-member group as tracked by the account group's
/// index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupJoinState {
    Joined,
    Left,
}

/// Everything needed to reach a peer: their public key, the rendezvous
/// point to meet them at and optional opaque metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShareableContact {
    pub pk: PublicKey,
    pub rendezvous_seed: Vec<u8>,
    pub metadata: Vec<u8>,
}

impl ShareableContact {
    pub fn new(pk: PublicKey, rendezvous_seed: Vec<u8>) -> Self {
        Self {
            pk,
            rendezvous_seed,
            metadata: Vec::new(),
        }
    }

    /// A contact is well-formed when its rendezvous seed is either absent
    /// or of the fixed length.
    pub fn check_format(&self) -> Result<(), StoreError> {
        if !self.rendezvous_seed.is_empty() && self.rendezvous_seed.len() != RENDEZVOUS_SEED_LEN {
            return Err(StoreError::InvalidInput);
        }
        Ok(())
    }
}

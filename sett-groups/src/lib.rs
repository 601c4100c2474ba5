// SPDX-License-Identifier: MIT OR Apache-2.0

//! `sett-groups` is the replicated group state layer of the sett protocol.
//!
//! A *group* is an eventually consistent, cryptographically authenticated
//! distributed log shared by its member devices. Two logs coexist per
//! group: a **metadata log** governing membership, roles, secret exchange
//! and account-level relationships, and a **message log** carrying
//! end-to-end encrypted user payloads.
//!
//! ## Convergence
//!
//! Peers ingest replicated entries in any order consistent with their
//! causal parents. Every peer folds the same set of valid entries into the
//! same derived state: the [`MetadataIndex`] is a pure function of the
//! entries observed so far. Malformed or forged entries are dropped during
//! ingest without affecting anything else.
//!
//! ## Secrecy
//!
//! Message payloads are protected by a per-device forward-secret ratchet.
//! Devices share their chain state through sealed device-secret events on
//! the metadata log; until that secret arrives, a message entry simply
//! stays unreadable in the log and resolves on a later scan. There is no
//! ordering between the two logs of a group.
//!
//! ## Entry points
//!
//! Open a [`GroupContext`] per group. The context owns the
//! [`MetadataStore`] and [`MessageStore`] for one group identity and the
//! caller's own member-device in it.
pub mod account;
pub mod context;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod event;
pub mod group;
pub mod index;
pub mod keystore;
pub mod log;
pub mod message;
pub mod metadata;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;

pub use account::Account;
pub use context::GroupContext;
pub use crypto::ratchet::DeviceSecret;
pub use crypto::Rng;
pub use envelope::{
    open_envelope, open_group_envelope, post_decrypt_actions, seal_envelope, seal_group_envelope,
    EnvelopeError,
};
pub use error::StoreError;
pub use event::{
    ContactState, EventContext, EventType, GroupJoinState, GroupMessageEvent, GroupMetadata,
    GroupMetadataEvent, MessageHeaders, MetadataEvent, ShareableContact, RENDEZVOUS_SEED_LEN,
};
pub use group::{Group, GroupKind, OwnMemberDevice};
pub use index::MetadataIndex;
pub use keystore::{DecryptInfo, KeyStore, KeyStoreError, PRECOMPUTE_WINDOW};
pub use log::{LogEntry, LogError, LogEvent, MemoryLog, ReplicatedLog};
pub use message::MessageStore;
pub use metadata::MetadataStore;

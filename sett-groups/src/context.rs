// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-group composition of the metadata and message stores.
use std::sync::Arc;

use sett_core::{PrivateKey, PublicKey};

use crate::account::Account;
use crate::crypto::Rng;
use crate::error::StoreError;
use crate::event::{ContactState, GroupMessageEvent, ShareableContact};
use crate::group::{Group, OwnMemberDevice};
use crate::keystore::KeyStore;
use crate::log::{LogEntry, ReplicatedLog};
use crate::message::MessageStore;
use crate::metadata::MetadataStore;

/// Entry point for callers: one group, its two stores and the caller's own
/// member-device within it.
///
/// The account is one distinguished group, contacts are one-per-peer groups
/// and multi-member groups are shared; the context is the same for all
/// three kinds, the kind only decides which operations are accepted.
pub struct GroupContext {
    group: Group,
    metadata: MetadataStore,
    messages: MessageStore,
}

impl GroupContext {
    /// Opens both stores over the given logs: existing entries are folded
    /// into the index, then replication deliveries flow.
    pub async fn open(
        group: Group,
        account: Arc<Account>,
        keys: Arc<KeyStore>,
        rng: Arc<Rng>,
        metadata_log: Arc<dyn ReplicatedLog>,
        message_log: Arc<dyn ReplicatedLog>,
    ) -> Result<Self, StoreError> {
        let metadata = MetadataStore::open(
            group.clone(),
            account.clone(),
            keys.clone(),
            rng.clone(),
            metadata_log,
        )
        .await?;
        let messages =
            MessageStore::open(group.clone(), account, keys, rng, message_log).await?;
        Ok(Self {
            group,
            metadata,
            messages,
        })
    }

    pub fn group(&self) -> &Group {
        &self.group
    }

    pub fn own_member_device(&self) -> &OwnMemberDevice {
        self.metadata.own_member_device()
    }

    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    pub fn messages(&self) -> &MessageStore {
        &self.messages
    }

    // Frequently used operations, delegated for convenience.

    pub async fn add_device_to_group(&self) -> Result<Option<LogEntry>, StoreError> {
        self.metadata.add_device_to_group().await
    }

    pub async fn send_secret(&self, dest_member: PublicKey) -> Result<Option<LogEntry>, StoreError> {
        self.metadata.send_secret(dest_member).await
    }

    pub async fn claim_group_ownership(
        &self,
        group_key: &PrivateKey,
    ) -> Result<LogEntry, StoreError> {
        self.metadata.claim_group_ownership(group_key).await
    }

    pub async fn add_message(&self, payload: &[u8]) -> Result<LogEntry, StoreError> {
        self.messages.add_message(payload).await
    }

    pub async fn list_messages(&self) -> tokio::sync::mpsc::Receiver<GroupMessageEvent> {
        self.messages.list_messages().await
    }

    pub fn list_members(&self) -> Vec<PublicKey> {
        self.metadata.list_members()
    }

    pub fn list_devices(&self) -> Vec<PublicKey> {
        self.metadata.list_devices()
    }

    pub fn list_admins(&self) -> Vec<PublicKey> {
        self.metadata.list_admins()
    }

    pub fn get_contact(&self, contact_pk: &PublicKey) -> Option<(ShareableContact, ContactState)> {
        self.metadata.get_contact(contact_pk)
    }

    /// Drains subscribers and stops both stores' ingest tasks. The
    /// underlying logs are left untouched.
    pub async fn close(self) {
        self.metadata.close().await;
        self.messages.close().await;
    }
}

// SPDX-License-Identifier: MIT OR Apache-2.0

//! Authenticated, replicated, typed event log for one group.
//!
//! Producers build a typed event, stamp the own device key, sign, seal and
//! append. The ingest task opens every delivered entry (local writes and
//! replication progress alike), folds it into the [`MetadataIndex`] and
//! fans it out to subscribers. Entries failing verification are logged and
//! ignored; the log itself stays untouched since it is the source of truth.
use std::sync::{Arc, Mutex};

use sett_core::{encode_cbor, PrivateKey, PublicKey};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::account::Account;
use crate::crypto::{seal_to, Rng};
use crate::envelope::{open_group_envelope, seal_group_envelope, EnvelopeError};
use crate::error::StoreError;
use crate::event::{
    ContactState, EventContext, GroupMetadataEvent, MetadataEvent, ShareableContact,
    RENDEZVOUS_SEED_LEN,
};
use crate::group::{Group, GroupKind, OwnMemberDevice};
use crate::index::MetadataIndex;
use crate::keystore::KeyStore;
use crate::log::{LogEntry, ReplicatedLog};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const LIST_CHANNEL_CAPACITY: usize = 64;

/// Which key signs a produced event.
enum EventSigner<'a> {
    /// The own device key; the default for every event kind.
    Device,

    /// The group's private key, proving root-key knowledge. Only used for
    /// initial-member claims.
    Group(&'a PrivateKey),
}

/// The metadata store of one group.
pub struct MetadataStore {
    group: Group,
    account: Arc<Account>,
    own_device: OwnMemberDevice,
    keys: Arc<KeyStore>,
    rng: Arc<Rng>,
    log: Arc<dyn ReplicatedLog>,
    index: Arc<MetadataIndex>,
    events_tx: broadcast::Sender<GroupMetadataEvent>,
    cancel: CancellationToken,
    ingest: Mutex<Option<JoinHandle<()>>>,
}

impl MetadataStore {
    /// Opens the metadata store: rebuilds the index from the log's current
    /// entries, then starts ingesting new deliveries.
    pub async fn open(
        group: Group,
        account: Arc<Account>,
        keys: Arc<KeyStore>,
        rng: Arc<Rng>,
        log: Arc<dyn ReplicatedLog>,
    ) -> Result<Self, StoreError> {
        let own_device = account.member_device_for_group(&group);
        let index = Arc::new(MetadataIndex::new(
            group.clone(),
            own_device.member_pk(),
            own_device.exchange_key().clone(),
            keys.clone(),
        ));
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        // Subscribe before replaying the snapshot so no delivery is missed;
        // the index deduplicates the overlap by entry hash.
        let mut log_rx = log.subscribe();
        for entry in log.entries().await {
            match decode_entry(&group, &entry) {
                Ok(event) => index.handle_event(&event),
                Err(err) => debug!(entry = %entry.hash, "skipping undecodable entry: {err}"),
            }
        }

        let ingest = {
            let group = group.clone();
            let index = index.clone();
            let events_tx = events_tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        received = log_rx.recv() => match received {
                            Ok(log_event) => {
                                let entry = log_event.entry();
                                match decode_entry(&group, entry) {
                                    Ok(event) => {
                                        index.handle_event(&event);
                                        let _ = events_tx.send(event);
                                    }
                                    Err(err) => {
                                        debug!(entry = %entry.hash, "ignoring invalid metadata entry: {err}")
                                    }
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(skipped, "metadata ingest lagging behind log deliveries");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
                trace!("metadata ingest loop finished");
            })
        };

        Ok(Self {
            group,
            account,
            own_device,
            keys,
            rng,
            log,
            index,
            events_tx,
            cancel,
            ingest: Mutex::new(Some(ingest)),
        })
    }

    pub fn group(&self) -> &Group {
        &self.group
    }

    pub fn own_member_device(&self) -> &OwnMemberDevice {
        &self.own_device
    }

    /// Subscribes to decoded metadata events. The channel is bounded; slow
    /// subscribers observe a lag error instead of blocking ingest.
    pub fn subscribe(&self) -> broadcast::Receiver<GroupMetadataEvent> {
        self.events_tx.subscribe()
    }

    /// Replays the whole log as decoded events. Entries failing to decode
    /// are skipped.
    pub async fn list_events(&self) -> mpsc::Receiver<GroupMetadataEvent> {
        let (tx, rx) = mpsc::channel(LIST_CHANNEL_CAPACITY);
        let entries = self.log.entries().await;
        let group = self.group.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            for entry in entries {
                let event = match decode_entry(&group, &entry) {
                    Ok(event) => event,
                    Err(err) => {
                        debug!(entry = %entry.hash, "skipping undecodable entry: {err}");
                        continue;
                    }
                };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = tx.send(event) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        rx
    }

    /// Stops the ingest task. Appends already handed to the log are not
    /// affected.
    pub async fn close(&self) {
        self.cancel.cancel();
        let handle = self.ingest.lock().map(|mut h| h.take()).unwrap_or(None);
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    // Producers.

    /// Admits the own device into the group. Idempotent: returns a null-op
    /// when the device is already present.
    pub async fn add_device_to_group(&self) -> Result<Option<LogEntry>, StoreError> {
        let device_pk = self.own_device.device_pk();
        if self.index.get_member_by_device(&device_pk).is_some() {
            return Ok(None);
        }

        let member_sig = self.own_device.member_key().sign(device_pk.as_bytes());
        let event = MetadataEvent::GroupMemberDeviceAdded {
            member_pk: self.own_device.member_pk(),
            device_pk,
            member_sig,
            member_xpk: self.own_device.exchange_pk(),
        };
        self.append_event(event, EventSigner::Device).await.map(Some)
    }

    /// Delivers the own device's current ratchet state to `dest_member`,
    /// sealed so only that member can read it. A second call for the same
    /// destination is a null-op.
    pub async fn send_secret(&self, dest_member: PublicKey) -> Result<Option<LogEntry>, StoreError> {
        let device_pk = self.own_device.device_pk();
        if self.index.are_secrets_already_sent(&device_pk, &dest_member) {
            return Ok(None);
        }
        if self.index.get_devices_for_member(&dest_member).is_empty() {
            return Err(StoreError::UnknownMember);
        }
        let Some(dest_exchange) = self.index.get_member_exchange_key(&dest_member) else {
            return Err(StoreError::UnknownMember);
        };

        let secret =
            self.keys
                .own_device_secret(&self.rng, self.group.public_key(), device_pk)?;
        let secret_bytes = encode_cbor(&secret)?;
        let payload = seal_to(&self.rng, &dest_exchange, &secret_bytes)?;

        let event = MetadataEvent::GroupDeviceSecretAdded {
            device_pk,
            dest_member_pk: dest_member,
            payload,
        };
        self.append_event(event, EventSigner::Device).await.map(Some)
    }

    /// Announces the own member as initial admin of a multi-member group.
    /// The caller proves root-key knowledge by providing the group's
    /// private key, which signs the event.
    pub async fn claim_group_ownership(
        &self,
        group_key: &PrivateKey,
    ) -> Result<LogEntry, StoreError> {
        self.group.require_kind(&[GroupKind::MultiMember])?;
        if group_key.public_key() != self.group.public_key() {
            return Err(StoreError::InvalidInput);
        }

        let event = MetadataEvent::MultiMemberInitialMember {
            member_pk: self.own_device.member_pk(),
        };
        self.append_event(event, EventSigner::Group(group_key)).await
    }

    /// Publishes the alias resolver and proof. Their construction is not
    /// specified yet; both are published empty.
    pub async fn send_alias_proof(&self) -> Result<LogEntry, StoreError> {
        self.group.require_kind(&[GroupKind::MultiMember])?;
        let event = MetadataEvent::MultiMemberGroupAliasResolverAdded {
            alias_resolver: Vec::new(),
            alias_proof: Vec::new(),
        };
        self.append_event(event, EventSigner::Device).await
    }

    /// Records that the account joined `group`.
    pub async fn group_join(&self, group: &Group) -> Result<LogEntry, StoreError> {
        self.group.require_kind(&[GroupKind::Account])?;
        if self.index.is_group_joined(&group.public_key()) {
            return Err(StoreError::InvalidInput);
        }
        let event = MetadataEvent::AccountGroupJoined {
            group: group.clone(),
        };
        self.append_event(event, EventSigner::Device).await
    }

    /// Records that the account left the group behind `group_pk`.
    pub async fn group_leave(&self, group_pk: PublicKey) -> Result<LogEntry, StoreError> {
        self.group.require_kind(&[GroupKind::Account])?;
        if !self.index.is_group_joined(&group_pk) {
            return Err(StoreError::InvalidInput);
        }
        let event = MetadataEvent::AccountGroupLeft { group_pk };
        self.append_event(event, EventSigner::Device).await
    }

    pub async fn contact_request_enable(&self) -> Result<LogEntry, StoreError> {
        self.group.require_kind(&[GroupKind::Account])?;
        self.append_event(
            MetadataEvent::AccountContactRequestEnabled,
            EventSigner::Device,
        )
        .await
    }

    pub async fn contact_request_disable(&self) -> Result<LogEntry, StoreError> {
        self.group.require_kind(&[GroupKind::Account])?;
        self.append_event(
            MetadataEvent::AccountContactRequestDisabled,
            EventSigner::Device,
        )
        .await
    }

    /// Rotates the rendezvous seed under which the account can be reached.
    pub async fn contact_request_reference_reset(&self) -> Result<LogEntry, StoreError> {
        self.group.require_kind(&[GroupKind::Account])?;
        let seed = self.rng.random_vec(RENDEZVOUS_SEED_LEN)?;
        let event = MetadataEvent::AccountContactRequestReferenceReset {
            rendezvous_seed: seed,
        };
        self.append_event(event, EventSigner::Device).await
    }

    /// Queues an outgoing contact request. When the peer already reached
    /// out (or the contact was removed or discarded before), the request
    /// short-circuits to the sent state.
    pub async fn contact_request_outgoing_enqueue(
        &self,
        contact: &ShareableContact,
    ) -> Result<LogEntry, StoreError> {
        self.group.require_kind(&[GroupKind::Account])?;
        contact.check_format()?;
        if contact.pk == self.account.account_pk() {
            return Err(StoreError::InvalidInput);
        }

        if self.contact_in_state(
            &contact.pk,
            &[
                ContactState::Removed,
                ContactState::Discarded,
                ContactState::Received,
            ],
        ) {
            return self.contact_request_outgoing_sent(contact.pk).await;
        }

        let event = MetadataEvent::AccountContactRequestEnqueued {
            contact_pk: contact.pk,
            rendezvous_seed: contact.rendezvous_seed.clone(),
            metadata: contact.metadata.clone(),
        };
        self.append_event(event, EventSigner::Device).await
    }

    /// Marks an outgoing contact request as sent.
    pub async fn contact_request_outgoing_sent(
        &self,
        contact_pk: PublicKey,
    ) -> Result<LogEntry, StoreError> {
        self.group.require_kind(&[GroupKind::Account])?;
        if !self.contact_in_state(
            &contact_pk,
            &[
                ContactState::ToRequest,
                ContactState::Removed,
                ContactState::Received,
                ContactState::Discarded,
            ],
        ) {
            return Err(StoreError::InvalidTransition);
        }
        let event = MetadataEvent::AccountContactRequestSent { contact_pk };
        self.append_event(event, EventSigner::Device).await
    }

    /// Records an incoming contact request. A request from a peer we were
    /// about to contact ourselves short-circuits to the sent state.
    pub async fn contact_request_incoming_received(
        &self,
        contact: &ShareableContact,
    ) -> Result<LogEntry, StoreError> {
        self.group.require_kind(&[GroupKind::Account])?;
        contact.check_format()?;
        if contact.pk == self.account.account_pk() {
            return Err(StoreError::InvalidInput);
        }

        if self.contact_in_state(&contact.pk, &[ContactState::ToRequest]) {
            return self.contact_request_outgoing_sent(contact.pk).await;
        }
        if self.contact_in_state(
            &contact.pk,
            &[
                ContactState::Received,
                ContactState::Added,
                ContactState::Blocked,
            ],
        ) {
            return Err(StoreError::InvalidTransition);
        }

        let event = MetadataEvent::AccountContactRequestReceived {
            contact_pk: contact.pk,
            rendezvous_seed: contact.rendezvous_seed.clone(),
            metadata: contact.metadata.clone(),
        };
        self.append_event(event, EventSigner::Device).await
    }

    /// Discards a received contact request.
    pub async fn contact_request_incoming_discard(
        &self,
        contact_pk: PublicKey,
    ) -> Result<LogEntry, StoreError> {
        self.group.require_kind(&[GroupKind::Account])?;
        if !self.contact_in_state(&contact_pk, &[ContactState::Received]) {
            return Err(StoreError::InvalidTransition);
        }
        let event = MetadataEvent::AccountContactRequestDiscarded { contact_pk };
        self.append_event(event, EventSigner::Device).await
    }

    /// Accepts a received contact request.
    pub async fn contact_request_incoming_accept(
        &self,
        contact_pk: PublicKey,
    ) -> Result<LogEntry, StoreError> {
        self.group.require_kind(&[GroupKind::Account])?;
        if !self.contact_in_state(&contact_pk, &[ContactState::Received]) {
            return Err(StoreError::InvalidTransition);
        }
        let event = MetadataEvent::AccountContactRequestAccepted { contact_pk };
        self.append_event(event, EventSigner::Device).await
    }

    /// Blocks a contact, whatever its current state.
    pub async fn contact_block(&self, contact_pk: PublicKey) -> Result<LogEntry, StoreError> {
        self.group.require_kind(&[GroupKind::Account])?;
        if contact_pk == self.account.account_pk() {
            return Err(StoreError::InvalidInput);
        }
        if self.contact_in_state(&contact_pk, &[ContactState::Blocked]) {
            return Err(StoreError::InvalidInput);
        }
        let event = MetadataEvent::AccountContactBlocked { contact_pk };
        self.append_event(event, EventSigner::Device).await
    }

    /// Unblocks a blocked contact; it ends up removed, not restored.
    pub async fn contact_unblock(&self, contact_pk: PublicKey) -> Result<LogEntry, StoreError> {
        self.group.require_kind(&[GroupKind::Account])?;
        if !self.contact_in_state(&contact_pk, &[ContactState::Blocked]) {
            return Err(StoreError::InvalidTransition);
        }
        let event = MetadataEvent::AccountContactUnblocked { contact_pk };
        self.append_event(event, EventSigner::Device).await
    }

    /// Publishes the account proof key inside a contact group.
    pub async fn contact_send_alias_key(&self) -> Result<LogEntry, StoreError> {
        self.group.require_kind(&[GroupKind::Contact])?;
        let event = MetadataEvent::ContactAliasKeyAdded {
            alias_pk: self.account.proof_key().public_key(),
        };
        self.append_event(event, EventSigner::Device).await
    }

    // Queries.

    pub fn get_member_by_device(&self, device_pk: &PublicKey) -> Option<PublicKey> {
        self.index.get_member_by_device(device_pk)
    }

    pub fn get_devices_for_member(&self, member_pk: &PublicKey) -> Vec<PublicKey> {
        self.index.get_devices_for_member(member_pk)
    }

    pub fn list_members(&self) -> Vec<PublicKey> {
        self.index.list_members()
    }

    pub fn list_devices(&self) -> Vec<PublicKey> {
        self.index.list_devices()
    }

    /// Admins of a multi-member group. In account and contact groups every
    /// member is an admin.
    pub fn list_admins(&self) -> Vec<PublicKey> {
        match self.group.kind() {
            GroupKind::MultiMember => self.index.list_admins(),
            GroupKind::Account | GroupKind::Contact => self.index.list_members(),
        }
    }

    /// Whether the own device already delivered its secret to `dest_member`.
    pub fn secrets_already_sent(&self, dest_member: &PublicKey) -> bool {
        self.index
            .are_secrets_already_sent(&self.own_device.device_pk(), dest_member)
    }

    /// Whether `sender_device` delivered its secret to `dest_member`.
    pub fn are_secrets_already_sent(
        &self,
        sender_device: &PublicKey,
        dest_member: &PublicKey,
    ) -> bool {
        self.index.are_secrets_already_sent(sender_device, dest_member)
    }

    pub fn get_contact(&self, contact_pk: &PublicKey) -> Option<(ShareableContact, ContactState)> {
        self.index.get_contact(contact_pk)
    }

    pub fn list_contacts_by_status(&self, status: ContactState) -> Vec<ShareableContact> {
        if self.group.kind() != GroupKind::Account {
            return Vec::new();
        }
        self.index.list_contacts_by_status(status)
    }

    pub fn contact_requests_enabled(&self) -> bool {
        self.index.contact_requests_enabled()
    }

    pub fn contact_requests_seed(&self) -> Vec<u8> {
        self.index.contact_requests_seed()
    }

    /// The flag and shareable self-reference under which this account can
    /// currently be reached for contact requests.
    pub fn incoming_contact_request_reference(&self) -> (bool, Option<ShareableContact>) {
        if self.group.kind() != GroupKind::Account {
            return (false, None);
        }
        let enabled = self.index.contact_requests_enabled();
        let seed = self.index.contact_requests_seed();
        if seed.is_empty() {
            return (enabled, None);
        }
        let contact = ShareableContact::new(self.account.account_pk(), seed);
        (enabled, Some(contact))
    }

    pub fn list_multi_member_groups(&self) -> Vec<Group> {
        if self.group.kind() != GroupKind::Account {
            return Vec::new();
        }
        self.index.list_joined_groups()
    }

    fn contact_in_state(&self, contact_pk: &PublicKey, states: &[ContactState]) -> bool {
        match self.index.contact_state(contact_pk) {
            Some(state) => states.contains(&state),
            None => false,
        }
    }

    async fn append_event(
        &self,
        event: MetadataEvent,
        signer: EventSigner<'_>,
    ) -> Result<LogEntry, StoreError> {
        let payload = encode_cbor(&event)?;
        let sig = match signer {
            EventSigner::Device => self.own_device.device_key().sign(&payload),
            EventSigner::Group(group_key) => group_key.sign(&payload),
        };

        let bytes = seal_group_envelope(&self.group, &event, sig, self.own_device.device_pk())?;
        let entry = self
            .log
            .append(bytes)
            .await
            .map_err(StoreError::LogAppendFailed)?;

        // Fold immediately so the next producer call observes this event;
        // the ingest task's later delivery deduplicates by entry hash.
        match decode_entry(&self.group, &entry) {
            Ok(decoded) => self.index.handle_event(&decoded),
            Err(err) => warn!(entry = %entry.hash, "own entry failed to decode: {err}"),
        }

        Ok(entry)
    }
}

/// Opens and verifies one log entry into a decoded metadata event.
fn decode_entry(group: &Group, entry: &LogEntry) -> Result<GroupMetadataEvent, EnvelopeError> {
    let (metadata, event) = open_group_envelope(group, &entry.value)?;
    Ok(GroupMetadataEvent {
        context: EventContext {
            entry_hash: entry.hash,
            parent_hashes: entry.parents.clone(),
            group_pk: group.public_key(),
        },
        metadata,
        event,
    })
}

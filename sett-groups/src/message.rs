// SPDX-License-Identifier: MIT OR Apache-2.0

//! Replicated log of end-to-end encrypted message envelopes for one group.
//!
//! Ingest opens every delivered entry best-effort. An entry whose sender
//! secret has not arrived yet simply fails to open and stays in the log;
//! once the secret lands through the metadata store, a later
//! [`MessageStore::list_messages`] scan resolves it. There is no
//! cross-store ordering to rely on.
use std::sync::{Arc, Mutex};

use sett_core::PublicKey;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::account::Account;
use crate::crypto::Rng;
use crate::envelope::{open_envelope, post_decrypt_actions, seal_envelope};
use crate::error::StoreError;
use crate::event::{EventContext, GroupMessageEvent};
use crate::group::{Group, OwnMemberDevice};
use crate::keystore::KeyStore;
use crate::log::{LogEntry, ReplicatedLog};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const LIST_CHANNEL_CAPACITY: usize = 64;

/// The message store of one group.
pub struct MessageStore {
    group: Group,
    own_device: OwnMemberDevice,
    keys: Arc<KeyStore>,
    rng: Arc<Rng>,
    log: Arc<dyn ReplicatedLog>,
    events_tx: broadcast::Sender<GroupMessageEvent>,
    cancel: CancellationToken,
    ingest: Mutex<Option<JoinHandle<()>>>,
}

impl MessageStore {
    /// Opens the message store and starts ingesting log deliveries.
    pub async fn open(
        group: Group,
        account: Arc<Account>,
        keys: Arc<KeyStore>,
        rng: Arc<Rng>,
        log: Arc<dyn ReplicatedLog>,
    ) -> Result<Self, StoreError> {
        let own_device = account.member_device_for_group(&group);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        let ingest = {
            let group = group.clone();
            let keys = keys.clone();
            let own_device_pk = own_device.device_pk();
            let events_tx = events_tx.clone();
            let cancel = cancel.clone();
            let mut log_rx = log.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        received = log_rx.recv() => match received {
                            Ok(log_event) => {
                                let entry = log_event.entry();
                                match open_message(&keys, &group, Some(own_device_pk), entry) {
                                    Ok(event) => {
                                        let _ = events_tx.send(event);
                                    }
                                    Err(err) => {
                                        // Commonly the sender's secret has
                                        // not arrived yet; the entry stays
                                        // in the log and resolves later.
                                        trace!(entry = %entry.hash, "message entry not opened: {err}");
                                    }
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(skipped, "message ingest lagging behind log deliveries");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
                trace!("message ingest loop finished");
            })
        };

        Ok(Self {
            group,
            own_device,
            keys,
            rng,
            log,
            events_tx,
            cancel,
            ingest: Mutex::new(Some(ingest)),
        })
    }

    pub fn group(&self) -> &Group {
        &self.group
    }

    /// Seals `payload` with the own device's ratchet and appends it.
    pub async fn add_message(&self, payload: &[u8]) -> Result<LogEntry, StoreError> {
        let bytes = seal_envelope(
            &self.keys,
            &self.rng,
            &self.group,
            self.own_device.device_key(),
            payload,
        )?;
        self.log
            .append(bytes)
            .await
            .map_err(StoreError::LogAppendFailed)
    }

    /// Streams the currently decryptable messages of the log. Entries that
    /// cannot be opened (yet) are skipped; calling this again after more
    /// device secrets arrived resolves them.
    pub async fn list_messages(&self) -> mpsc::Receiver<GroupMessageEvent> {
        let (tx, rx) = mpsc::channel(LIST_CHANNEL_CAPACITY);
        let entries = self.log.entries().await;
        let group = self.group.clone();
        let keys = self.keys.clone();
        let own_device_pk = self.own_device.device_pk();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            for entry in entries {
                let event = match open_message(&keys, &group, Some(own_device_pk), &entry) {
                    Ok(event) => event,
                    Err(err) => {
                        trace!(entry = %entry.hash, "skipping unopenable message: {err}");
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

    /// Subscribes to newly decrypted messages.
    pub fn subscribe(&self) -> broadcast::Receiver<GroupMessageEvent> {
        self.events_tx.subscribe()
    }

    /// Stops the ingest task.
    pub async fn close(&self) {
        self.cancel.cancel();
        let handle = self.ingest.lock().map(|mut h| h.take()).unwrap_or(None);
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// Opens one log entry into a decrypted message event.
///
/// A failure of the post-decrypt ratchet advancement does not discard the
/// plaintext: the message is valid, key advancement is recoverable. The
/// error is attached to the event as a warning instead.
fn open_message(
    keys: &KeyStore,
    group: &Group,
    own_device_pk: Option<PublicKey>,
    entry: &LogEntry,
) -> Result<GroupMessageEvent, StoreError> {
    let (headers, message, decrypt_info) = open_envelope(keys, group, &entry.value, entry.hash)?;

    let warning = post_decrypt_actions(keys, &decrypt_info, group, own_device_pk, &headers)
        .err()
        .map(|err| err.to_string());

    Ok(GroupMessageEvent {
        context: EventContext {
            entry_hash: entry.hash,
            parent_hashes: entry.parents.clone(),
            group_pk: group.public_key(),
        },
        headers,
        message,
        warning,
    })
}

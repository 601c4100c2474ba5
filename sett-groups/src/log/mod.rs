// SPDX-License-Identifier: MIT OR Apache-2.0

//! The content-addressed append-only log consumed by the group stores.
//!
//! The stores are agnostic to how entries travel between peers; they only
//! rely on the narrow interface below. The log guarantees causal delivery
//! (an entry's parents are delivered before the entry) but no total order
//! across concurrent branches, and entries are immutable and deduplicated
//! by their content hash.
mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sett_core::{encode_cbor, Hash};
use thiserror::Error;
use tokio::sync::broadcast;

pub use memory::MemoryLog;

/// One immutable log entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogEntry {
    /// Content hash over parents and value.
    pub hash: Hash,

    /// Hashes of the entries this one causally follows.
    pub parents: Vec<Hash>,

    /// Opaque envelope bytes.
    #[serde(with = "serde_bytes")]
    pub value: Vec<u8>,
}

impl PartialEq for LogEntry {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for LogEntry {}

/// Computes the content address of an entry.
pub fn entry_hash(parents: &[Hash], value: &[u8]) -> Hash {
    let bytes = encode_cbor(&(parents, serde_bytes::Bytes::new(value)))
        .expect("hashes and bytes are always serializable");
    Hash::new(bytes)
}

/// Notifications emitted by a log.
#[derive(Clone, Debug)]
pub enum LogEvent {
    /// A local append.
    Write(LogEntry),

    /// An entry delivered through replication.
    ReplicateProgress(LogEntry),
}

impl LogEvent {
    pub fn entry(&self) -> &LogEntry {
        match self {
            LogEvent::Write(entry) | LogEvent::ReplicateProgress(entry) => entry,
        }
    }
}

/// Interface of the underlying replicated log.
#[async_trait]
pub trait ReplicatedLog: Send + Sync + 'static {
    /// Appends a locally-produced value, linking it to the current heads.
    async fn append(&self, value: Vec<u8>) -> Result<LogEntry, LogError>;

    /// Snapshot of all delivered entries, in an order consistent with
    /// causality.
    async fn entries(&self) -> Vec<LogEntry>;

    /// Subscribes to future deliveries (local writes and replication
    /// progress).
    fn subscribe(&self) -> broadcast::Receiver<LogEvent>;

    /// Delivers an entry from a remote peer. Returns `false` when the entry
    /// was already known. Entries whose parents are still missing are held
    /// back and delivered once the parents arrive.
    async fn ingest(&self, entry: LogEntry) -> Result<bool, LogError>;
}

#[derive(Debug, Error)]
pub enum LogError {
    /// The entry's hash does not match its content.
    #[error("entry hash does not match its content")]
    InvalidEntry,

    #[error("log lock is poisoned")]
    LockPoisoned,

    #[error("log failure: {0}")]
    Internal(String),
}

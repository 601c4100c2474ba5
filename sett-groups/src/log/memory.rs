// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory implementation of the replicated log, used by tests and
//! single-process setups.
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{entry_hash, LogEntry, LogError, LogEvent, ReplicatedLog};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Default)]
struct MemoryLogState {
    known: HashSet<sett_core::Hash>,
    /// Delivered entries in arrival order; causal because delivery is held
    /// back until all parents are present.
    delivered: Vec<LogEntry>,
    heads: Vec<sett_core::Hash>,
    /// Replicated entries waiting for missing parents.
    pending: HashMap<sett_core::Hash, LogEntry>,
}

#[derive(Debug)]
pub struct MemoryLog {
    state: Mutex<MemoryLogState>,
    events: broadcast::Sender<LogEvent>,
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLog {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(MemoryLogState::default()),
            events,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryLogState>, LogError> {
        self.state.lock().map_err(|_| LogError::LockPoisoned)
    }
}

impl MemoryLogState {
    fn deliver(&mut self, entry: LogEntry) {
        self.known.insert(entry.hash);
        self.heads.retain(|head| !entry.parents.contains(head));
        self.heads.push(entry.hash);
        self.delivered.push(entry);
    }

    /// Moves pending entries whose parents have all arrived into the
    /// delivered list, repeatedly, until no further progress is made.
    fn drain_pending(&mut self) -> Vec<LogEntry> {
        let mut released = Vec::new();
        loop {
            let ready: Vec<sett_core::Hash> = self
                .pending
                .iter()
                .filter(|(_, entry)| {
                    entry
                        .parents
                        .iter()
                        .all(|parent| self.known.contains(parent))
                })
                .map(|(hash, _)| *hash)
                .collect();
            if ready.is_empty() {
                break;
            }
            for hash in ready {
                let entry = self.pending.remove(&hash).expect("hash taken from map");
                self.deliver(entry.clone());
                released.push(entry);
            }
        }
        released
    }
}

#[async_trait]
impl ReplicatedLog for MemoryLog {
    async fn append(&self, value: Vec<u8>) -> Result<LogEntry, LogError> {
        let entry = {
            let mut state = self.lock()?;
            let parents = state.heads.clone();
            let entry = LogEntry {
                hash: entry_hash(&parents, &value),
                parents,
                value,
            };
            state.deliver(entry.clone());
            entry
        };
        // No subscribers is fine.
        let _ = self.events.send(LogEvent::Write(entry.clone()));
        Ok(entry)
    }

    async fn entries(&self) -> Vec<LogEntry> {
        self.lock()
            .map(|state| state.delivered.clone())
            .unwrap_or_default()
    }

    fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.events.subscribe()
    }

    async fn ingest(&self, entry: LogEntry) -> Result<bool, LogError> {
        if entry.hash != entry_hash(&entry.parents, &entry.value) {
            return Err(LogError::InvalidEntry);
        }

        let released = {
            let mut state = self.lock()?;
            if state.known.contains(&entry.hash) || state.pending.contains_key(&entry.hash) {
                return Ok(false);
            }

            let parents_known = entry
                .parents
                .iter()
                .all(|parent| state.known.contains(parent));
            if !parents_known {
                state.pending.insert(entry.hash, entry);
                return Ok(true);
            }

            state.deliver(entry.clone());
            let mut released = vec![entry];
            released.extend(state.drain_pending());
            released
        };

        for entry in released {
            let _ = self.events.send(LogEvent::ReplicateProgress(entry));
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::super::{LogEntry, ReplicatedLog};
    use super::MemoryLog;

    #[tokio::test]
    async fn append_links_to_heads() {
        let log = MemoryLog::new();

        let first = log.append(b"one".to_vec()).await.unwrap();
        assert!(first.parents.is_empty());

        let second = log.append(b"two".to_vec()).await.unwrap();
        assert_eq!(second.parents, vec![first.hash]);
    }

    #[tokio::test]
    async fn ingest_deduplicates() {
        let local = MemoryLog::new();
        let remote = MemoryLog::new();

        let entry = local.append(b"value".to_vec()).await.unwrap();
        assert!(remote.ingest(entry.clone()).await.unwrap());
        assert!(!remote.ingest(entry).await.unwrap());
        assert_eq!(remote.entries().await.len(), 1);
    }

    #[tokio::test]
    async fn ingest_rejects_tampered_entries() {
        let local = MemoryLog::new();
        let remote = MemoryLog::new();

        let mut entry = local.append(b"value".to_vec()).await.unwrap();
        entry.value = b"forged".to_vec();
        assert!(remote.ingest(entry).await.is_err());
    }

    #[tokio::test]
    async fn delivery_is_causal() {
        let local = MemoryLog::new();
        let remote = MemoryLog::new();

        let first = local.append(b"one".to_vec()).await.unwrap();
        let second = local.append(b"two".to_vec()).await.unwrap();

        // Deliver the child before its parent: it must be held back.
        remote.ingest(second.clone()).await.unwrap();
        assert!(remote.entries().await.is_empty());

        remote.ingest(first.clone()).await.unwrap();
        let entries: Vec<LogEntry> = remote.entries().await;
        assert_eq!(entries, vec![first, second]);
    }

    #[tokio::test]
    async fn concurrent_branches_merge() {
        let a = MemoryLog::new();
        let b = MemoryLog::new();

        let from_a = a.append(b"from a".to_vec()).await.unwrap();
        let from_b = b.append(b"from b".to_vec()).await.unwrap();

        a.ingest(from_b.clone()).await.unwrap();
        b.ingest(from_a.clone()).await.unwrap();
        assert_eq!(a.entries().await.len(), 2);
        assert_eq!(b.entries().await.len(), 2);

        // The next append on either side merges both branches.
        let merge = a.append(b"merge".to_vec()).await.unwrap();
        assert_eq!(merge.parents.len(), 2);
    }
}

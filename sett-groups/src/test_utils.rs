// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fixtures for exercising groups across simulated peers.
//!
//! A [`TestPeer`] bundles an account, key store and per-group logs the way
//! a real process would hold them. Replication is driven explicitly with
//! [`replicate`]: tests decide when partitions heal, which makes
//! convergence scenarios deterministic.
use std::sync::Arc;
use std::time::Duration;

use crate::account::Account;
use crate::context::GroupContext;
use crate::crypto::Rng;
use crate::error::StoreError;
use crate::group::Group;
use crate::keystore::KeyStore;
use crate::log::{MemoryLog, ReplicatedLog};

/// One simulated peer participating in one group.
pub struct TestPeer {
    pub account: Arc<Account>,
    pub keys: Arc<KeyStore>,
    pub rng: Arc<Rng>,
    pub metadata_log: Arc<MemoryLog>,
    pub message_log: Arc<MemoryLog>,
    pub context: GroupContext,
}

impl TestPeer {
    /// Creates a peer with a deterministically seeded account and opens a
    /// context for `group`.
    pub async fn open(group: &Group, seed: u8) -> Result<Self, StoreError> {
        let rng = Arc::new(Rng::from_seed([seed; 32]));
        let account = Arc::new(Account::generate(&rng)?);
        Self::open_with_account(group, account, rng).await
    }

    pub async fn open_with_account(
        group: &Group,
        account: Arc<Account>,
        rng: Arc<Rng>,
    ) -> Result<Self, StoreError> {
        let keys = Arc::new(KeyStore::new());
        let metadata_log = Arc::new(MemoryLog::new());
        let message_log = Arc::new(MemoryLog::new());
        let context = GroupContext::open(
            group.clone(),
            account.clone(),
            keys.clone(),
            rng.clone(),
            metadata_log.clone(),
            message_log.clone(),
        )
        .await?;
        Ok(Self {
            account,
            keys,
            rng,
            metadata_log,
            message_log,
            context,
        })
    }
}

/// Copies all entries of `from` into `into`. Entries already known are
/// deduplicated by the log itself.
pub async fn sync_log(from: &MemoryLog, into: &MemoryLog) {
    for entry in from.entries().await {
        // Only a tampered entry can fail here, which tests never produce.
        into.ingest(entry).await.expect("ingest replicated entry");
    }
}

/// Bidirectionally replicates both logs of two peers, as if the network
/// partition between them healed.
pub async fn replicate(a: &TestPeer, b: &TestPeer) {
    sync_log(&a.metadata_log, &b.metadata_log).await;
    sync_log(&b.metadata_log, &a.metadata_log).await;
    sync_log(&a.message_log, &b.message_log).await;
    sync_log(&b.message_log, &a.message_log).await;
}

/// Polls `condition` until it holds or the timeout elapses. Ingest runs on
/// spawned tasks, so state changes land asynchronously after replication.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Duration::from_secs(2);
    let started = tokio::time::Instant::now();
    while !condition() {
        if started.elapsed() > deadline {
            panic!("condition not reached within {deadline:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

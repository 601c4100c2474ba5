// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end message flow across peers.
use sett_groups::test_utils::{replicate, sync_log, wait_until, TestPeer};
use sett_groups::{Group, GroupMessageEvent, ReplicatedLog, Rng};

async fn connected_peers(count: u8) -> (Group, Vec<TestPeer>) {
    let rng = Rng::from_seed([17; 32]);
    let (group, _) = Group::new_multi_member(&rng).unwrap();

    let mut peers = Vec::new();
    for seed in 1..=count {
        peers.push(TestPeer::open(&group, seed).await.unwrap());
    }

    for peer in &peers {
        peer.context.add_device_to_group().await.unwrap();
    }
    for a in 0..peers.len() {
        for b in (a + 1)..peers.len() {
            replicate(&peers[a], &peers[b]).await;
        }
    }
    for peer in &peers {
        wait_until(|| peer.context.list_members().len() == count as usize).await;
    }
    (group, peers)
}

async fn exchange_secrets(peers: &[TestPeer]) {
    for sender in peers {
        for dest in peers {
            let dest_member = dest.context.own_member_device().member_pk();
            if dest_member == sender.context.own_member_device().member_pk() {
                continue;
            }
            sender.context.send_secret(dest_member).await.unwrap();
        }
    }
    for a in 0..peers.len() {
        for b in (a + 1)..peers.len() {
            replicate(&peers[a], &peers[b]).await;
        }
    }
}

async fn collect(mut rx: tokio::sync::mpsc::Receiver<GroupMessageEvent>) -> Vec<GroupMessageEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn one_message_reaches_every_peer() {
    let (group, peers) = connected_peers(3).await;
    exchange_secrets(&peers).await;

    let sender_device = peers[0].context.own_member_device().device_pk();
    for peer in &peers[1..] {
        wait_until(|| peer.keys.has_chain(group.public_key(), sender_device)).await;
    }

    peers[0].context.add_message(b"hello").await.unwrap();
    for a in 1..peers.len() {
        sync_log(&peers[0].message_log, &peers[a].message_log).await;
    }

    for peer in &peers {
        let events = collect(peer.context.list_messages().await).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, b"hello");
        assert_eq!(events[0].headers.device_pk, sender_device);
        assert_eq!(events[0].headers.counter, 1);
        assert!(events[0].warning.is_none());
    }
}

#[tokio::test]
async fn messages_resolve_once_the_secret_arrives() {
    let (group, peers) = connected_peers(2).await;
    let (alice, bob) = (&peers[0], &peers[1]);

    // Alice shares her secret with Bob but only the *message* log is
    // replicated at first.
    let bob_member = bob.context.own_member_device().member_pk();
    alice.context.send_secret(bob_member).await.unwrap();
    alice.context.add_message(b"early").await.unwrap();
    sync_log(&alice.message_log, &bob.message_log).await;

    // Without the metadata entry the envelope cannot be opened yet.
    let events = collect(bob.context.list_messages().await).await;
    assert!(events.is_empty());

    // The metadata log catches up; re-scanning now succeeds.
    sync_log(&alice.metadata_log, &bob.metadata_log).await;
    let alice_device = alice.context.own_member_device().device_pk();
    wait_until(|| bob.keys.has_chain(group.public_key(), alice_device)).await;

    let events = collect(bob.context.list_messages().await).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].message, b"early");
}

#[tokio::test]
async fn out_of_order_delivery_within_the_window() {
    let (group, peers) = connected_peers(2).await;
    let (alice, bob) = (&peers[0], &peers[1]);

    let bob_member = bob.context.own_member_device().member_pk();
    alice.context.send_secret(bob_member).await.unwrap();
    sync_log(&alice.metadata_log, &bob.metadata_log).await;
    let alice_device = alice.context.own_member_device().device_pk();
    wait_until(|| bob.keys.has_chain(group.public_key(), alice_device)).await;

    let first = alice.context.add_message(b"one").await.unwrap();
    let second = alice.context.add_message(b"two").await.unwrap();
    let third = alice.context.add_message(b"three").await.unwrap();

    // Deliver newest first; the log holds children back until parents
    // arrive, so feed the parents through in reverse order too.
    bob.message_log.ingest(first.clone()).await.unwrap();
    bob.message_log.ingest(third.clone()).await.unwrap();
    bob.message_log.ingest(second.clone()).await.unwrap();

    let events = collect(bob.context.list_messages().await).await;
    let mut payloads: Vec<Vec<u8>> = events.into_iter().map(|event| event.message).collect();
    payloads.sort();
    assert_eq!(payloads, vec![b"one".to_vec(), b"three".to_vec(), b"two".to_vec()]);
}

#[tokio::test]
async fn own_messages_stay_readable() {
    let (_, peers) = connected_peers(2).await;
    let alice = &peers[0];

    alice.context.add_message(b"note to the group").await.unwrap();

    // Listing twice re-opens the entry through the entry-hash key store.
    for _ in 0..2 {
        let events = collect(alice.context.list_messages().await).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, b"note to the group");
    }
}

#[tokio::test]
async fn subscribers_see_replicated_messages() {
    let (group, peers) = connected_peers(2).await;
    let (alice, bob) = (&peers[0], &peers[1]);

    let bob_member = bob.context.own_member_device().member_pk();
    alice.context.send_secret(bob_member).await.unwrap();
    sync_log(&alice.metadata_log, &bob.metadata_log).await;
    let alice_device = alice.context.own_member_device().device_pk();
    wait_until(|| bob.keys.has_chain(group.public_key(), alice_device)).await;

    let mut live = bob.context.messages().subscribe();
    alice.context.add_message(b"fresh").await.unwrap();
    sync_log(&alice.message_log, &bob.message_log).await;

    let event = tokio::time::timeout(std::time::Duration::from_secs(2), live.recv())
        .await
        .expect("subscriber delivery within deadline")
        .expect("channel open");
    assert_eq!(event.message, b"fresh");
    assert_eq!(event.headers.device_pk, alice_device);
}

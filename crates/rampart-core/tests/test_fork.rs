//! Confirmation tag exchange and fork detection across devices.

use session_sim::{drain, Device, SessionSim};

use rampart_core::{
    AadPayload, ApplicationPayload, CryptoEngine, ForkDetected, ForkReason, GroupId, MemoryVault,
    MessageType, SessionEvent,
};
use std::sync::Arc;

fn forks(events: Vec<SessionEvent>) -> Vec<ForkDetected> {
    events
        .into_iter()
        .filter_map(|e| match e {
            SessionEvent::ForkDetected(fork) => Some(fork),
            _ => None,
        })
        .collect()
}

/// A confirmation tag announcement for `epoch` carrying `tag`, encrypted by
/// `from` at its current epoch.
fn tag_message(from: &Device, group: &GroupId, epoch: u64, tag: Vec<u8>) -> Vec<u8> {
    let aad = AadPayload::new(group.clone(), epoch, MessageType::Application, 0)
        .to_bytes()
        .unwrap();
    let payload = ApplicationPayload::confirmation_tag(epoch, tag)
        .to_bytes()
        .unwrap();
    from.engine.encrypt_message(group, &payload, &aad).unwrap()
}

#[tokio::test]
async fn test_agreeing_members_report_no_fork() {
    let sim = SessionSim::new();
    let alice = sim.device("u_alice", "laptop").await;
    let bob = sim.trusting_device("u_bob", "phone", &["u_alice"]).await;
    let carol = sim.trusting_device("u_carol", "tablet", &["u_alice"]).await;
    let mut events = [alice.events(), bob.events(), carol.events()];

    let group = alice.manager.create_group().await.unwrap();
    alice.manager.add_member(&group, "u_bob").await.unwrap();
    bob.manager.sync_messages().await.unwrap();
    alice.manager.sync_messages().await.unwrap();
    alice.manager.add_member(&group, "u_carol").await.unwrap();
    for device in [&bob, &carol, &alice, &bob, &carol] {
        device.manager.sync_messages().await.unwrap();
    }

    for device in [&alice, &bob, &carol] {
        assert_eq!(device.epoch(&group), 2);
    }
    for rx in events.iter_mut() {
        assert!(forks(drain(rx)).is_empty());
    }
}

/// Two peers announcing different tags for the same epoch is a fork, even
/// before the local tag is known to disagree.
#[tokio::test]
async fn test_differing_remote_tags_signal_fork() {
    let sim = SessionSim::new();
    let alice = sim.device("u_alice", "laptop").await;
    let bob = sim.trusting_device("u_bob", "phone", &["u_alice"]).await;
    let carol = sim.trusting_device("u_carol", "tablet", &["u_alice"]).await;

    let group = alice.manager.create_group().await.unwrap();
    alice.manager.add_member(&group, "u_bob").await.unwrap();
    bob.manager.sync_messages().await.unwrap();
    alice.manager.add_member(&group, "u_carol").await.unwrap();
    bob.manager.sync_messages().await.unwrap();
    carol.manager.sync_messages().await.unwrap();
    assert_eq!(carol.epoch(&group), 2);

    let mut events = carol.events();
    let forged = tag_message(&alice, &group, 2, vec![0xEE; 16]);
    sim.network
        .inject(&carol.credential, &bob.credential, &group, MessageType::Application, forged);
    let report = carol.manager.sync_messages().await.unwrap();
    assert_eq!(report.applied, 1);

    let detected = forks(drain(&mut events));
    assert_eq!(detected.len(), 1);
    assert_eq!(detected[0].group_id, group);
    assert_eq!(detected[0].epoch, 2);
    assert_eq!(detected[0].reason, ForkReason::RemoteTagMismatch);
    assert_eq!(detected[0].remote_tag, Some(vec![0xEE; 16]));
}

#[tokio::test]
async fn test_peer_tag_differing_from_ours_signals_fork() {
    let sim = SessionSim::new();
    let alice = sim.device("u_alice", "laptop").await;
    let bob = sim.trusting_device("u_bob", "phone", &["u_alice"]).await;
    let group = alice.manager.create_group().await.unwrap();
    alice.manager.add_member(&group, "u_bob").await.unwrap();
    bob.manager.sync_messages().await.unwrap();
    alice.manager.sync_messages().await.unwrap();

    bob.manager.self_update(&group).await.unwrap();
    alice.manager.sync_messages().await.unwrap();
    assert_eq!(alice.epoch(&group), 2);
    // lose Alice's genuine announcement and replace it
    sim.network.discard_pending(&bob.credential);
    let forged = tag_message(&alice, &group, 2, vec![0x11; 16]);
    sim.network
        .inject(&bob.credential, &alice.credential, &group, MessageType::Application, forged);

    let mut events = bob.events();
    bob.manager.sync_messages().await.unwrap();
    let detected = forks(drain(&mut events));
    assert_eq!(detected.len(), 1);
    assert_eq!(detected[0].reason, ForkReason::LocalTagMismatch);
    assert_eq!(
        detected[0].local_tag,
        Some(bob.engine.group_confirmation_tag(&group).unwrap())
    );
}

#[tokio::test]
async fn test_tag_broadcast_once_per_epoch() {
    let sim = SessionSim::new();
    let alice = sim.device("u_alice", "laptop").await;
    let _bob = sim.trusting_device("u_bob", "phone", &["u_alice"]).await;
    let group = alice.manager.create_group().await.unwrap();
    alice.manager.add_member(&group, "u_bob").await.unwrap();
    alice.manager.self_update(&group).await.unwrap();
    assert_eq!(alice.epoch(&group), 2);

    let sent = alice.relay.calls().sent(MessageType::Application);
    // the merge already announced epoch 2
    assert!(!alice
        .manager
        .broadcast_confirmation_tag(&group, 2)
        .await
        .unwrap());
    // a past epoch's tag can no longer be computed
    assert!(!alice
        .manager
        .broadcast_confirmation_tag(&group, 1)
        .await
        .unwrap());
    assert_eq!(alice.relay.calls().sent(MessageType::Application), sent);

    // announcements survive a restore
    let restored = sim
        .device_with(
            "u_alice",
            "laptop",
            &[],
            Arc::new(MemoryVault::with_snapshot(&alice.manager.export_snapshot().unwrap()).unwrap()),
        )
        .await;
    assert!(!restored
        .manager
        .broadcast_confirmation_tag(&group, 2)
        .await
        .unwrap());
}

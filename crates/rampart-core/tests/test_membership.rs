//! Local commits: invites, removals, updates, proposals and rollback.

use session_sim::{drain, Faults, SessionSim};

use rampart_core::{CloseReason, CryptoEngine, Error, MessageType, RejectReason, SessionEvent};
use std::sync::atomic::Ordering;

/// One invite is one commit to the existing members plus one welcome, and
/// moves the group from epoch 0 to epoch 1.
#[tokio::test]
async fn test_invite_produces_one_commit_and_one_welcome() {
    let sim = SessionSim::new();
    let alice = sim.device("u_alice", "laptop").await;
    let bob = sim.trusting_device("u_bob", "phone", &["u_alice"]).await;

    let group = alice.manager.create_group().await.unwrap();
    assert_eq!(alice.epoch(&group), 0);

    let outcome = alice.manager.add_member(&group, "u_bob").await.unwrap();
    assert_eq!(outcome.added, vec![bob.credential.clone()]);
    assert!(outcome.failed.is_empty());
    assert_eq!(outcome.epoch, 1);

    let calls = alice.relay.calls();
    assert_eq!(calls.sent(MessageType::Commit), 1);
    assert_eq!(calls.welcomes.len(), 1);
    assert_eq!(calls.welcomes[0].1, "u_bob");
    assert_eq!(alice.epoch(&group), 1);

    let report = bob.manager.sync_messages().await.unwrap();
    assert_eq!(report.applied, 1);
    assert_eq!(bob.epoch(&group), 1);
    assert_eq!(bob.manager.members(&group).unwrap().len(), 2);
}

/// The first device of a new user is left out of the commit; later devices
/// of that user are not.
#[tokio::test]
async fn test_multi_device_add_commits_per_device() {
    let sim = SessionSim::new();
    let alice = sim.device("u_alice", "laptop").await;
    let bob_laptop = sim.trusting_device("u_bob", "laptop", &["u_alice"]).await;
    let bob_phone = sim.trusting_device("u_bob", "phone", &["u_alice"]).await;

    let group = alice.manager.create_group().await.unwrap();
    let outcome = alice.manager.add_member(&group, "u_bob").await.unwrap();
    assert_eq!(outcome.added.len(), 2);
    assert_eq!(outcome.epoch, 2);

    let calls = alice.relay.calls();
    let commits: Vec<_> = calls
        .group_messages
        .iter()
        .filter(|(_, t, _, _)| *t == MessageType::Commit)
        .collect();
    assert_eq!(commits.len(), 2);
    assert_eq!(commits[0].3, vec!["u_bob".to_string()]);
    assert!(commits[1].3.is_empty());
    assert_eq!(calls.welcomes.len(), 2);

    bob_laptop.manager.sync_messages().await.unwrap();
    bob_phone.manager.sync_messages().await.unwrap();
    assert_eq!(bob_laptop.epoch(&group), 2);
    assert_eq!(bob_phone.epoch(&group), 2);
    assert_eq!(bob_phone.manager.members(&group).unwrap().len(), 3);
}

#[tokio::test]
async fn test_add_without_key_packages_fails() {
    let sim = SessionSim::new();
    let alice = sim.device("u_alice", "laptop").await;
    let group = alice.manager.create_group().await.unwrap();

    let err = alice.manager.add_member(&group, "u_nobody").await.unwrap_err();
    assert!(matches!(err, Error::NoDeviceAdded { .. }));
    assert_eq!(alice.epoch(&group), 0);
}

/// Concurrent adds to one group are serialized: the engine never holds two
/// pending commits at once and both adds land.
#[tokio::test]
async fn test_concurrent_adds_never_overlap() {
    let sim = SessionSim::new();
    let alice = sim.device("u_alice", "laptop").await;
    let _bob = sim.device("u_bob", "phone").await;
    let _carol = sim.device("u_carol", "tablet").await;
    let group = alice.manager.create_group().await.unwrap();

    let (a, b) = tokio::join!(
        alice.manager.add_member(&group, "u_bob"),
        alice.manager.add_member(&group, "u_carol"),
    );
    a.unwrap();
    b.unwrap();

    assert_eq!(alice.epoch(&group), 2);
    assert_eq!(sim.stats.overlapping_commits.load(Ordering::SeqCst), 0);
    assert!(!alice.engine.has_pending_commit(&group));
    assert!(alice.manager.group(&group).unwrap().pending_commit.is_none());
}

/// A refused commit upload leaves no pending commit behind and the exported
/// state exactly as it was.
#[tokio::test]
async fn test_failed_upload_rolls_back() {
    let sim = SessionSim::new();
    let alice = sim.device("u_alice", "laptop").await;
    let bob = sim.trusting_device("u_bob", "phone", &["u_alice"]).await;
    let group = alice.manager.create_group().await.unwrap();

    let before = alice.manager.export_snapshot().unwrap().to_bytes().unwrap();
    alice.relay.set_faults(Faults {
        fail_commits: true,
        ..Faults::default()
    });

    let err = alice.manager.add_member(&group, "u_bob").await.unwrap_err();
    match err {
        Error::NoDeviceAdded { detail, .. } => assert!(detail.contains("refused")),
        other => panic!("unexpected error: {other}"),
    }

    assert!(!alice.engine.has_pending_commit(&group));
    assert!(alice.manager.group(&group).unwrap().pending_commit.is_none());
    assert_eq!(alice.epoch(&group), 0);
    let after = alice.manager.export_snapshot().unwrap().to_bytes().unwrap();
    assert_eq!(before, after);
    assert!(alice.relay.calls().welcomes.is_empty());

    // the group is still usable once the relay recovers
    alice.relay.set_faults(Faults::default());
    alice.manager.add_member(&group, "u_bob").await.unwrap();
    bob.manager.sync_messages().await.unwrap();
    assert_eq!(bob.epoch(&group), 1);
}

/// A welcome that cannot be uploaded after its commit went out is reported,
/// not rolled back.
#[tokio::test]
async fn test_undelivered_welcome_is_reported() {
    let sim = SessionSim::new();
    let alice = sim.device("u_alice", "laptop").await;
    let bob = sim.device("u_bob", "phone").await;
    let group = alice.manager.create_group().await.unwrap();

    alice.relay.set_faults(Faults {
        fail_welcomes: true,
        ..Faults::default()
    });
    let outcome = alice.manager.add_member(&group, "u_bob").await.unwrap();
    assert_eq!(outcome.undelivered_welcomes, vec![bob.credential.clone()]);
    assert_eq!(alice.epoch(&group), 1);
}

#[tokio::test]
async fn test_direct_message_refuses_third_party() {
    let sim = SessionSim::new();
    let alice = sim.device("u_alice", "laptop").await;
    let _carol = sim.device("u_carol", "phone").await;

    let dm = alice.manager.create_direct_message("u_bob").await.unwrap();
    let err = alice.manager.add_member(&dm, "u_carol").await.unwrap_err();
    assert_eq!(err.reject_reason(), Some(RejectReason::UnexpectedMember));
    assert_eq!(alice.epoch(&dm), 0);
    assert_eq!(alice.relay.calls().fetches, 0);
}

#[tokio::test]
async fn test_removed_member_closes_group() {
    let sim = SessionSim::new();
    let alice = sim.device("u_alice", "laptop").await;
    let bob = sim.trusting_device("u_bob", "phone", &["u_alice"]).await;
    let group = alice.manager.create_group().await.unwrap();
    alice.manager.add_member(&group, "u_bob").await.unwrap();
    bob.manager.sync_messages().await.unwrap();

    let mut events = bob.events();
    let outcome = alice.manager.remove_member(&group, 1).await.unwrap();
    assert_eq!(outcome.epoch, 2);
    assert_eq!(alice.manager.members(&group).unwrap().len(), 1);

    bob.manager.sync_messages().await.unwrap();
    assert!(bob.manager.group_ids().is_empty());
    assert!(!bob.engine.has_group(&group));
    assert_eq!(bob.manager.group_lock_count(), 0);
    assert!(drain(&mut events).iter().any(|e| matches!(
        e,
        SessionEvent::GroupClosed { reason: CloseReason::Removed, .. }
    )));
}

#[tokio::test]
async fn test_self_update_advances_every_member() {
    let sim = SessionSim::new();
    let alice = sim.device("u_alice", "laptop").await;
    let bob = sim.trusting_device("u_bob", "phone", &["u_alice"]).await;
    let group = alice.manager.create_group().await.unwrap();
    alice.manager.add_member(&group, "u_bob").await.unwrap();
    bob.manager.sync_messages().await.unwrap();

    let outcome = bob.manager.self_update(&group).await.unwrap();
    assert_eq!(outcome.epoch, 2);

    let mut events = alice.events();
    alice.manager.sync_messages().await.unwrap();
    assert_eq!(alice.epoch(&group), 2);
    let events = drain(&mut events);
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::EpochAdvanced { epoch: 2, .. })));
    assert!(!events.iter().any(|e| matches!(e, SessionEvent::ForkDetected(_))));
}

/// A leave proposal takes effect when another member commits it.
#[tokio::test]
async fn test_leave_then_commit_pending_proposals() {
    let sim = SessionSim::new();
    let alice = sim.device("u_alice", "laptop").await;
    let bob = sim.trusting_device("u_bob", "phone", &["u_alice"]).await;
    let group = alice.manager.create_group().await.unwrap();
    alice.manager.add_member(&group, "u_bob").await.unwrap();
    bob.manager.sync_messages().await.unwrap();

    let mut events = bob.events();
    bob.manager.leave_group(&group).await.unwrap();
    assert!(bob.manager.group_ids().is_empty());
    assert_eq!(bob.manager.group_lock_count(), 0);
    assert!(drain(&mut events).iter().any(|e| matches!(
        e,
        SessionEvent::GroupClosed { reason: CloseReason::Left, .. }
    )));
    assert_eq!(bob.relay.calls().sent(MessageType::Proposal), 1);

    alice.manager.sync_messages().await.unwrap();
    let outcome = alice.manager.commit_pending_proposals(&group).await.unwrap();
    assert_eq!(outcome.epoch, 2);
    assert_eq!(
        alice.manager.members(&group).unwrap(),
        vec![alice.credential.clone()]
    );
}

#[tokio::test]
async fn test_external_psk_is_committed_consistently() {
    let sim = SessionSim::new();
    let alice = sim.device("u_alice", "laptop").await;
    let bob = sim.trusting_device("u_bob", "phone", &["u_alice"]).await;
    let group = alice.manager.create_group().await.unwrap();
    alice.manager.add_member(&group, "u_bob").await.unwrap();
    bob.manager.sync_messages().await.unwrap();

    alice.manager.propose_external_psk(&group, b"psk-2026").await.unwrap();
    alice.manager.commit_pending_proposals(&group).await.unwrap();

    let mut events = bob.events();
    bob.manager.sync_messages().await.unwrap();
    assert_eq!(bob.epoch(&group), 2);
    assert_eq!(
        bob.engine.group_confirmation_tag(&group).unwrap(),
        alice.engine.group_confirmation_tag(&group).unwrap()
    );
    assert!(!drain(&mut events)
        .iter()
        .any(|e| matches!(e, SessionEvent::ForkDetected(_))));
}

#[tokio::test]
async fn test_failed_proposal_upload_rolls_back() {
    let sim = SessionSim::new();
    let alice = sim.device("u_alice", "laptop").await;
    let group = alice.manager.create_group().await.unwrap();

    alice.relay.set_faults(Faults {
        fail_proposals: true,
        ..Faults::default()
    });
    let before = alice.engine.export_state().unwrap();
    assert!(alice.manager.propose_external_psk(&group, b"psk").await.is_err());
    assert_eq!(alice.engine.export_state().unwrap(), before);
}

#[tokio::test]
async fn test_join_by_external_commit() {
    let sim = SessionSim::new();
    let alice = sim.device("u_alice", "laptop").await;
    let carol = sim.device("u_carol", "tablet").await;
    let group = alice.manager.create_group().await.unwrap();

    // publishes group info for epoch 1
    alice.manager.self_update(&group).await.unwrap();
    assert_eq!(alice.relay.calls().group_info_puts, 1);

    let joined = carol.manager.join_group_external(&group).await.unwrap();
    assert_eq!(joined, group);
    assert_eq!(carol.epoch(&group), 2);

    alice.manager.sync_messages().await.unwrap();
    assert_eq!(alice.epoch(&group), 2);
    assert_eq!(alice.manager.members(&group).unwrap().len(), 2);
    assert_eq!(
        alice.engine.group_confirmation_tag(&group).unwrap(),
        carol.engine.group_confirmation_tag(&group).unwrap()
    );
}

/// Another device of a participant joins a direct conversation from its
/// group info and keeps following the peer's commits.
#[tokio::test]
async fn test_second_device_joins_direct_message_externally() {
    let sim = SessionSim::new();
    let alice = sim.device("u_alice", "laptop").await;
    let bob = sim.trusting_device("u_bob", "phone", &["u_alice"]).await;
    let dm = alice.manager.create_direct_message("u_bob").await.unwrap();
    alice.manager.add_member(&dm, "u_bob").await.unwrap();
    bob.manager.sync_messages().await.unwrap();

    let tablet = sim.device("u_alice", "tablet").await;
    tablet.manager.join_group_external(&dm).await.unwrap();
    assert_eq!(
        tablet.manager.group(&dm).unwrap().participants,
        vec!["u_alice".to_string(), "u_bob".to_string()]
    );
    bob.manager.sync_messages().await.unwrap();
    assert_eq!(bob.epoch(&dm), 2);

    let mut events = tablet.events();
    bob.manager.self_update(&dm).await.unwrap();
    tablet.manager.sync_messages().await.unwrap();
    assert_eq!(tablet.epoch(&dm), 3);
    assert!(!drain(&mut events)
        .iter()
        .any(|e| matches!(e, SessionEvent::CommitRejected { .. })));
}

#[tokio::test]
async fn test_stranger_cannot_join_direct_message_externally() {
    let sim = SessionSim::new();
    let alice = sim.device("u_alice", "laptop").await;
    let bob = sim.trusting_device("u_bob", "phone", &["u_alice"]).await;
    let carol = sim.device("u_carol", "tablet").await;
    let dm = alice.manager.create_direct_message("u_bob").await.unwrap();
    alice.manager.add_member(&dm, "u_bob").await.unwrap();
    bob.manager.sync_messages().await.unwrap();

    let err = carol.manager.join_group_external(&dm).await.unwrap_err();
    assert_eq!(err.reject_reason(), Some(RejectReason::UnexpectedMember));
    assert!(!carol.engine.has_group(&dm));
    assert!(carol.manager.group_ids().is_empty());
    assert_eq!(carol.relay.calls().sent(MessageType::Commit), 0);
}

#[tokio::test]
async fn test_external_join_rolls_back_on_upload_failure() {
    let sim = SessionSim::new();
    let alice = sim.device("u_alice", "laptop").await;
    let carol = sim.device("u_carol", "tablet").await;
    let group = alice.manager.create_group().await.unwrap();
    alice.manager.self_update(&group).await.unwrap();

    carol.relay.set_faults(Faults {
        fail_commits: true,
        ..Faults::default()
    });
    assert!(carol.manager.join_group_external(&group).await.is_err());
    assert!(!carol.engine.has_group(&group));
    assert!(carol.manager.group_ids().is_empty());
}

#[tokio::test]
async fn test_operations_require_bootstrap() {
    let sim = SessionSim::new();
    let alice = sim.unbooted_device(
        "u_alice",
        "laptop",
        &[],
        std::sync::Arc::new(rampart_core::MemoryVault::new()),
    );
    assert_eq!(
        alice.manager.create_group().await.unwrap_err(),
        Error::NotBootstrapped
    );
}

//! End-to-end call scenarios over in-memory infrastructure: three
//! participants, a shared pre-key directory, programmable transports.

mod support;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use murmur_crypto::{envelope, MemoryDirectory, DEFAULT_DEVICE_ID};

use murmur_call::{
    CallError, InboundEvent, InboundMessage, InboundRouter, KeyReceipt, MessageKind,
};

use support::{deliver_all, init_tracing, participant, Participant};

const CHANNEL: &str = "voice-1";

async fn trio() -> (Participant, Participant, Participant, Arc<MemoryDirectory>) {
    init_tracing();
    let directory = Arc::new(MemoryDirectory::new());
    let alice = participant("alice", directory.clone(), CHANNEL).await;
    let bob = participant("bob", directory.clone(), CHANNEL).await;
    let charlie = participant("charlie", directory.clone(), CHANNEL).await;
    (alice, bob, charlie, directory)
}

#[tokio::test]
async fn sole_participant_generates_the_first_key() {
    init_tracing();
    let directory = Arc::new(MemoryDirectory::new());
    let alice = participant("alice", directory, CHANNEL).await;

    alice.manager.on_connected(&[]).await.unwrap();

    assert_eq!(alice.manager.current_index().await, Some(0));
    assert_eq!(alice.sink.indices(), vec![0]);
    assert!(alice.transport.take_deliveries().is_empty());
}

#[tokio::test]
async fn existing_key_holder_delivers_to_a_joiner() {
    let (alice, bob, _charlie, _) = trio().await;

    alice.manager.on_connected(&[]).await.unwrap();
    bob.manager
        .on_connected(&["alice".to_string()])
        .await
        .unwrap();
    // Bob joined an existing call: no key of his own, nothing sent.
    assert_eq!(bob.manager.current_index().await, None);
    assert!(bob.transport.take_deliveries().is_empty());

    alice.manager.on_participant_joined("bob").await.unwrap();
    let receipts = deliver_all(&alice, &[&bob]).await;
    assert_eq!(receipts, vec![("bob".to_string(), KeyReceipt::Adopted { index: 0 })]);

    // Both media pipelines hold the same key material.
    assert_eq!(alice.sink.last(), bob.sink.last());
    assert!(alice.manager.degraded_peers().await.is_empty());
}

#[tokio::test]
async fn departure_rotates_the_key_away_from_the_leaver() {
    let (alice, bob, charlie, _) = trio().await;

    alice.manager.on_connected(&[]).await.unwrap();
    for (joiner, p) in [("bob", &bob), ("charlie", &charlie)] {
        p.manager
            .on_connected(&["alice".to_string()])
            .await
            .unwrap();
        alice.manager.on_participant_joined(joiner).await.unwrap();
    }
    deliver_all(&alice, &[&bob, &charlie]).await;
    let charlies_last_key = charlie.sink.last().unwrap();

    alice.manager.on_participant_left("charlie").await.unwrap();
    let receipts = deliver_all(&alice, &[&bob]).await;
    assert_eq!(receipts, vec![("bob".to_string(), KeyReceipt::Adopted { index: 1 })]);

    assert_eq!(bob.sink.indices(), vec![0, 1]);
    // The departed participant never saw the rotated key.
    assert_ne!(bob.sink.last(), Some(charlies_last_key));
    assert_eq!(charlie.sink.indices(), vec![0]);
}

#[tokio::test]
async fn holder_departure_promotes_the_next_smallest_id() {
    let (alice, bob, charlie, _) = trio().await;

    alice.manager.on_connected(&[]).await.unwrap();
    for (joiner, p) in [("bob", &bob), ("charlie", &charlie)] {
        p.manager
            .on_connected(&["alice".to_string(), "bob".to_string(), "charlie".to_string()])
            .await
            .unwrap();
        alice.manager.on_participant_joined(joiner).await.unwrap();
    }
    deliver_all(&alice, &[&bob, &charlie]).await;

    // Alice leaves: bob is now the smallest id and must rotate.
    bob.manager.on_participant_left("alice").await.unwrap();
    charlie.manager.on_participant_left("alice").await.unwrap();

    assert_eq!(bob.manager.current_index().await, Some(1));
    // Charlie is not the new holder and sent nothing.
    assert!(charlie.transport.take_deliveries().is_empty());

    let receipts = deliver_all(&bob, &[&charlie]).await;
    assert_eq!(
        receipts,
        vec![("charlie".to_string(), KeyReceipt::Adopted { index: 1 })]
    );
    assert_eq!(bob.sink.last(), charlie.sink.last());
}

#[tokio::test]
async fn joiner_sorting_before_the_holder_still_receives_the_key() {
    init_tracing();
    let directory = Arc::new(MemoryDirectory::new());
    let dave = participant("dave", directory.clone(), CHANNEL).await;
    let aaron = participant("aaron", directory.clone(), CHANNEL).await;

    dave.manager.on_connected(&[]).await.unwrap();
    assert_eq!(dave.manager.current_index().await, Some(0));

    // Aaron sorts before dave, but joining an existing call never mints a
    // key; the participant that has one delivers it.
    aaron
        .manager
        .on_connected(&["dave".to_string()])
        .await
        .unwrap();
    assert_eq!(aaron.manager.current_index().await, None);
    assert!(aaron.transport.take_deliveries().is_empty());

    dave.manager.on_participant_joined("aaron").await.unwrap();
    let receipts = deliver_all(&dave, &[&aaron]).await;
    assert_eq!(
        receipts,
        vec![("aaron".to_string(), KeyReceipt::Adopted { index: 0 })]
    );
    assert_eq!(dave.sink.last(), aaron.sink.last());
}

#[tokio::test]
async fn duplicate_and_stale_deliveries_are_ignored() {
    let (alice, bob, _charlie, _) = trio().await;

    alice.manager.on_connected(&[]).await.unwrap();
    bob.manager
        .on_connected(&["alice".to_string()])
        .await
        .unwrap();
    alice.manager.on_participant_joined("bob").await.unwrap();

    let deliveries = alice.transport.take_deliveries();
    assert_eq!(deliveries.len(), 1);
    let first = &deliveries[0];

    let receipt = bob
        .manager
        .receive_delivery("alice", DEFAULT_DEVICE_ID, &first.envelope)
        .await
        .unwrap();
    assert_eq!(receipt, KeyReceipt::Adopted { index: 0 });

    // Rotate so bob is at index 1, then replay an index-0 delivery.
    alice.manager.on_participant_left("nobody").await.unwrap();
    deliver_all(&alice, &[&bob]).await;
    assert_eq!(bob.manager.current_index().await, Some(1));

    let replayed = alice
        .session
        .encrypt_to(
            "bob",
            DEFAULT_DEVICE_ID,
            &murmur_call::KeyDelivery {
                channel_id: CHANNEL.to_string(),
                key: {
                    use base64::{engine::general_purpose::STANDARD, Engine as _};
                    STANDARD.encode([9u8; 32])
                },
                index: 0,
            }
            .to_bytes()
            .unwrap(),
            &alice.manager.epoch().token(),
        )
        .await
        .unwrap();
    let receipt = bob
        .manager
        .receive_delivery("alice", DEFAULT_DEVICE_ID, &replayed)
        .await
        .unwrap();
    assert_eq!(receipt, KeyReceipt::Ignored { index: 0 });
    assert_eq!(bob.sink.indices(), vec![0, 1]);
}

#[tokio::test]
async fn delivery_for_another_channel_is_ignored() {
    let (alice, bob, _charlie, _) = trio().await;

    alice.manager.on_connected(&[]).await.unwrap();
    let foreign = murmur_call::KeyDelivery {
        channel_id: "voice-other".to_string(),
        key: {
            use base64::{engine::general_purpose::STANDARD, Engine as _};
            STANDARD.encode([7u8; 32])
        },
        index: 5,
    };
    let envelope = alice
        .session
        .encrypt_to(
            "bob",
            DEFAULT_DEVICE_ID,
            &foreign.to_bytes().unwrap(),
            &alice.manager.epoch().token(),
        )
        .await
        .unwrap();

    let receipt = bob
        .manager
        .receive_delivery("alice", DEFAULT_DEVICE_ID, &envelope)
        .await
        .unwrap();
    assert_eq!(receipt, KeyReceipt::Ignored { index: 5 });
    assert!(bob.sink.indices().is_empty());
}

#[tokio::test(start_paused = true)]
async fn transient_send_failures_are_retried_with_one_encryption() {
    let (alice, bob, _charlie, _) = trio().await;

    alice.manager.on_connected(&[]).await.unwrap();
    bob.manager
        .on_connected(&["alice".to_string()])
        .await
        .unwrap();

    alice.transport.fail_next("bob", 2);
    let encrypts_before = alice.engine.encrypts.load(Ordering::SeqCst);
    alice.manager.on_participant_joined("bob").await.unwrap();

    // Two failures, then success on the third attempt.
    assert_eq!(alice.transport.sends.load(Ordering::SeqCst), 3);
    assert_eq!(alice.engine.encrypts.load(Ordering::SeqCst), encrypts_before + 1);
    assert!(alice.manager.degraded_peers().await.is_empty());

    let receipts = deliver_all(&alice, &[&bob]).await;
    assert_eq!(receipts, vec![("bob".to_string(), KeyReceipt::Adopted { index: 0 })]);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_degrade_the_peer_not_the_call() {
    let (alice, bob, charlie, _) = trio().await;

    alice.manager.on_connected(&[]).await.unwrap();
    alice.transport.fail_next("bob", u32::MAX);

    alice.manager.on_participant_joined("bob").await.unwrap();
    assert_eq!(alice.manager.degraded_peers().await, vec!["bob".to_string()]);

    // The call keeps working for others.
    alice.manager.on_participant_joined("charlie").await.unwrap();
    let receipts = deliver_all(&alice, &[&bob, &charlie]).await;
    assert_eq!(
        receipts,
        vec![("charlie".to_string(), KeyReceipt::Adopted { index: 0 })]
    );

    // A later successful delivery clears the degraded mark.
    alice.transport.fail_next("bob", 0);
    alice.manager.on_participant_left("charlie").await.unwrap();
    let receipts = deliver_all(&alice, &[&bob]).await;
    assert_eq!(receipts, vec![("bob".to_string(), KeyReceipt::Adopted { index: 1 })]);
    assert!(alice.manager.degraded_peers().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn lost_handshake_delivery_recovers_on_the_next_distribution() {
    let (alice, bob, _charlie, _) = trio().await;

    alice.manager.on_connected(&[]).await.unwrap();
    alice.transport.fail_next("bob", u32::MAX);
    alice.manager.on_participant_joined("bob").await.unwrap();
    assert_eq!(alice.manager.degraded_peers().await, vec!["bob".to_string()]);

    // The undelivered envelope carried the handshake; the half-open
    // session must be forgotten, not kept ratcheting past a peer that
    // never saw it.
    assert!(!alice
        .session
        .has_session("bob", DEFAULT_DEVICE_ID)
        .await
        .unwrap());

    alice.transport.fail_next("bob", 0);
    alice.manager.on_participant_left("gone").await.unwrap();

    let deliveries = alice.transport.take_deliveries();
    assert_eq!(deliveries.len(), 1);
    assert!(envelope::is_handshake(&deliveries[0].envelope));

    let receipt = bob
        .manager
        .receive_delivery("alice", DEFAULT_DEVICE_ID, &deliveries[0].envelope)
        .await
        .unwrap();
    assert_eq!(receipt, KeyReceipt::Adopted { index: 1 });
    assert!(alice.manager.degraded_peers().await.is_empty());
}

#[tokio::test]
async fn closed_call_rejects_everything() {
    let (alice, bob, _charlie, _) = trio().await;

    alice.manager.on_connected(&[]).await.unwrap();
    bob.manager
        .on_connected(&["alice".to_string()])
        .await
        .unwrap();
    alice.manager.on_participant_joined("bob").await.unwrap();
    let deliveries = alice.transport.take_deliveries();

    bob.manager.close().await;
    assert!(bob.manager.is_closed().await);
    assert_eq!(bob.manager.current_index().await, None);

    let err = bob
        .manager
        .receive_delivery("alice", DEFAULT_DEVICE_ID, &deliveries[0].envelope)
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::Closed));

    let err = bob.manager.on_participant_joined("charlie").await.unwrap_err();
    assert!(matches!(err, CallError::Closed));
}

#[tokio::test]
async fn router_delivers_chat_and_group_keys() {
    let (alice, bob, _charlie, _) = trio().await;

    // Chat: first message carries the handshake, the reply rides the
    // established session; both surface as chat events.
    let hello = alice
        .session
        .encrypt_to(
            "bob",
            DEFAULT_DEVICE_ID,
            b"hello bob",
            &alice.manager.epoch().token(),
        )
        .await
        .unwrap();
    let event = bob
        .router
        .handle(InboundMessage {
            from_user: "alice".to_string(),
            from_device: DEFAULT_DEVICE_ID.to_string(),
            kind: MessageKind::Chat,
            envelope: hello,
        })
        .await
        .unwrap();
    assert_eq!(
        event,
        InboundEvent::Chat {
            from_user: "alice".to_string(),
            from_device: DEFAULT_DEVICE_ID.to_string(),
            plaintext: b"hello bob".to_vec(),
        }
    );

    // Group key through the router reaches the active call.
    alice.manager.on_connected(&[]).await.unwrap();
    alice.manager.on_participant_joined("bob").await.unwrap();
    let delivery = alice.transport.take_deliveries().remove(0);
    let event = bob
        .router
        .handle(InboundMessage {
            from_user: "alice".to_string(),
            from_device: DEFAULT_DEVICE_ID.to_string(),
            kind: MessageKind::GroupKey,
            envelope: delivery.envelope,
        })
        .await
        .unwrap();
    assert_eq!(event, InboundEvent::KeyAdopted { index: 0 });
}

#[tokio::test]
async fn router_reports_undecryptable_messages() {
    let (_alice, bob, _charlie, _) = trio().await;

    // Regular envelope with no session behind it.
    let event = bob
        .router
        .handle(InboundMessage {
            from_user: "mallory".to_string(),
            from_device: DEFAULT_DEVICE_ID.to_string(),
            kind: MessageKind::Chat,
            envelope: envelope::build_regular(b"junk"),
        })
        .await
        .unwrap();
    assert!(matches!(
        event,
        InboundEvent::Undecryptable { ref from_user, .. } if from_user == "mallory"
    ));

    // Key delivery with no active call attached.
    let detached = InboundRouter::new(bob.session.clone());
    let event = detached
        .handle(InboundMessage {
            from_user: "alice".to_string(),
            from_device: DEFAULT_DEVICE_ID.to_string(),
            kind: MessageKind::GroupKey,
            envelope: envelope::build_regular(b"whatever"),
        })
        .await
        .unwrap();
    assert!(matches!(
        event,
        InboundEvent::Undecryptable { ref reason, .. } if reason == "no active call"
    ));
}

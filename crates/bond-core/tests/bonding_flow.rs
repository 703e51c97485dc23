//! Two devices, one shared document store and one simulated radio medium:
//! discovery, bonding and time accumulation from first sighting onward.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use bond_core::{
    BondConfig, BondSession, BondState, Clock, DocumentStore, FallbackSimilarity, Identity,
    LocalDocumentStore, ManualClock, MockAir, MockRadio, NearbyPeer, PairKey, RadioStatus,
    TickOutcome,
};
use chrono::Duration;
use tokio::sync::watch;

fn id(s: &str) -> Identity {
    Identity::parse(s).unwrap()
}

fn device(
    username: &str,
    air: &Arc<MockAir>,
    rssi: i16,
    store: &Arc<LocalDocumentStore>,
    clock: &ManualClock,
) -> BondSession {
    let mut config = BondConfig::default();
    config.identity.username = Some(username.to_string());
    config.identity.email = format!("{username}@example.com");
    BondSession::new(
        &config,
        Arc::new(MockRadio::new(air, rssi)),
        store.clone(),
        Arc::new(FallbackSimilarity),
        Arc::new(clock.clone()),
    )
    .unwrap()
}

async fn wait_for_nearby(rx: &mut watch::Receiver<Vec<NearbyPeer>>, peer: &str) {
    tokio::time::timeout(
        StdDuration::from_secs(5),
        rx.wait_for(|peers| peers.iter().any(|p| p.identity.as_str() == peer)),
    )
    .await
    .expect("peer never surfaced")
    .expect("coordinator dropped");
}

/// Let detached tasks (decode loops, detection pump, ticks) run to completion.
async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

async fn pair(store: &LocalDocumentStore) -> bond_core::PairRecord {
    let key = PairKey::canonical(&id("alice"), &id("bob")).unwrap();
    store.query_pair(&key).await.unwrap().expect("pair exists")
}

#[tokio::test]
async fn test_alice_and_bob_discover_bond_and_accumulate() {
    let air = MockAir::new();
    let store = Arc::new(LocalDocumentStore::in_memory());
    let clock = ManualClock::default();
    let alice = device("alice", &air, -48, &store, &clock);
    let bob = device("bob", &air, -55, &store, &clock);

    for session in [&alice, &bob] {
        let report = session.start().await.unwrap();
        assert_eq!(report.broadcasting, RadioStatus::Active);
        assert_eq!(report.scanning, RadioStatus::Active);
    }

    // Discovery: each device hears the other and a pair appears.
    let mut alice_nearby = alice.watch_nearby();
    let mut bob_nearby = bob.watch_nearby();
    air.pulse();
    wait_for_nearby(&mut alice_nearby, "bob").await;
    wait_for_nearby(&mut bob_nearby, "alice").await;
    settle().await;

    let created = pair(&store).await;
    assert_eq!(created.low, id("alice"));
    assert_eq!(created.high, id("bob"));
    assert_eq!(BondState::of(&created), BondState::Unbonded);
    assert_eq!(store.pair_count().await, 1);

    // Proximity alone never accumulates.
    let gated = alice.accumulator().tick(&id("bob")).await;
    assert!(gated.is_err());
    assert_eq!(pair(&store).await.total_together_minutes, 0);

    // Alice requests: bob sees an incoming request.
    alice.request_bond(&id("bob")).await.unwrap();
    let bob_record = bob.me().await.unwrap().unwrap();
    assert_eq!(bob_record.incoming.into_iter().collect::<Vec<_>>(), vec![id("alice")]);
    assert_eq!(bob.incoming().await.unwrap(), vec![id("alice")]);
    assert!(alice.incoming().await.unwrap().is_empty());
    assert!(bob.nearby().is_empty(), "pending requester moves out of nearby");
    assert_eq!(alice.nearby().len(), 1, "requested peer stays nearby until accepted");

    // Bob accepts: mutual bond, no pending requests.
    let bonded = bob.accept_bond(&id("alice")).await.unwrap();
    assert!(bonded.is_mutual());
    let alice_record = alice.me().await.unwrap().unwrap();
    let bob_record = bob.me().await.unwrap().unwrap();
    assert!(alice_record.bonded.contains(&id("bob")));
    assert!(bob_record.bonded.contains(&id("alice")));
    assert!(alice_record.incoming.is_empty());
    assert!(bob_record.incoming.is_empty());
    assert!(alice.nearby().is_empty());

    // Ticks now accumulate, once per interval.
    let first = alice.accumulator().tick(&id("bob")).await.unwrap();
    assert_eq!(first, TickOutcome::Accumulated { total_minutes: 1 });
    clock.advance(Duration::seconds(10));
    let skipped = alice.accumulator().tick(&id("bob")).await.unwrap();
    assert!(matches!(skipped, TickOutcome::SkippedTooSoon { .. }));
    clock.advance(Duration::seconds(50));
    let second = alice.accumulator().tick(&id("bob")).await.unwrap();
    assert_eq!(second, TickOutcome::Accumulated { total_minutes: 2 });

    let final_pair = pair(&store).await;
    assert_eq!(final_pair.total_together_minutes, 2);
    assert_eq!(final_pair.last_seen_at, Some(clock.now()));

    let bonds = alice.bonds(10).await.unwrap();
    assert_eq!(bonds.len(), 1);
    assert_eq!(bonds[0].identity, id("bob"));
    assert_eq!(bonds[0].total_together_minutes, 2);

    for session in [&alice, &bob] {
        session.sign_out().await.unwrap();
    }
    assert_eq!(air.advertiser_count(), 0);
    assert_eq!(air.scanner_count(), 0);
}

#[tokio::test]
async fn test_unbond_and_decline_return_to_unbonded() {
    let air = MockAir::new();
    let store = Arc::new(LocalDocumentStore::in_memory());
    let clock = ManualClock::default();
    let alice = device("alice", &air, -48, &store, &clock);
    let bob = device("bob", &air, -55, &store, &clock);
    alice.start().await.unwrap();
    bob.start().await.unwrap();

    alice.request_bond(&id("bob")).await.unwrap();
    let declined = bob.decline_bond(&id("alice")).await.unwrap();
    assert_eq!(BondState::of(&declined), BondState::Unbonded);
    assert!(bob.incoming().await.unwrap().is_empty());

    alice.request_bond(&id("bob")).await.unwrap();
    bob.accept_bond(&id("alice")).await.unwrap();
    let dissolved = alice.unbond(&id("bob")).await.unwrap();
    assert_eq!(BondState::of(&dissolved), BondState::Unbonded);
    for session in [&alice, &bob] {
        let record = session.me().await.unwrap().unwrap();
        assert!(record.bonded.is_empty());
        assert!(record.incoming.is_empty());
    }
    assert!(alice.bonds(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_peer_out_of_range_disappears() {
    let air = MockAir::new();
    let store = Arc::new(LocalDocumentStore::in_memory());
    let clock = ManualClock::default();
    let alice = device("alice", &air, -48, &store, &clock);
    let bob = device("bob", &air, -55, &store, &clock);
    alice.start().await.unwrap();
    bob.start().await.unwrap();

    let mut nearby = alice.watch_nearby();
    air.pulse();
    wait_for_nearby(&mut nearby, "bob").await;

    bob.sign_out().await.unwrap();
    clock.advance(Duration::seconds(4));
    alice.coordinator().sweep();
    assert_eq!(alice.nearby().len(), 1);

    clock.advance(Duration::seconds(2));
    // The background sweeper may get there first.
    alice.coordinator().sweep();
    assert!(alice.nearby().is_empty());
}

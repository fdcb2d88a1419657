//! Feed coalescing and live delivery

use super::*;
use pretty_assertions::assert_eq;
use vine_nostr::Filter;

#[tokio::test]
async fn test_unsubscribing_one_feed_keeps_the_other() {
    let service = start_service(fast_config(), &[], Arc::new(ManualClock::new(0))).await;
    let keys = Keys::generate().unwrap();

    let home = service
        .subscribe("home", Filter::new().kinds([KIND_VIDEO]).limit(10))
        .await
        .unwrap();
    let mut explore = service
        .subscribe("explore", Filter::new().kinds([KIND_VIDEO]).limit(100))
        .await
        .unwrap();
    assert_eq!(service.status().local_subscriptions, 2);
    // Both feeds ride on a single relay subscription.
    assert_eq!(service.relay().status().subscriptions, 1);
    assert_eq!(next_feed_event(&mut explore).await, FeedEvent::EndOfStoredEvents);

    service.unsubscribe(home).await;
    assert_eq!(service.status().local_subscriptions, 1);
    assert_eq!(service.relay().status().subscriptions, 1);

    let clip = video(&keys, "vine_9", "still watching", 1_700_000_000);
    service.publish(clip.clone()).await.unwrap();
    assert_eq!(next_feed_event(&mut explore).await, FeedEvent::Event(clip));

    service.unsubscribe(explore).await;
    assert!(eventually(|| service.relay().status().subscriptions == 0).await);
}

#[tokio::test]
async fn test_live_events_delivered_exactly_once() {
    let service = start_service(fast_config(), &[], Arc::new(ManualClock::new(0))).await;
    let keys = Keys::generate().unwrap();
    let backfilled = note(&keys, "before", 1_700_000_000);
    service.publish(backfilled.clone()).await.unwrap();

    let mut feed = service
        .subscribe("notes", Filter::new().kinds([1]).authors([keys.public_key()]))
        .await
        .unwrap();
    assert_eq!(next_feed_event(&mut feed).await, FeedEvent::Event(backfilled.clone()));
    assert_eq!(next_feed_event(&mut feed).await, FeedEvent::EndOfStoredEvents);

    let live = note(&keys, "after", 1_700_000_001);
    service.publish(live.clone()).await.unwrap();
    service.publish(live.clone()).await.unwrap();
    service.publish(backfilled).await.unwrap();

    assert_eq!(next_feed_event(&mut feed).await, FeedEvent::Event(live));
    assert_quiet(&mut feed).await;
}

#[tokio::test]
async fn test_different_filters_use_separate_groups() {
    let service = start_service(fast_config(), &[], Arc::new(ManualClock::new(0))).await;
    let alice = Keys::generate().unwrap();
    let bob = Keys::generate().unwrap();

    let mut alice_feed = service
        .subscribe("alice", Filter::new().kinds([1]).authors([alice.public_key()]))
        .await
        .unwrap();
    let mut bob_feed = service
        .subscribe("bob", Filter::new().kinds([1]).authors([bob.public_key()]))
        .await
        .unwrap();
    assert_eq!(service.relay().status().subscriptions, 2);
    assert_eq!(next_feed_event(&mut alice_feed).await, FeedEvent::EndOfStoredEvents);
    assert_eq!(next_feed_event(&mut bob_feed).await, FeedEvent::EndOfStoredEvents);

    let from_bob = note(&bob, "hi", 1_700_000_000);
    service.publish(from_bob.clone()).await.unwrap();
    assert_eq!(next_feed_event(&mut bob_feed).await, FeedEvent::Event(from_bob));
    assert_quiet(&mut alice_feed).await;
}

#[tokio::test]
async fn test_dropped_handle_releases_its_group() {
    let service = start_service(fast_config(), &[], Arc::new(ManualClock::new(0))).await;
    let feed = service
        .subscribe("temporary", Filter::new().kinds([1]))
        .await
        .unwrap();
    assert_eq!(service.status().local_subscriptions, 1);

    drop(feed);
    assert_eq!(service.status().local_subscriptions, 0);
    assert!(eventually(|| service.relay().status().connections == 0).await);
}

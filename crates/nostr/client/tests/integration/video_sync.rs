//! Video feed scenarios: addressable kind 32222 events keyed by `d`

use super::*;
use pretty_assertions::assert_eq;
use vine_client::{LOCAL_RELAY, RelayOutcome};
use vine_nostr::Filter;

fn vine_1_filter(author: &str) -> Filter {
    Filter::new()
        .kinds([KIND_VIDEO])
        .authors([author])
        .identifiers(["vine_1"])
}

#[tokio::test]
async fn test_video_visible_after_publish() {
    let remote = MockTransport::new("wss://videos");
    let service = start_service(fast_config(), &[remote.clone()], Arc::new(ManualClock::new(0))).await;
    wait_connected(&service, &["wss://videos"]).await;
    let keys = Keys::generate().unwrap();
    let filter = vine_1_filter(keys.public_key());

    assert!(service.local_store_query(&filter).unwrap().is_empty());
    let mut feed = service.subscribe("profile", filter.clone()).await.unwrap();
    assert_eq!(next_feed_event(&mut feed).await, FeedEvent::EndOfStoredEvents);

    let first = video(&keys, "vine_1", "six seconds", 1_700_000_000);
    let report = service.publish(first.clone()).await.unwrap();
    assert!(report.is_successful());
    assert_eq!(report.outcome(LOCAL_RELAY), Some(&RelayOutcome::Acked));
    assert_eq!(report.outcome("wss://videos"), Some(&RelayOutcome::Acked));

    assert_eq!(service.local_store_query(&filter).unwrap(), vec![first.clone()]);
    assert_eq!(next_feed_event(&mut feed).await, FeedEvent::Event(first.clone()));
    assert_eq!(remote.published(), vec![first]);
}

#[tokio::test]
async fn test_newer_video_version_replaces_older() {
    let service = start_service(fast_config(), &[], Arc::new(ManualClock::new(0))).await;
    let keys = Keys::generate().unwrap();
    let filter = vine_1_filter(keys.public_key());

    let original = video(&keys, "vine_1", "take one", 1_700_000_000);
    let edited = video(&keys, "vine_1", "take two", 1_700_000_100);
    let other = video(&keys, "vine_2", "another loop", 1_700_000_050);

    service.publish(original.clone()).await.unwrap();
    service.publish(other.clone()).await.unwrap();
    let mut feed = service.subscribe("profile", filter.clone()).await.unwrap();
    assert_eq!(next_feed_event(&mut feed).await, FeedEvent::Event(original));
    assert_eq!(next_feed_event(&mut feed).await, FeedEvent::EndOfStoredEvents);

    service.publish(edited.clone()).await.unwrap();
    assert_eq!(next_feed_event(&mut feed).await, FeedEvent::Event(edited.clone()));
    assert_eq!(service.local_store_query(&filter).unwrap(), vec![edited.clone()]);

    // The other identifier is untouched.
    let all_videos = service
        .local_store_query(&Filter::new().kinds([KIND_VIDEO]))
        .unwrap();
    assert_eq!(all_videos, vec![edited, other]);
}

#[tokio::test]
async fn test_stale_video_version_is_acked_but_ignored() {
    let service = start_service(fast_config(), &[], Arc::new(ManualClock::new(0))).await;
    let keys = Keys::generate().unwrap();
    let filter = vine_1_filter(keys.public_key());

    let newer = video(&keys, "vine_1", "final cut", 1_700_000_100);
    let older = video(&keys, "vine_1", "draft", 1_700_000_000);
    service.publish(newer.clone()).await.unwrap();

    let mut feed = service.subscribe("profile", filter.clone()).await.unwrap();
    assert_eq!(next_feed_event(&mut feed).await, FeedEvent::Event(newer.clone()));
    assert_eq!(next_feed_event(&mut feed).await, FeedEvent::EndOfStoredEvents);

    let report = service.publish(older).await.unwrap();
    assert_eq!(report.outcome(LOCAL_RELAY), Some(&RelayOutcome::Acked));
    assert_eq!(service.local_store_query(&filter).unwrap(), vec![newer]);
    assert_quiet(&mut feed).await;
}

#[tokio::test]
async fn test_hashtag_feed_sees_every_author() {
    let service = start_service(fast_config(), &[], Arc::new(ManualClock::new(0))).await;
    let alice = Keys::generate().unwrap();
    let bob = Keys::generate().unwrap();

    let mut feed = service
        .subscribe(
            "hashtag:vine",
            Filter::new().kinds([KIND_VIDEO]).hashtags(["vine"]).limit(20),
        )
        .await
        .unwrap();
    assert_eq!(next_feed_event(&mut feed).await, FeedEvent::EndOfStoredEvents);

    let from_alice = video(&alice, "vine_1", "alice", 1_700_000_000);
    let from_bob = video(&bob, "vine_1", "bob", 1_700_000_001);
    service.publish(from_alice.clone()).await.unwrap();
    service.publish(from_bob.clone()).await.unwrap();

    assert_eq!(next_feed_event(&mut feed).await, FeedEvent::Event(from_alice));
    assert_eq!(next_feed_event(&mut feed).await, FeedEvent::Event(from_bob));
    assert_eq!(service.status().local_events, 2);
}

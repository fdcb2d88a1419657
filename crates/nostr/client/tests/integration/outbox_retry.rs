//! Outbox retries through reconnecting endpoints

use super::*;
use pretty_assertions::assert_eq;
use vine_client::{EndpointState, MockBehavior, RelayOutcome};

#[tokio::test]
async fn test_queued_event_delivered_after_reconnect() {
    let remote = MockTransport::new("wss://later");
    remote.refuse_connections(true);
    let service = start_service(fast_config(), &[remote.clone()], Arc::new(ManualClock::new(0))).await;

    let keys = Keys::generate().unwrap();
    let event = note(&keys, "sent while offline", 1_700_000_000);
    let report = service.publish(event.clone()).await.unwrap();
    assert!(report.is_successful());
    assert!(matches!(
        report.outcome("wss://later"),
        Some(RelayOutcome::Skipped(_))
    ));
    assert_eq!(service.status().outbox_depth, 1);
    assert!(matches!(
        service.status().relays[0].1,
        EndpointState::Backoff { .. } | EndpointState::Connecting | EndpointState::Disconnected
    ));

    remote.refuse_connections(false);
    assert!(eventually(|| service.status().outbox_depth == 0).await);
    assert_eq!(remote.published(), vec![event]);
    assert_eq!(service.status().connected_relays, 1);
}

#[tokio::test]
async fn test_succeeded_entries_never_reappear() {
    let remote = MockTransport::new("wss://once");
    remote.refuse_connections(true);
    let clock = Arc::new(ManualClock::new(0));
    let service = start_service(fast_config(), &[remote.clone()], clock.clone()).await;

    let keys = Keys::generate().unwrap();
    service
        .publish(note(&keys, "exactly once", 1_700_000_000))
        .await
        .unwrap();

    remote.refuse_connections(false);
    assert!(eventually(|| service.outbox().is_empty()).await);
    let attempts = remote.publish_attempts();

    clock.advance(Duration::from_secs(3600));
    sleep(Duration::from_millis(100)).await;
    assert!(service.outbox().is_empty());
    assert_eq!(remote.publish_attempts(), attempts);
    assert_eq!(remote.published().len(), 1);
}

#[tokio::test]
async fn test_exhausted_entry_reported_once() {
    let remote = MockTransport::new("wss://busy");
    let clock = Arc::new(ManualClock::new(0));
    let mut config = fast_config();
    config.outbox.max_attempts = 2;
    let service = start_service(config, &[remote.clone()], clock.clone()).await;
    wait_connected(&service, &["wss://busy"]).await;
    remote.set_behavior(MockBehavior::Reject("rate-limited: try later".to_string()));
    let mut failures = service.failures();

    let keys = Keys::generate().unwrap();
    let event = note(&keys, "never lands", 1_700_000_000);
    let report = service.publish(event.clone()).await.unwrap();
    assert_eq!(report.queued, vec!["wss://busy".to_string()]);

    clock.advance(Duration::from_secs(1));
    let failure = timeout(Duration::from_secs(2), failures.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failure.event_id, event.id);
    assert_eq!(failure.relay_url, "wss://busy");
    assert_eq!(failure.attempts, 2);
    assert_eq!(failure.reason, "rate-limited: try later");
    assert!(service.outbox().is_empty());

    clock.advance(Duration::from_secs(3600));
    assert!(
        timeout(Duration::from_millis(100), failures.recv())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_outbox_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = fast_config();
    config.outbox.db_path = Some(dir.path().join("outbox.db"));
    let keys = Keys::generate().unwrap();
    let event = note(&keys, "durable", 1_700_000_000);

    let down = MockTransport::new("wss://relay");
    down.refuse_connections(true);
    let first = start_service(config.clone(), &[down], Arc::new(ManualClock::new(0))).await;
    first.publish(event.clone()).await.unwrap();
    assert_eq!(first.status().outbox_depth, 1);
    first.shutdown().await;

    let up = MockTransport::new("wss://relay");
    let second = start_service(config, &[up.clone()], Arc::new(ManualClock::new(0))).await;
    assert!(eventually(|| second.status().outbox_depth == 0).await);
    assert_eq!(up.published(), vec![event]);
    second.shutdown().await;
}

#[tokio::test]
async fn test_long_offline_relay_keeps_its_entry() {
    let remote = MockTransport::new("wss://offline");
    remote.refuse_connections(true);
    let clock = Arc::new(ManualClock::new(0));
    let mut config = fast_config();
    config.outbox.max_attempts = 3;
    let service = start_service(config, &[remote.clone()], clock.clone()).await;
    let mut failures = service.failures();

    let keys = Keys::generate().unwrap();
    let event = note(&keys, "waits out the outage", 1_700_000_000);
    let report = service.publish(event.clone()).await.unwrap();
    assert_eq!(report.queued, vec!["wss://offline".to_string()]);

    // Many retry passes with the entry due each time, relay still down.
    for _ in 0..10 {
        clock.advance(Duration::from_secs(120));
        sleep(Duration::from_millis(60)).await;
    }

    assert_eq!(remote.publish_attempts(), 0);
    assert!(failures.try_recv().is_err());
    let entry = service.outbox().get(&event.id, "wss://offline").unwrap();
    assert_eq!(entry.attempt_count, 0);
    assert_eq!(entry.last_error, "disconnected");

    remote.refuse_connections(false);
    assert!(eventually(|| service.status().outbox_depth == 0).await);
    assert_eq!(remote.published(), vec![event]);
    assert!(failures.try_recv().is_err());
}

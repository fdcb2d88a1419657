//! Multi-relay broadcast behavior

use super::*;
use pretty_assertions::assert_eq;
use tokio::time::Instant;
use vine_client::{ClientError, LOCAL_RELAY, MockBehavior, OutboxState, RelayOutcome};
use vine_nostr::Filter;

#[tokio::test]
async fn test_one_good_one_failing_relay() {
    let good = MockTransport::new("wss://good");
    let flaky = MockTransport::new("wss://flaky");
    let service = start_service(
        fast_config(),
        &[good.clone(), flaky.clone()],
        Arc::new(ManualClock::new(0)),
    )
    .await;
    wait_connected(&service, &["wss://good", "wss://flaky"]).await;
    flaky.set_behavior(MockBehavior::Reject("error: disk full".to_string()));

    let keys = Keys::generate().unwrap();
    let event = note(&keys, "hello relays", 1_700_000_000);
    let report = service.publish(event.clone()).await.unwrap();

    assert!(report.is_successful());
    assert_eq!(report.acked_relays(), vec![LOCAL_RELAY, "wss://good"]);
    assert_eq!(report.failed_relays(), vec!["wss://flaky"]);
    assert_eq!(report.queued, vec!["wss://flaky".to_string()]);

    let entries = service.outbox().entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].relay_url, "wss://flaky");
    assert_eq!(entries[0].event, event);
    assert_eq!(entries[0].state, OutboxState::Pending);
    assert_eq!(entries[0].last_error, "error: disk full");
    assert_eq!(good.published(), vec![event]);
}

#[tokio::test]
async fn test_invalid_event_fails_synchronously() {
    let remote = MockTransport::new("wss://a");
    let service = start_service(fast_config(), &[remote.clone()], Arc::new(ManualClock::new(0))).await;
    wait_connected(&service, &["wss://a"]).await;

    let keys = Keys::generate().unwrap();
    let mut forged = note(&keys, "original", 1_700_000_000);
    forged.created_at += 1;

    let result = service.publish(forged).await;
    assert!(matches!(result, Err(ClientError::InvalidEvent(_))));
    assert_eq!(service.status().outbox_depth, 0);
    assert_eq!(remote.publish_attempts(), 0);
    assert!(
        service
            .local_store_query(&Filter::new().kinds([1]))
            .unwrap()
            .is_empty()
    );
}

#[tokio::test(start_paused = true)]
async fn test_slow_relay_bounded_by_send_timeout() {
    let fast = MockTransport::new("wss://fast");
    let stuck = MockTransport::new("wss://stuck").with_behavior(MockBehavior::Hang);
    let config = ClientConfig {
        send_timeout: Duration::from_secs(3),
        retry_poll_interval: Duration::from_secs(3600),
        ..fast_config()
    };
    let service = start_service(
        config,
        &[fast.clone(), stuck.clone()],
        Arc::new(ManualClock::new(0)),
    )
    .await;
    wait_connected(&service, &["wss://fast", "wss://stuck"]).await;

    let keys = Keys::generate().unwrap();
    let started = Instant::now();
    let report = service
        .publish(note(&keys, "don't wait forever", 1_700_000_000))
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_secs(3), "returned after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(4), "returned after {elapsed:?}");
    assert!(report.is_successful());
    assert_eq!(report.outcome("wss://fast"), Some(&RelayOutcome::Acked));
    assert!(matches!(
        report.outcome("wss://stuck"),
        Some(RelayOutcome::Failed(_))
    ));
    assert_eq!(report.queued, vec!["wss://stuck".to_string()]);
}

#[tokio::test]
async fn test_permanent_rejection_is_not_retried() {
    let strict = MockTransport::new("wss://strict")
        .with_behavior(MockBehavior::Reject("pow: difficulty 30 required".to_string()));
    let clock = Arc::new(ManualClock::new(0));
    let service = start_service(fast_config(), &[strict.clone()], clock.clone()).await;
    wait_connected(&service, &["wss://strict"]).await;

    let keys = Keys::generate().unwrap();
    let report = service
        .publish(note(&keys, "no pow", 1_700_000_000))
        .await
        .unwrap();
    assert!(report.is_successful());
    assert!(report.queued.is_empty());

    clock.advance(Duration::from_secs(120));
    sleep(Duration::from_millis(100)).await;
    assert_eq!(strict.publish_attempts(), 1);
}

//! End to end over a real WebSocket relay server

use super::*;
use pretty_assertions::assert_eq;
use vine_client::{RelayOutcome, WebSocketTransport};
use vine_nostr::Filter;
use vine_relay::{RelayServer, RelayServerConfig};

async fn start_remote() -> (String, EmbeddedRelay, tokio::sync::oneshot::Sender<()>) {
    init_tracing();
    let relay = EmbeddedRelay::in_memory();
    let server = RelayServer::bind(RelayServerConfig::loopback(0), relay.clone())
        .await
        .unwrap();
    let url = server.url().unwrap();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(server.run_until(async {
        let _ = stop_rx.await;
    }));
    (url, relay, stop_tx)
}

async fn start_against(url: &str) -> NostrService {
    let config = ClientConfig {
        relays: vec![url.to_string()],
        ..fast_config()
    };
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
    let service = NostrService::connect(config, EmbeddedRelay::in_memory(), clock)
        .await
        .unwrap();
    wait_connected(&service, &[url]).await;
    service
}

#[tokio::test]
async fn test_publish_reaches_remote_relay() {
    let (url, remote, _stop) = start_remote().await;
    let service = start_against(&url).await;
    let keys = Keys::generate().unwrap();

    let clip = video(&keys, "vine_1", "over the wire", 1_700_000_000);
    let report = service.publish(clip.clone()).await.unwrap();
    assert_eq!(report.outcome(&url), Some(&RelayOutcome::Acked));

    let on_remote = remote
        .store()
        .query(&Filter::new().kinds([KIND_VIDEO]))
        .into_events();
    assert_eq!(on_remote, vec![clip.clone()]);

    // Publishing again gets a duplicate OK, which still counts as acked.
    let again = service.publish(clip).await.unwrap();
    assert_eq!(again.outcome(&url), Some(&RelayOutcome::Acked));
    assert!(again.queued.is_empty());

    service.shutdown().await;
}

#[tokio::test]
async fn test_sync_from_remote_relay() {
    let (url, remote, _stop) = start_remote().await;
    let keys = Keys::generate().unwrap();
    for i in 0..3 {
        remote
            .publish(video(&keys, &format!("vine_{i}"), "remote", 1_700_000_000 + i))
            .unwrap();
    }
    remote.publish(note(&keys, "not a video", 1_700_000_010)).unwrap();

    let service = start_against(&url).await;
    let report = service
        .sync_from_remotes(&[Filter::new().kinds([KIND_VIDEO])])
        .await
        .unwrap();
    assert_eq!(report.fetched(), 3);
    assert_eq!(report.stored(), 3);
    assert_eq!(report.relays[0].error, None);

    let local = service
        .local_store_query(&Filter::new().kinds([KIND_VIDEO]))
        .unwrap();
    assert_eq!(local.len(), 3);
    assert_eq!(local[0].identifier(), "vine_2");

    service.shutdown().await;
}

#[tokio::test]
async fn test_transport_query_against_server() {
    let (url, remote, _stop) = start_remote().await;
    let keys = Keys::generate().unwrap();
    let stored = note(&keys, "stored", 1_700_000_000);
    remote.publish(stored.clone()).unwrap();

    let transport = WebSocketTransport::new(&url).unwrap();
    transport.connect().await.unwrap();
    let events = transport
        .query(&[Filter::new().kinds([1]), Filter::new().ids([stored.id.clone()])])
        .await
        .unwrap();
    assert_eq!(events, vec![stored]);

    let rejected = transport
        .query(&[Filter::new().since(10).until(5)])
        .await;
    assert!(matches!(
        rejected,
        Err(vine_client::ClientError::SubscriptionClosed(message)) if message.starts_with("invalid:")
    ));
    transport.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_publishes_of_one_event_share_a_socket() {
    let (url, remote, _stop) = start_remote().await;
    let transport = WebSocketTransport::new(&url).unwrap();
    transport.connect().await.unwrap();
    let keys = Keys::generate().unwrap();
    let event = note(&keys, "sent twice", 1_700_000_000);

    let (first, second) = tokio::join!(
        timeout(Duration::from_secs(2), transport.publish(&event)),
        timeout(Duration::from_secs(2), transport.publish(&event)),
    );
    let first = first.expect("first publish hung").unwrap();
    let second = second.expect("second publish hung").unwrap();

    assert!(first.accepted);
    assert!(second.accepted);
    assert_eq!(first.event_id, event.id);
    assert_eq!(remote.status().stored_events, 1);
    transport.disconnect().await.unwrap();
}

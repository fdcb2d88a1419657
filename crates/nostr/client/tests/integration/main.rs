//! Integration tests for the sync engine
//!
//! These run the embedded relay, the endpoint loops, the outbox and the
//! feed multiplexer together, against mock relays and a real WebSocket
//! relay server on a loopback port.

mod broadcast;
mod coalescing;
mod outbox_retry;
mod video_sync;
mod websocket;

use std::sync::{Arc, Once};
use tokio::time::{Duration, sleep, timeout};
use vine_client::{
    ClientConfig, FeedEvent, MockTransport, NostrService, RelayTransport, SubscriptionHandle,
};
use vine_nostr::{Clock, Event, EventSigner, EventTemplate, KIND_VIDEO, Keys, ManualClock};
use vine_relay::EmbeddedRelay;

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Config with short delays so reconnects and retries happen quickly.
pub fn fast_config() -> ClientConfig {
    let mut config = ClientConfig {
        send_timeout: Duration::from_millis(500),
        connect_timeout: Duration::from_millis(500),
        reconnect_base: Duration::from_millis(20),
        reconnect_max: Duration::from_millis(100),
        retry_poll_interval: Duration::from_millis(20),
        ..ClientConfig::default()
    };
    config.outbox.base_delay = Duration::from_secs(1);
    config
}

pub async fn start_service(
    config: ClientConfig,
    mocks: &[MockTransport],
    clock: Arc<ManualClock>,
) -> NostrService {
    start_service_with(config, EmbeddedRelay::in_memory(), mocks, clock).await
}

pub async fn start_service_with(
    config: ClientConfig,
    relay: EmbeddedRelay,
    mocks: &[MockTransport],
    clock: Arc<ManualClock>,
) -> NostrService {
    init_tracing();
    let transports: Vec<Arc<dyn RelayTransport>> = mocks
        .iter()
        .map(|mock| Arc::new(mock.clone()) as Arc<dyn RelayTransport>)
        .collect();
    let clock: Arc<dyn Clock> = clock;
    NostrService::start(config, relay, transports, clock)
        .await
        .unwrap()
}

/// Wait until every endpoint that accepts connections is connected.
pub async fn wait_connected(service: &NostrService, urls: &[&str]) {
    for url in urls {
        let endpoint = service.endpoint(url).unwrap();
        assert!(
            endpoint.wait_connected(Duration::from_secs(2)).await,
            "{url} never connected"
        );
    }
    // Let the retry worker see the connect signals before the test goes on.
    sleep(Duration::from_millis(50)).await;
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    condition()
}

pub async fn next_feed_event(handle: &mut SubscriptionHandle) -> FeedEvent {
    timeout(Duration::from_secs(2), handle.recv())
        .await
        .expect("timed out waiting for feed event")
        .expect("feed ended")
}

pub async fn assert_quiet(handle: &mut SubscriptionHandle) {
    assert!(
        timeout(Duration::from_millis(100), handle.recv()).await.is_err(),
        "unexpected feed event"
    );
}

pub fn note(keys: &Keys, content: &str, created_at: u64) -> Event {
    keys.sign_template(&EventTemplate {
        kind: 1,
        tags: vec![],
        content: content.to_string(),
        created_at,
    })
    .unwrap()
}

pub fn video(keys: &Keys, identifier: &str, title: &str, created_at: u64) -> Event {
    keys.sign_template(&EventTemplate {
        kind: KIND_VIDEO,
        tags: vec![
            vec!["d".to_string(), identifier.to_string()],
            vec!["title".to_string(), title.to_string()],
            vec!["t".to_string(), "vine".to_string()],
        ],
        content: String::new(),
        created_at,
    })
    .unwrap()
}

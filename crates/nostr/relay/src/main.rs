//! Standalone embedded relay
//!
//! Serves the Vine event store over a loopback WebSocket. Configuration
//! comes from the environment:
//!
//! - `VINE_RELAY_PORT`: listen port (default 7447)
//! - `VINE_RELAY_DB_PATH`: SQLite file; unset keeps events in memory
//! - `RUST_LOG`: tracing filter (default `info`)

use anyhow::Context;
use tracing::info;
use vine_relay::{EmbeddedRelay, RelayServer, RelayServerConfig, SessionConfig, StoreConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let store_config = StoreConfig::default();
    match &store_config.database {
        Some(db) => info!("Persisting events to {:?}", db.path),
        None => info!("No database configured, events are kept in memory"),
    }

    let relay = EmbeddedRelay::open(store_config, SessionConfig::default())
        .context("failed to open event store")?;
    let server = RelayServer::bind(RelayServerConfig::default(), relay)
        .await
        .context("failed to bind relay server")?;

    info!("Serving {}", server.url()?);

    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

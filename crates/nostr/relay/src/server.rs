//! Loopback WebSocket server for the embedded relay
//!
//! Every accepted connection becomes one [`RelaySession`]; the server only
//! moves NIP-01 frames between the socket and the session.

use crate::error::{RelayError, Result};
use crate::metrics::RelayMetrics;
use crate::session::{EmbeddedRelay, RelaySession, SessionSender};
use futures::{Sink, SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use vine_nostr::{ClientMessage, RelayMessage};

/// Environment variable overriding the listen port.
pub const PORT_ENV: &str = "VINE_RELAY_PORT";

pub const DEFAULT_PORT: u16 = 7447;

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    /// Bind address for the WebSocket server
    pub bind_addr: SocketAddr,
    /// Maximum message size in bytes
    pub max_message_size: usize,
}

impl RelayServerConfig {
    /// Loopback address on `port`; port 0 picks a free one.
    pub fn loopback(port: u16) -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], port)),
            max_message_size: 512 * 1024,
        }
    }
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        let port = std::env::var(PORT_ENV)
            .ok()
            .and_then(|p| p.parse::<u16>().ok())
            .unwrap_or(DEFAULT_PORT);
        Self::loopback(port)
    }
}

/// WebSocket front for an [`EmbeddedRelay`]
pub struct RelayServer {
    config: RelayServerConfig,
    relay: EmbeddedRelay,
    listener: TcpListener,
}

impl RelayServer {
    pub async fn bind(config: RelayServerConfig, relay: EmbeddedRelay) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        Ok(Self {
            config,
            relay,
            listener,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// `ws://` URL clients should dial.
    pub fn url(&self) -> Result<String> {
        Ok(format!("ws://{}", self.local_addr()?))
    }

    pub fn relay(&self) -> &EmbeddedRelay {
        &self.relay
    }

    /// Accept connections forever.
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        info!("Relay server listening on {}", self.local_addr()?);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Relay server shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("New connection from {}", addr);
                        let relay = self.relay.clone();
                        let max_message_size = self.config.max_message_size;
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, relay, max_message_size).await {
                                error!("Error handling connection from {}: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                    }
                },
            }
        }
    }
}

/// Handle a single WebSocket connection
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    relay: EmbeddedRelay,
    max_message_size: usize,
) -> Result<()> {
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| RelayError::WebSocket(e.to_string()))?;

    info!("WebSocket connection established: {}", addr);

    let (mut write, mut read) = ws_stream.split();
    let metrics = relay.metrics();
    let mut session = relay.connect();

    let result = pump(&mut session, &mut write, &mut read, &metrics, addr, max_message_size).await;

    session.shutdown().await;
    info!("Connection closed: {}", addr);
    result
}

/// Move frames between the socket and the session until either side ends.
///
/// Reading and writing run concurrently, so a read waiting on a full session
/// command queue never stops the session's outbound queue from draining.
async fn pump<W, R>(
    session: &mut RelaySession,
    write: &mut W,
    read: &mut R,
    metrics: &RelayMetrics,
    addr: SocketAddr,
    max_message_size: usize,
) -> Result<()>
where
    W: Sink<Message> + Unpin,
    W::Error: std::fmt::Display,
    R: futures::Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    let (replies_tx, replies_rx) = mpsc::unbounded_channel();
    let sender = session.sender();

    tokio::select! {
        result = read_frames(read, sender, replies_tx, metrics, addr, max_message_size) => result,
        result = write_frames(write, session, replies_rx, metrics) => result,
    }
}

/// Frames the server answers directly, without going through the session
enum Reply {
    Notice(RelayMessage),
    Pong(Message),
}

async fn read_frames<R>(
    read: &mut R,
    sender: SessionSender,
    replies: mpsc::UnboundedSender<Reply>,
    metrics: &RelayMetrics,
    addr: SocketAddr,
    max_message_size: usize,
) -> Result<()>
where
    R: futures::Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    while let Some(msg) = read.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                metrics.bytes_in(text.len() as u64);

                if text.len() > max_message_size {
                    warn!("Message from {} exceeds size limit: {} > {}", addr, text.len(), max_message_size);
                    let notice = RelayMessage::Notice {
                        message: format!("invalid: message too large: {} bytes (max: {})", text.len(), max_message_size),
                    };
                    if replies.send(Reply::Notice(notice)).is_err() {
                        return Ok(());
                    }
                    continue;
                }

                match ClientMessage::from_json(text.as_str()) {
                    Ok(message) => {
                        if sender.send(message).await.is_err() {
                            return Ok(());
                        }
                    }
                    Err(e) => {
                        warn!("Invalid message from {}: {}", addr, e);
                        let notice = RelayMessage::Notice {
                            message: format!("invalid: {}", e),
                        };
                        if replies.send(Reply::Notice(notice)).is_err() {
                            return Ok(());
                        }
                    }
                }
            }
            Ok(Message::Close(_)) => {
                info!("Client {} disconnected", addr);
                return Ok(());
            }
            Ok(Message::Ping(data)) => {
                debug!("Ping from {}", addr);
                if replies.send(Reply::Pong(Message::Pong(data))).is_err() {
                    return Ok(());
                }
            }
            Ok(_) => {}
            Err(e) => return Err(RelayError::WebSocket(e.to_string())),
        }
    }
    Ok(())
}

async fn write_frames<W>(
    write: &mut W,
    session: &mut RelaySession,
    mut replies: mpsc::UnboundedReceiver<Reply>,
    metrics: &RelayMetrics,
) -> Result<()>
where
    W: Sink<Message> + Unpin,
    W::Error: std::fmt::Display,
{
    let mut replies_open = true;
    loop {
        tokio::select! {
            reply = replies.recv(), if replies_open => match reply {
                Some(Reply::Notice(notice)) => send(write, &notice, metrics).await?,
                Some(Reply::Pong(pong)) => write
                    .send(pong)
                    .await
                    .map_err(|e| RelayError::WebSocket(e.to_string()))?,
                None => replies_open = false,
            },
            outbound = session.recv() => match outbound {
                Some(message) => send(write, &message, metrics).await?,
                None => return Ok(()),
            },
        }
    }
}

async fn send<W>(write: &mut W, message: &RelayMessage, metrics: &RelayMetrics) -> Result<()>
where
    W: Sink<Message> + Unpin,
    W::Error: std::fmt::Display,
{
    let text = message.to_json()?;
    metrics.bytes_out(text.len() as u64);
    write
        .send(Message::text(text))
        .await
        .map_err(|e| RelayError::WebSocket(e.to_string()))
}

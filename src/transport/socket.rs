// Event channel over Socket.IO (WebSocket transport)
// One connection per process; sessions attach through subscriptions.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

use super::socket_io::{self, Packet};
use super::{EventChannel, InboundEvent, OutboundEvent, Subscribers, Subscription};

const HANDSHAKE_TIMEOUT_SECS: u64 = 10;

enum Outgoing {
    Frame(String),
    Close,
}

pub struct SocketChannel {
    outbound: mpsc::UnboundedSender<Outgoing>,
    subscribers: Subscribers,
    connected: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

/// Turn an http(s) base URL into the Engine.IO WebSocket endpoint.
pub fn websocket_url(base_url: &str) -> Result<String> {
    let base = base_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else if base.starts_with("ws://") || base.starts_with("wss://") {
        base.to_string()
    } else {
        return Err(anyhow!("socket url must start with http(s):// or ws(s)://, got '{}'", base_url));
    };
    Ok(format!("{}/socket.io/?EIO=4&transport=websocket", ws_base))
}

impl SocketChannel {
    /// Connect and complete the Engine.IO and namespace handshakes.
    pub async fn connect(base_url: &str) -> Result<Self> {
        let url = websocket_url(base_url)?;
        info!("Connecting event channel to {}", url);

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to connect websocket: {}", url))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Engine.IO open, then our namespace connect, then the server's connect ack
        timeout(Duration::from_secs(HANDSHAKE_TIMEOUT_SECS), async {
            let mut opened = false;
            while let Some(frame) = ws_reader.next().await {
                let text = match frame.context("websocket receive failed during handshake")? {
                    WsMessage::Text(text) => text,
                    WsMessage::Close(_) => return Err(anyhow!("server closed the connection during handshake")),
                    _ => continue,
                };
                match socket_io::decode(text.as_str()) {
                    Ok(Packet::Open(handshake)) if !opened => {
                        debug!("Engine.IO session opened: {}", handshake);
                        opened = true;
                        ws_writer
                            .send(WsMessage::text(socket_io::encode(&Packet::Connect(None))))
                            .await
                            .context("failed to send namespace connect")?;
                    }
                    Ok(Packet::Connect(_)) if opened => return Ok(()),
                    Ok(Packet::ConnectError(err)) => return Err(anyhow!("namespace connect refused: {}", err)),
                    Ok(Packet::Ping(probe)) => {
                        ws_writer
                            .send(WsMessage::text(socket_io::encode(&Packet::Pong(probe))))
                            .await
                            .context("failed to answer ping during handshake")?;
                    }
                    Ok(other) => debug!("Ignoring packet during handshake: {:?}", other),
                    Err(e) => warn!("Undecodable frame during handshake: {}", e),
                }
            }
            Err(anyhow!("connection ended during handshake"))
        })
        .await
        .map_err(|_| anyhow!("timed out waiting for socket handshake"))??;

        info!("Event channel connected");

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Outgoing>();
        let subscribers = Subscribers::new();
        let connected = Arc::new(AtomicBool::new(true));

        // Writer: drains the outbound queue so emit never blocks
        tokio::spawn(async move {
            while let Some(outgoing) = outbound_rx.recv().await {
                match outgoing {
                    Outgoing::Frame(frame) => {
                        if let Err(e) = ws_writer.send(WsMessage::text(frame)).await {
                            error!("Failed to write to event channel: {}", e);
                            break;
                        }
                    }
                    Outgoing::Close => {
                        if let Err(e) = ws_writer.close().await {
                            debug!("Error closing websocket: {}", e);
                        }
                        break;
                    }
                }
            }
            debug!("Event channel writer stopped");
        });

        // Reader: decodes frames and fans events out to subscribers
        let reader_subscribers = subscribers.clone();
        let reader_outbound = outbound.clone();
        let reader_connected = connected.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                let text = match frame {
                    Ok(WsMessage::Text(text)) => text,
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        error!("Event channel receive failed: {}", e);
                        break;
                    }
                };

                match socket_io::decode(text.as_str()) {
                    Ok(Packet::Ping(probe)) => {
                        let pong = socket_io::encode(&Packet::Pong(probe));
                        if reader_outbound.send(Outgoing::Frame(pong)).is_err() {
                            break;
                        }
                    }
                    Ok(Packet::Event { name, data }) => match InboundEvent::from_wire(&name, data) {
                        Ok(Some(event)) => reader_subscribers.broadcast(&event),
                        Ok(None) => debug!("Ignoring unhandled event '{}'", name),
                        Err(e) => warn!("Discarding malformed event: {}", e),
                    },
                    Ok(Packet::Disconnect) | Ok(Packet::Close) => {
                        info!("Server closed the event channel");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Discarding undecodable frame: {}", e),
                }
            }

            reader_connected.store(false, Ordering::SeqCst);
            reader_subscribers.close_all();
            debug!("Event channel reader stopped");
        });

        Ok(SocketChannel {
            outbound,
            subscribers,
            connected,
            reader: Mutex::new(Some(reader)),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventChannel for SocketChannel {
    fn emit(&self, event: OutboundEvent) -> Result<()> {
        if !self.is_connected() {
            return Err(anyhow!("event channel is disconnected"));
        }
        debug!("Emitting {} event", event.name());
        let frame = socket_io::encode(&Packet::event(event.name(), event.payload()));
        self.outbound
            .send(Outgoing::Frame(frame))
            .map_err(|_| anyhow!("event channel writer has stopped"))
    }

    fn subscribe(&self) -> Subscription {
        self.subscribers.subscribe()
    }

    async fn disconnect(&self) -> Result<()> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            debug!("Event channel already disconnected");
            return Ok(());
        }
        info!("Disconnecting event channel");

        let _ = self
            .outbound
            .send(Outgoing::Frame(socket_io::encode(&Packet::Disconnect)));
        let _ = self.outbound.send(Outgoing::Close);

        let reader = self.reader.lock().ok().and_then(|mut guard| guard.take());
        if let Some(reader) = reader {
            reader.abort();
        }
        self.subscribers.close_all();
        Ok(())
    }
}

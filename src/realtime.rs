//! Realtime sync channel.
//!
//! Keeps a Socket.IO session (Engine.IO v4 over a WebSocket) open to the media
//! server. Incoming events are forwarded to the coordinator over an mpsc
//! channel; outgoing messages are queued through a [`ChannelLink`].

use crate::api::RemoteState;
use crate::backoff::Backoff;
use crate::config::SyncSettings;
use crate::error::{Error, Result};
use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::COOKIE, HeaderValue},
        Message,
    },
};
use tokio_util::sync::CancellationToken;
use url::Url;

/// Engine.IO query selecting protocol v4 on a direct WebSocket transport.
const ENGINE_IO_QUERY: &str = "EIO=4&transport=websocket";

/// Events from the sync channel.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Connected,
    /// About to retry after `delay`.
    Reconnecting { attempt: u32, delay: Duration },
    /// The connection dropped. A server-initiated close parks the channel
    /// until [`ChannelLink::resume`] is called.
    Disconnected { server_initiated: bool },
    /// Reconnect attempts used up; the channel task has stopped.
    Exhausted { attempts: u32 },
    Enabled {
        host_session_id: Option<String>,
        media: Option<RemoteState>,
    },
    State(RemoteState),
    Disabled,
    Error { message: String },
    HeartbeatAck,
}

/// Messages sent to the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    JoinSync,
    LeaveSync,
    Heartbeat,
    UpdateMyState {
        category_id: String,
        index: usize,
        /// The full order as currently loaded. The server rejects reports
        /// without one.
        media_order: Vec<String>,
    },
}

impl ClientMessage {
    pub fn event(&self) -> (&'static str, serde_json::Value) {
        match self {
            ClientMessage::JoinSync => ("join_sync", serde_json::json!({})),
            ClientMessage::LeaveSync => ("leave_sync", serde_json::json!({})),
            ClientMessage::Heartbeat => ("heartbeat", serde_json::json!({})),
            ClientMessage::UpdateMyState {
                category_id,
                index,
                media_order,
            } => (
                "update_my_state",
                serde_json::json!({
                    "category_id": category_id,
                    "index": index,
                    "media_order": media_order,
                }),
            ),
        }
    }

    /// Socket.IO event packet: `42["name",{...}]`.
    pub fn to_packet(&self) -> String {
        let (event, data) = self.event();
        format!("42{}", serde_json::json!([event, data]))
    }
}

/// One decoded Engine.IO text packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Engine.IO handshake, `0{...}`.
    Open,
    /// Engine.IO close, `1`.
    Close,
    Ping,
    Pong,
    /// Namespace connect acknowledged, `40`.
    Connected,
    /// Namespace disconnect, `41`.
    Disconnected,
    /// Event packet, `42[...]`. `None` for events the client does not act on.
    Event(Option<SyncEvent>),
    /// Namespace connect refused, `44{...}`.
    ConnectError(String),
    /// Upgrade, noop and ack packets.
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct EnabledPayload {
    #[serde(default)]
    host_session_id: Option<String>,
    #[serde(default)]
    media: Option<RemoteState>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorPayload {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

fn payload<T: DeserializeOwned + Default>(data: serde_json::Value) -> Result<T> {
    if data.is_null() {
        return Ok(T::default());
    }
    Ok(serde_json::from_value(data)?)
}

fn split_kind(text: &str) -> Result<(char, &str)> {
    let mut chars = text.chars();
    let kind = chars
        .next()
        .ok_or_else(|| Error::Protocol("empty packet".into()))?;
    Ok((kind, chars.as_str()))
}

/// Decode an Engine.IO text frame.
pub fn decode_packet(text: &str) -> Result<Packet> {
    let (kind, rest) = split_kind(text)?;
    let packet = match kind {
        '0' => Packet::Open,
        '1' => Packet::Close,
        '2' => Packet::Ping,
        '3' => Packet::Pong,
        '4' => decode_socket_packet(rest)?,
        '5' | '6' => Packet::Other,
        other => return Err(Error::Protocol(format!("unknown packet type {:?}", other))),
    };
    Ok(packet)
}

fn decode_socket_packet(text: &str) -> Result<Packet> {
    let (kind, rest) = split_kind(text)?;
    // Optional "/namespace," prefix, then an optional ack id.
    let body = match rest.strip_prefix('/') {
        Some(namespaced) => namespaced.split_once(',').map_or("", |(_, body)| body),
        None => rest,
    };
    let body = body.trim_start_matches(|c: char| c.is_ascii_digit());

    let packet = match kind {
        '0' => Packet::Connected,
        '1' => Packet::Disconnected,
        '2' => Packet::Event(parse_server_message(body)?),
        '4' => {
            let error: ErrorPayload = serde_json::from_str(body).unwrap_or_default();
            Packet::ConnectError(
                error
                    .message
                    .or(error.error)
                    .unwrap_or_else(|| body.to_string()),
            )
        }
        _ => Packet::Other,
    };
    Ok(packet)
}

/// Decode the `["event", data]` array of an event packet. Events the client
/// does not act on yield `None`.
pub fn parse_server_message(text: &str) -> Result<Option<SyncEvent>> {
    let mut parts: Vec<serde_json::Value> = serde_json::from_str(text)?;
    if parts.is_empty() {
        return Err(Error::Protocol("event packet without a name".into()));
    }
    let name = match parts.remove(0) {
        serde_json::Value::String(name) => name,
        other => return Err(Error::Protocol(format!("invalid event name {}", other))),
    };
    let data = if parts.is_empty() {
        serde_json::Value::Null
    } else {
        parts.remove(0)
    };

    let event = match name.as_str() {
        "sync_state" => Some(SyncEvent::State(payload(data)?)),
        "sync_enabled" => {
            let enabled: EnabledPayload = payload(data)?;
            Some(SyncEvent::Enabled {
                host_session_id: enabled.host_session_id,
                media: enabled.media,
            })
        }
        "sync_disabled" => Some(SyncEvent::Disabled),
        "sync_error" => {
            let error: ErrorPayload = payload(data)?;
            Some(SyncEvent::Error {
                message: error
                    .message
                    .or(error.error)
                    .unwrap_or_else(|| "unknown sync error".into()),
            })
        }
        "heartbeat_response" => Some(SyncEvent::HeartbeatAck),
        "connection_status" => {
            tracing::debug!("Sync connection status: {}", data);
            None
        }
        other => {
            tracing::debug!("Ignoring sync event {}", other);
            None
        }
    };
    Ok(event)
}

/// Build the WebSocket URL of the Socket.IO endpoint.
pub fn ws_url(server_url: &str, channel_path: &str) -> anyhow::Result<Url> {
    let mut url = Url::parse(server_url).context("Invalid server URL")?;

    let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
    url.set_scheme(scheme)
        .map_err(|_| anyhow::anyhow!("Failed to set WebSocket scheme"))?;
    url.set_path(channel_path);
    url.set_query(Some(ENGINE_IO_QUERY));

    Ok(url)
}

/// How a connected session ended without an error.
enum Closed {
    Server,
    Shutdown,
}

/// Sync channel connection manager.
pub struct RealtimeManager {
    server_url: String,
    channel_path: String,
    session_id: String,
    heartbeat: Duration,
    backoff: Backoff,
    event_tx: mpsc::Sender<SyncEvent>,
    outgoing_rx: mpsc::Receiver<ClientMessage>,
    resume: Arc<Notify>,
    shutdown: CancellationToken,
}

impl RealtimeManager {
    /// Connection loop. Returns on shutdown or once reconnects are exhausted.
    pub async fn run(mut self) {
        let mut attempt: u32 = 0;
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }
            tracing::info!("Connecting to sync channel...");

            let mut connected = false;
            match self.connect_and_join(&mut connected).await {
                Ok(Closed::Shutdown) => return,
                Ok(Closed::Server) => {
                    let _ = self
                        .event_tx
                        .send(SyncEvent::Disconnected {
                            server_initiated: true,
                        })
                        .await;
                    attempt = 0;
                    tracing::info!("Sync channel parked until resumed");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return,
                        _ = self.resume.notified() => continue,
                    }
                }
                Err(e) => {
                    tracing::warn!("Sync channel error: {:#}", e);
                }
            }

            if connected {
                attempt = 0;
                let _ = self
                    .event_tx
                    .send(SyncEvent::Disconnected {
                        server_initiated: false,
                    })
                    .await;
            }
            if self.backoff.exhausted(attempt) {
                tracing::error!("Giving up on sync channel after {} attempts", attempt);
                let _ = self
                    .event_tx
                    .send(SyncEvent::Exhausted { attempts: attempt })
                    .await;
                return;
            }

            let delay = self.backoff.delay(attempt);
            attempt += 1;
            tracing::info!("Reconnecting to sync channel in {:?} (attempt {})", delay, attempt);
            let _ = self
                .event_tx
                .send(SyncEvent::Reconnecting { attempt, delay })
                .await;
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = sleep(delay) => {}
            }
        }
    }

    /// Connect, join the sync room and pump frames until the connection ends.
    ///
    /// `connected` flips once the server acknowledged the namespace connect.
    async fn connect_and_join(&mut self, connected: &mut bool) -> anyhow::Result<Closed> {
        let url = ws_url(&self.server_url, &self.channel_path)?;
        tracing::debug!("Connecting to: {}", url);

        let mut request = url.as_str().into_client_request()?;
        let cookie = HeaderValue::from_str(&format!("session_id={}", self.session_id))
            .context("Invalid session id")?;
        request.headers_mut().insert(COOKIE, cookie);

        let (ws_stream, _response) = tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(Closed::Shutdown),
            result = connect_async(request) => result.context("Failed to connect to WebSocket")?,
        };
        let (mut write, mut read) = ws_stream.split();

        let mut heartbeat = tokio::time::interval(self.heartbeat);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(Closed::Shutdown);
                }
                _ = heartbeat.tick(), if *connected => {
                    write
                        .send(Message::Text(ClientMessage::Heartbeat.to_packet()))
                        .await
                        .context("Failed to send heartbeat")?;
                }
                Some(message) = self.outgoing_rx.recv(), if *connected => {
                    write
                        .send(Message::Text(message.to_packet()))
                        .await
                        .context("Failed to send message")?;
                }
                frame = read.next() => {
                    let Some(frame) = frame else {
                        anyhow::bail!("Sync channel stream ended");
                    };
                    let text = match frame.context("Failed to receive message")? {
                        Message::Text(text) => text,
                        Message::Ping(data) => {
                            write
                                .send(Message::Pong(data))
                                .await
                                .context("Failed to send pong")?;
                            continue;
                        }
                        Message::Close(_) => {
                            tracing::info!("Sync channel closed by server");
                            return Ok(Closed::Server);
                        }
                        _ => continue,
                    };

                    let packet = match decode_packet(&text) {
                        Ok(packet) => packet,
                        Err(e) => {
                            tracing::debug!("Failed to parse sync message: {} - {}", e, text);
                            continue;
                        }
                    };
                    match packet {
                        Packet::Open => {
                            write
                                .send(Message::Text("40".into()))
                                .await
                                .context("Failed to open namespace")?;
                        }
                        Packet::Connected => {
                            *connected = true;
                            let _ = self.event_tx.send(SyncEvent::Connected).await;
                            write
                                .send(Message::Text(ClientMessage::JoinSync.to_packet()))
                                .await
                                .context("Failed to join sync")?;
                            tracing::info!("Sync channel connected");
                        }
                        Packet::Ping => {
                            write
                                .send(Message::Text("3".into()))
                                .await
                                .context("Failed to answer ping")?;
                        }
                        Packet::Event(Some(event)) => {
                            tracing::debug!("Sync event: {:?}", event);
                            let _ = self.event_tx.send(event).await;
                        }
                        Packet::ConnectError(message) => {
                            anyhow::bail!("Sync namespace refused: {}", message);
                        }
                        Packet::Close | Packet::Disconnected => {
                            tracing::info!("Sync channel closed by server");
                            return Ok(Closed::Server);
                        }
                        Packet::Pong | Packet::Event(None) | Packet::Other => {}
                    }
                }
            }
        }
    }
}

/// Cheap handle for talking to a running channel task.
#[derive(Debug, Clone)]
pub struct ChannelLink {
    outgoing: mpsc::Sender<ClientMessage>,
    resume: Arc<Notify>,
}

impl ChannelLink {
    pub fn new(outgoing: mpsc::Sender<ClientMessage>, resume: Arc<Notify>) -> Self {
        Self { outgoing, resume }
    }

    /// Queue a message; dropped with a warning when the queue is full.
    pub fn send(&self, message: ClientMessage) -> bool {
        match self.outgoing.try_send(message) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Dropping sync message: {}", e);
                false
            }
        }
    }

    /// Let a parked channel reconnect.
    pub fn resume(&self) {
        self.resume.notify_one();
    }
}

/// Owner handle of the channel task.
pub struct RealtimeHandle {
    link: ChannelLink,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl RealtimeHandle {
    pub fn link(&self) -> ChannelLink {
        self.link.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Close the connection and wait for the task to stop.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!("Sync channel task failed: {}", e);
        }
    }
}

/// Spawn the sync channel as a background task.
pub fn spawn_realtime(
    server_url: String,
    session_id: String,
    settings: &SyncSettings,
) -> (RealtimeHandle, mpsc::Receiver<SyncEvent>) {
    let (event_tx, event_rx) = mpsc::channel(100);
    let (outgoing_tx, outgoing_rx) = mpsc::channel(32);
    let resume = Arc::new(Notify::new());
    let shutdown = CancellationToken::new();

    let manager = RealtimeManager {
        server_url,
        channel_path: settings.channel_path.clone(),
        session_id,
        heartbeat: settings.heartbeat_interval(),
        backoff: Backoff::from_settings(settings),
        event_tx,
        outgoing_rx,
        resume: Arc::clone(&resume),
        shutdown: shutdown.clone(),
    };
    let task = tokio::spawn(manager.run());

    let handle = RealtimeHandle {
        link: ChannelLink::new(outgoing_tx, resume),
        shutdown,
        task,
    };
    (handle, event_rx)
}

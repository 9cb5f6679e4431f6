//! Session relay: a WebSocket server that forwards yrs updates between the
//! peers of a session.
//!
//! ```text
//! Peer A ──┐
//!           ├── Room ("interactive-flowchart") ── replica ── BroadcastGroup
//! Peer B ──┘                                                    │
//!                                              ┌────────────────┼───────────┐
//!                                              ▼                ▼           ▼
//!                                           Peer A           Peer B      Peer C
//! ```
//!
//! The relay does not persist anything. A room's replica exists so that a
//! peer joining a running session receives the state the others share.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{MessageType, PeerInfo, SyncMessage};
use crate::room::{Room, RoomManager};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Peers beyond this count are turned away
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

struct Shared {
    config: RelayConfig,
    rooms: RoomManager,
    stats: RwLock<RelayStats>,
}

pub struct RelayServer {
    shared: Arc<Shared>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let rooms = RoomManager::new(config.broadcast_capacity);
        Self {
            shared: Arc::new(Shared {
                config,
                rooms,
                stats: RwLock::new(RelayStats::default()),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!("Session relay listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> RelayStats {
        self.shared.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    pub fn rooms(&self) -> &RoomManager {
        &self.shared.rooms
    }
}

/// Membership of one connection once its `PeerJoined` has been accepted.
struct Joined {
    peer_id: Uuid,
    session: String,
    room: Arc<Room>,
    rx: broadcast::Receiver<Arc<Vec<u8>>>,
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    shared: Arc<Shared>,
) -> Result<(), BoxError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    log::info!("WebSocket connection established from {addr}");
    {
        let mut s = shared.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let mut joined: Option<Joined> = None;

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        let sync_msg = match SyncMessage::decode(&bytes) {
                            Ok(m) => m,
                            Err(e) => {
                                log::warn!("Failed to decode message from {addr}: {e}");
                                continue;
                            }
                        };
                        {
                            let mut s = shared.stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += bytes.len() as u64;
                        }

                        match sync_msg.msg_type {
                            MessageType::PeerJoined => {
                                if joined.is_some() {
                                    log::debug!("Ignoring repeated join from {addr}");
                                    continue;
                                }
                                let info = sync_msg.peer_info().unwrap_or_else(|_| {
                                    PeerInfo::with_id(sync_msg.peer_id, "Anonymous")
                                });
                                let Some((room, rx)) = shared
                                    .rooms
                                    .join(&sync_msg.session, info.clone(), shared.config.max_peers_per_room)
                                    .await
                                else {
                                    log::warn!(
                                        "Session {} is full, turning away {}",
                                        sync_msg.session,
                                        info.peer_id
                                    );
                                    ws_sender.send(Message::Close(None)).await?;
                                    break;
                                };

                                // Hand the newcomer everything the room already has.
                                let state = SyncMessage::sync_step2(
                                    Uuid::nil(),
                                    &sync_msg.session,
                                    room.replica.encode_state(),
                                );
                                ws_sender.send(Message::Binary(state.encode()?.into())).await?;

                                let _ = room.broadcast.broadcast_raw(Arc::new(bytes));
                                {
                                    let mut s = shared.stats.write().await;
                                    s.active_rooms = shared.rooms.room_count().await;
                                }
                                log::info!(
                                    "Peer {} ({}) joined session {}",
                                    info.name,
                                    info.peer_id,
                                    sync_msg.session
                                );

                                joined = Some(Joined {
                                    peer_id: info.peer_id,
                                    session: sync_msg.session,
                                    room,
                                    rx,
                                });
                            }

                            MessageType::Delta => {
                                let Some(j) = joined.as_ref() else {
                                    log::debug!("Delta before join from {addr}, dropped");
                                    continue;
                                };
                                if let Err(e) = j.room.replica.apply_update(&sync_msg.payload) {
                                    log::warn!("Rejected delta from {}: {e}", j.peer_id);
                                    continue;
                                }
                                j.room.broadcast.broadcast_raw(Arc::new(bytes));
                            }

                            MessageType::SyncStep1 => {
                                let Some(j) = joined.as_ref() else { continue };
                                match j.room.replica.diff_since(&sync_msg.payload) {
                                    Ok(diff) => {
                                        let response = SyncMessage::sync_step2(Uuid::nil(), &j.session, diff);
                                        ws_sender.send(Message::Binary(response.encode()?.into())).await?;
                                    }
                                    Err(e) => log::warn!("Bad state vector from {}: {e}", j.peer_id),
                                }
                            }

                            MessageType::Ping => {
                                let pong = SyncMessage::pong(sync_msg.peer_id);
                                ws_sender.send(Message::Binary(pong.encode()?.into())).await?;
                            }

                            other => {
                                log::debug!("Unhandled message type: {other:?}");
                            }
                        }
                    }

                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection closed from {addr}");
                        break;
                    }

                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }

                    Some(Err(e)) => {
                        log::error!("WebSocket error from {addr}: {e}");
                        break;
                    }

                    _ => {}
                }
            }

            msg = async {
                match joined.as_mut() {
                    Some(j) => j.rx.recv().await,
                    None => std::future::pending().await,
                }
            } => {
                match msg {
                    Ok(data) => {
                        // Don't echo back to sender
                        if let Ok(sync_msg) = SyncMessage::decode(&data) {
                            if joined.as_ref().map(|j| j.peer_id) == Some(sync_msg.peer_id) {
                                continue;
                            }
                        }
                        ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        if let Some(j) = joined.as_ref() {
                            log::warn!("Peer {} lagged by {n} messages", j.peer_id);
                            j.room.broadcast.record_lag(n);
                        }
                    }
                    Err(_) => break,
                }
            }
        }
    }

    if let Some(j) = joined {
        j.room.broadcast.remove_peer(&j.peer_id).await;
        let _ = j.room.broadcast.broadcast(&SyncMessage::peer_left(j.peer_id, &j.session));
        if shared.rooms.remove_if_empty(&j.session).await {
            log::info!("Session {} closed (no peers left)", j.session);
        }
    }

    let mut s = shared.stats.write().await;
    s.active_connections = s.active_connections.saturating_sub(1);
    s.active_rooms = shared.rooms.room_count().await;

    Ok(())
}

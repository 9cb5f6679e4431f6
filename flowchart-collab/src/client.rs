//! WebSocket client for the session relay.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - Delta send/receive as opaque yrs updates
//! - Offline queue for edits made while disconnected

use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    /// Update produced by a remote peer's local write
    RemoteDelta {
        peer_id: Uuid,
        clock: u64,
        update: Vec<u8>,
    },
    /// State handed over by the relay, on join or in answer to a state vector
    StateSynced(Vec<u8>),
    PeerJoined(PeerInfo),
    PeerLeft(Uuid),
}

/// Offline queue for edits made while disconnected.
///
/// Queued deltas are replayed on the next connect.
pub struct OfflineQueue {
    queue: VecDeque<(u64, Vec<u8>)>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue a delta for later replay. Returns false when full.
    pub fn enqueue(&mut self, clock: u64, payload: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back((clock, payload));
        true
    }

    pub fn drain(&mut self) -> Vec<(u64, Vec<u8>)> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|(_, p)| p.len()).sum()
    }
}

/// The sync client.
///
/// Owns one WebSocket connection to the relay for one session. Incoming
/// messages surface as [`SyncEvent`]s on the receiver returned by
/// [`SyncClient::take_event_rx`].
pub struct SyncClient {
    peer_info: PeerInfo,
    session: String,
    relay_url: String,

    state: Arc<RwLock<ConnectionState>>,

    /// Lamport clock stamped on outgoing deltas
    clock: Arc<RwLock<u64>>,

    offline_queue: Arc<Mutex<OfflineQueue>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,

    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,

    reader: Option<JoinHandle<()>>,
}

impl SyncClient {
    pub fn new(peer_info: PeerInfo, session: impl Into<String>, relay_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            peer_info,
            session: session.into(),
            relay_url: relay_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            clock: Arc::new(RwLock::new(0)),
            offline_queue: Arc::new(Mutex::new(OfflineQueue::new(10_000))),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            reader: None,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect to the relay and join the session.
    ///
    /// Spawns background tasks for reading and writing WebSocket messages.
    /// Deltas queued while offline are replayed right after the join.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.relay_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::Connect(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        let join = SyncMessage::peer_joined(&self.session, &self.peer_info)?;
        out_tx
            .send(join.encode()?)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        {
            let mut queue = self.offline_queue.lock().await;
            let queued = queue.drain();
            if !queued.is_empty() {
                log::info!("Replaying {} queued deltas", queued.len());
            }
            for (clock, payload) in queued {
                let msg = SyncMessage::delta(self.peer_info.peer_id, &self.session, clock, payload);
                out_tx
                    .send(msg.encode()?)
                    .await
                    .map_err(|_| ProtocolError::ConnectionClosed)?;
            }
        }

        self.outgoing_tx = Some(out_tx);
        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let peer_id = self.peer_info.peer_id;
        self.reader = Some(tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        let sync_msg = match SyncMessage::decode(&bytes) {
                            Ok(m) => m,
                            Err(e) => {
                                log::warn!("Dropping undecodable message: {e}");
                                continue;
                            }
                        };
                        // Skip our own messages
                        if sync_msg.peer_id == peer_id {
                            continue;
                        }

                        let event = match sync_msg.msg_type {
                            MessageType::Delta => Some(SyncEvent::RemoteDelta {
                                peer_id: sync_msg.peer_id,
                                clock: sync_msg.clock,
                                update: sync_msg.payload,
                            }),
                            MessageType::SyncStep2 => Some(SyncEvent::StateSynced(sync_msg.payload)),
                            MessageType::PeerJoined => sync_msg.peer_info().ok().map(SyncEvent::PeerJoined),
                            MessageType::PeerLeft => Some(SyncEvent::PeerLeft(sync_msg.peer_id)),
                            _ => None,
                        };

                        if let Some(evt) = event {
                            if event_tx.send(evt).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        }));

        log::info!("Joined session {} at {}", self.session, self.relay_url);
        Ok(())
    }

    /// Close the connection. Later deltas go to the offline queue.
    pub async fn disconnect(&mut self) {
        // Dropping the sender ends the writer task, which closes the socket.
        self.outgoing_tx = None;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Send a yrs update to the session.
    ///
    /// If disconnected, queues the update for later replay.
    pub async fn send_delta(&self, update: Vec<u8>) -> Result<(), ProtocolError> {
        let current_clock = {
            let mut clock = self.clock.write().await;
            *clock += 1;
            *clock
        };

        let tx = match (&self.outgoing_tx, *self.state.read().await) {
            (Some(tx), ConnectionState::Connected) => tx,
            _ => {
                let mut queue = self.offline_queue.lock().await;
                if !queue.enqueue(current_clock, update) {
                    return Err(ProtocolError::ConnectionClosed);
                }
                return Ok(());
            }
        };

        let msg = SyncMessage::delta(self.peer_info.peer_id, &self.session, current_clock, update);
        tx.send(msg.encode()?)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Ask the relay for everything missing from `state_vector`.
    pub async fn request_sync(&self, state_vector: Vec<u8>) -> Result<(), ProtocolError> {
        let msg = SyncMessage::sync_step1(self.peer_info.peer_id, &self.session, state_vector);
        self.send_raw(msg).await
    }

    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        self.send_raw(SyncMessage::ping(self.peer_info.peer_id)).await
    }

    async fn send_raw(&self, msg: SyncMessage) -> Result<(), ProtocolError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(msg.encode()?)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn peer_info(&self) -> &PeerInfo {
        &self.peer_info
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn relay_url(&self) -> &str {
        &self.relay_url
    }

    pub async fn clock(&self) -> u64 {
        *self.clock.read().await
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }
}

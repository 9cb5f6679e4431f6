//! A peer's membership in a live session.
//!
//! [`PeerSession`] owns the local replica and keeps it joined to the relay:
//!
//! ```text
//!   SharedDocument ──local update──► pump task ──► SyncClient ──► relay
//!   SharedDocument ◄──apply_update── inbound task ◄── SyncEvent ◄──┘
//! ```
//!
//! Failing to reach the relay is not an error: the session simply has no
//! peers, and local edits are queued for replay. The inbound task keeps
//! retrying with exponential backoff, both when the first connect fails and
//! when an established link drops. On every rejoin the replica pushes its
//! full state and asks the relay for what it missed.

use std::sync::Arc;
use std::time::Duration;

use flowchart_core::{DocumentError, Edge, Node, SharedDocument, SharedStore, Subscription};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::client::{ConnectionState, SyncClient, SyncEvent};
use crate::protocol::PeerInfo;

/// Session every client joins unless told otherwise.
pub const DEFAULT_SESSION: &str = "interactive-flowchart";

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket URL of the relay
    pub relay_url: String,
    pub session: String,
    pub peer_name: String,
    /// How long `open` waits for the relay to hand over existing state
    pub initial_sync_timeout: Duration,
    /// First delay before reconnecting; doubles per failed attempt
    pub reconnect_backoff: Duration,
    pub max_reconnect_backoff: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:9090".to_string(),
            session: DEFAULT_SESSION.to_string(),
            peer_name: "Anonymous".to_string(),
            initial_sync_timeout: Duration::from_secs(1),
            reconnect_backoff: Duration::from_millis(250),
            max_reconnect_backoff: Duration::from_secs(5),
        }
    }
}

pub struct PeerSession {
    doc: Arc<SharedDocument>,
    client: Arc<Mutex<SyncClient>>,
    peer_id: Uuid,
    session: String,
    pump: JoinHandle<()>,
    inbound: JoinHandle<()>,
}

impl PeerSession {
    /// Create a fresh replica and join `config.session` on the relay.
    pub async fn open(config: SessionConfig) -> Self {
        let doc = Arc::new(SharedDocument::new());
        let peer = PeerInfo::new(config.peer_name.as_str());
        let peer_id = peer.peer_id;
        let mut client = SyncClient::new(peer, config.session.as_str(), config.relay_url.as_str());
        let mut events = match client.take_event_rx() {
            Some(rx) => rx,
            None => mpsc::channel(1).1,
        };

        let online = match client.connect().await {
            Ok(()) => {
                let synced = tokio::time::timeout(config.initial_sync_timeout, async {
                    while let Some(event) = events.recv().await {
                        if let SyncEvent::StateSynced(state) = event {
                            return Some(state);
                        }
                    }
                    None
                })
                .await;
                match synced {
                    Ok(Some(state)) => {
                        if let Err(e) = doc.apply_update(&state) {
                            log::warn!("Discarding initial session state: {e}");
                        }
                    }
                    _ => log::warn!("Relay did not hand over session state in time"),
                }
                true
            }
            Err(e) => {
                log::warn!(
                    "Relay at {} unreachable, session {} is offline until it answers: {e}",
                    config.relay_url,
                    config.session
                );
                false
            }
        };

        let client = Arc::new(Mutex::new(client));

        let (update_tx, mut update_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        doc.on_local_update(move |update| {
            let _ = update_tx.send(update.to_vec());
        });

        let outgoing = client.clone();
        let pump = tokio::spawn(async move {
            while let Some(update) = update_rx.recv().await {
                if let Err(e) = outgoing.lock().await.send_delta(update).await {
                    log::warn!("Local update not queued, it goes out with the full state on rejoin: {e}");
                }
            }
        });

        let replica = doc.clone();
        let link = client.clone();
        let retry = config.clone();
        let inbound = tokio::spawn(async move {
            let mut online = online;
            loop {
                if !online {
                    rejoin(&link, &replica, &retry).await;
                    online = true;
                }
                let Some(event) = events.recv().await else { break };
                match event {
                    SyncEvent::RemoteDelta { update, .. } | SyncEvent::StateSynced(update) => {
                        if let Err(e) = replica.apply_update(&update) {
                            log::warn!("Rejected remote update: {e}");
                        }
                    }
                    SyncEvent::PeerJoined(info) => log::info!("Peer {} joined", info.name),
                    SyncEvent::PeerLeft(id) => log::info!("Peer {id} left"),
                    SyncEvent::Disconnected => {
                        log::warn!("Lost connection to relay, reconnecting");
                        online = false;
                    }
                    SyncEvent::Connected => {}
                }
            }
        });

        log::info!("Opened session {} as {peer_id}", config.session);
        Self {
            doc,
            client,
            peer_id,
            session: config.session,
            pump,
            inbound,
        }
    }

    /// Leave the session. The replica is discarded with `self`.
    pub async fn close(self) {
        self.client.lock().await.disconnect().await;
        log::info!("Closed session {}", self.session);
    }

    pub async fn is_connected(&self) -> bool {
        self.client.lock().await.connection_state().await == ConnectionState::Connected
    }

    pub fn document(&self) -> &Arc<SharedDocument> {
        &self.doc
    }

    pub fn peer_id(&self) -> Uuid {
        self.peer_id
    }

    pub fn session(&self) -> &str {
        &self.session
    }
}

/// Reconnect with exponential backoff until the relay accepts the join.
async fn rejoin(client: &Mutex<SyncClient>, doc: &SharedDocument, config: &SessionConfig) {
    let mut backoff = config.reconnect_backoff;
    loop {
        tokio::time::sleep(backoff).await;
        {
            let mut client = client.lock().await;
            match client.connect().await {
                Ok(()) => {
                    // Covers edits that overflowed the offline queue.
                    if let Err(e) = client.send_delta(doc.encode_state()).await {
                        log::warn!("Could not push local state after rejoin: {e}");
                    }
                    if let Err(e) = client.request_sync(doc.state_vector()).await {
                        log::warn!("Could not request missed updates: {e}");
                    }
                    log::info!("Rejoined session {}", config.session);
                    return;
                }
                Err(e) => log::debug!("Reconnect to {} failed: {e}", config.relay_url),
            }
        }
        backoff = (backoff * 2).min(config.max_reconnect_backoff);
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        self.pump.abort();
        self.inbound.abort();
    }
}

impl SharedStore for PeerSession {
    fn nodes(&self) -> Result<Option<Vec<Node>>, DocumentError> {
        self.doc.nodes()
    }

    fn edges(&self) -> Result<Option<Vec<Edge>>, DocumentError> {
        self.doc.edges()
    }

    fn set_nodes(&self, nodes: &[Node]) -> Result<(), DocumentError> {
        self.doc.set_nodes(nodes)
    }

    fn set_edges(&self, edges: &[Edge]) -> Result<(), DocumentError> {
        self.doc.set_edges(edges)
    }

    fn subscribe(&self, on_any_change: Box<dyn Fn() + Send + Sync>) -> Subscription {
        self.doc.subscribe(on_any_change)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowchart_core::Position;

    fn offline_config() -> SessionConfig {
        SessionConfig {
            relay_url: "ws://127.0.0.1:1".to_string(),
            ..SessionConfig::default()
        }
    }

    #[test]
    fn test_default_session_name() {
        let config = SessionConfig::default();
        assert_eq!(config.session, "interactive-flowchart");
        assert_eq!(config.relay_url, "ws://127.0.0.1:9090");
    }

    #[tokio::test]
    async fn test_unreachable_relay_leaves_session_usable() {
        let session = PeerSession::open(offline_config()).await;
        assert!(!session.is_connected().await);
        assert!(session.nodes().unwrap().is_none());

        let node = Node::new("n1".into(), "default", Position::new(50.0, 50.0), "N1");
        session.set_nodes(&[node.clone()]).unwrap();
        assert_eq!(session.nodes().unwrap(), Some(vec![node]));
        session.close().await;
    }

    #[tokio::test]
    async fn test_offline_edits_are_queued() {
        let session = PeerSession::open(offline_config()).await;
        session.set_edges(&[]).unwrap();

        let mut queued = 0;
        for _ in 0..50 {
            queued = session.client.lock().await.offline_queue_len().await;
            if queued > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(queued, 1);
    }
}

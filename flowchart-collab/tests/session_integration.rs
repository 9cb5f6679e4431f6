//! End-to-end tests: peer sessions joined through a real relay, driven by
//! reconciliation controllers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use flowchart_collab::controller::{BootstrapOutcome, ControllerConfig, ReconciliationController};
use flowchart_collab::persistence::{SnapshotPersistence, TransportError};
use flowchart_collab::server::{RelayConfig, RelayServer};
use flowchart_collab::session::{PeerSession, SessionConfig};
use flowchart_core::{
    Connection, GraphSnapshot, Node, NodeChange, Position, RenderState, SharedStore, SurfaceEvent,
};
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Duration};

/// In-memory stand-in for the `/data` endpoint that counts fetches.
#[derive(Default)]
struct CountingPersistence {
    saved: Mutex<GraphSnapshot>,
    fetches: AtomicUsize,
}

impl CountingPersistence {
    fn with(snapshot: GraphSnapshot) -> Arc<Self> {
        Arc::new(Self {
            saved: Mutex::new(snapshot),
            fetches: AtomicUsize::new(0),
        })
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl SnapshotPersistence for CountingPersistence {
    async fn fetch_snapshot(&self) -> Result<GraphSnapshot, TransportError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.saved.lock().unwrap().clone())
    }

    async fn push_snapshot(&self, snapshot: &GraphSnapshot) -> Result<String, TransportError> {
        *self.saved.lock().unwrap() = snapshot.clone();
        Ok("Data saved successfully".to_string())
    }
}

async fn start_relay() -> (String, Arc<RelayServer>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let relay = Arc::new(RelayServer::new(RelayConfig::default()));
    let serving = relay.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });
    (format!("ws://127.0.0.1:{port}"), relay)
}

async fn open(url: &str, name: &str) -> Arc<PeerSession> {
    Arc::new(
        PeerSession::open(SessionConfig {
            relay_url: url.to_string(),
            peer_name: name.to_string(),
            ..SessionConfig::default()
        })
        .await,
    )
}

type Controller = ReconciliationController<PeerSession, CountingPersistence>;

/// Spawn a controller's run loop; returns the controller and its event sender.
fn spawn_controller(
    session: Arc<PeerSession>,
    persistence: Arc<CountingPersistence>,
) -> (Arc<Controller>, mpsc::Sender<SurfaceEvent>) {
    let controller = Arc::new(ReconciliationController::new(
        session,
        persistence,
        ControllerConfig::default(),
    ));
    let (tx, rx) = mpsc::channel(16);
    let runner = controller.clone();
    tokio::spawn(async move { runner.run(rx).await });
    (controller, tx)
}

async fn wait_for<F>(rx: &mut watch::Receiver<RenderState>, pred: F) -> RenderState
where
    F: Fn(&RenderState) -> bool,
{
    timeout(Duration::from_secs(5), async {
        loop {
            {
                let state = rx.borrow_and_update();
                if pred(&state) {
                    return state.clone();
                }
            }
            rx.changed().await.unwrap();
        }
    })
    .await
    .expect("render state did not converge")
}

async fn wait_until_relay_has(relay: &RelayServer, id: &str) {
    timeout(Duration::from_secs(5), async {
        loop {
            if let Some(room) = relay.rooms().get("interactive-flowchart").await {
                if let Ok(Some(nodes)) = room.replica.nodes() {
                    if nodes.iter().any(|n| n.id.as_str() == id) {
                        return;
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("relay never saw the node")
}

fn n1() -> Node {
    Node::new("n1".into(), "default", Position::new(50.0, 50.0), "N1")
}

#[tokio::test]
async fn test_single_client_fetches_once_and_renders() {
    let (url, _relay) = start_relay().await;
    let saved = GraphSnapshot::grid(2, 2, 200.0);
    let persistence = CountingPersistence::with(saved.clone());

    let session = open(&url, "Solo").await;
    let (controller, _events) = spawn_controller(session, persistence.clone());
    let mut render = controller.render_state();

    let state = wait_for(&mut render, |s| s.nodes.len() == 4).await;
    assert_eq!(state.nodes, saved.nodes);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(persistence.fetches(), 1);
}

#[tokio::test]
async fn test_joining_peer_adopts_live_session_without_fetch() {
    let (url, relay) = start_relay().await;

    let session_a = open(&url, "A").await;
    let persistence_a = CountingPersistence::with(GraphSnapshot::default());
    let (controller_a, events_a) = spawn_controller(session_a, persistence_a.clone());
    let mut render_a = controller_a.render_state();

    events_a
        .send(SurfaceEvent::NodesChanged(vec![NodeChange::Add { item: n1() }]))
        .await
        .unwrap();
    wait_for(&mut render_a, |s| s.nodes.len() == 1).await;
    wait_until_relay_has(&relay, "n1").await;

    let session_b = open(&url, "B").await;
    let persistence_b = CountingPersistence::with(GraphSnapshot::grid(10, 10, 200.0));
    let controller_b = Arc::new(ReconciliationController::new(
        session_b,
        persistence_b.clone(),
        ControllerConfig::default(),
    ));
    assert_eq!(controller_b.bootstrap().await, BootstrapOutcome::Adopted);
    assert_eq!(persistence_b.fetches(), 0);

    let render_b = controller_b.render_state();
    let nodes = render_b.borrow().nodes.clone();
    assert_eq!(nodes, vec![n1()]);
}

#[tokio::test]
async fn test_edits_flow_both_ways() {
    let (url, relay) = start_relay().await;

    let session_a = open(&url, "A").await;
    let (controller_a, events_a) =
        spawn_controller(session_a.clone(), CountingPersistence::with(GraphSnapshot::default()));
    let mut render_a = controller_a.render_state();

    let b_node = Node::new("b".into(), "default", Position::new(300.0, 50.0), "B");
    events_a
        .send(SurfaceEvent::NodesChanged(vec![
            NodeChange::Add { item: n1() },
            NodeChange::Add { item: b_node },
        ]))
        .await
        .unwrap();
    wait_until_relay_has(&relay, "b").await;

    let session_b = open(&url, "B").await;
    let (controller_b, events_b) =
        spawn_controller(session_b.clone(), CountingPersistence::with(GraphSnapshot::default()));
    let mut render_b = controller_b.render_state();
    wait_for(&mut render_b, |s| s.nodes.len() == 2).await;

    events_b
        .send(SurfaceEvent::Connect(Connection::new("n1".into(), "b".into())))
        .await
        .unwrap();

    let state = wait_for(&mut render_a, |s| s.edges.len() == 1).await;
    assert_eq!(state.edges[0].kind.as_deref(), Some("smoothstep"));
    assert!(state.edges[0].animated);

    events_a
        .send(SurfaceEvent::NodesChanged(vec![NodeChange::Position {
            id: "b".into(),
            position: Some(Position::new(400.0, 80.0)),
            dragging: Some(false),
        }]))
        .await
        .unwrap();
    wait_for(&mut render_b, |s| {
        s.nodes.iter().any(|n| n.id.as_str() == "b" && n.position == Position::new(400.0, 80.0))
    })
    .await;

    assert_eq!(
        session_a.document().snapshot().unwrap(),
        session_b.document().snapshot().unwrap()
    );
}

#[tokio::test]
async fn test_offline_session_still_bootstraps() {
    let session = Arc::new(
        PeerSession::open(SessionConfig {
            relay_url: "ws://127.0.0.1:1".to_string(),
            ..SessionConfig::default()
        })
        .await,
    );
    let persistence = CountingPersistence::with(GraphSnapshot::new(vec![n1()], Vec::new()));
    let controller = ReconciliationController::new(session, persistence.clone(), ControllerConfig::default());

    assert_eq!(controller.bootstrap().await, BootstrapOutcome::Seeded);
    assert_eq!(persistence.fetches(), 1);
    assert_eq!(controller.render_state().borrow().nodes, vec![n1()]);
}

#[tokio::test]
async fn test_session_rejoins_once_relay_comes_up() {
    // Reserve a port, then leave it closed until the session is open.
    let addr = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap()
        .local_addr()
        .unwrap();
    let url = format!("ws://{addr}");

    let config = SessionConfig {
        relay_url: url.clone(),
        peer_name: "A".to_string(),
        reconnect_backoff: Duration::from_millis(50),
        max_reconnect_backoff: Duration::from_millis(200),
        ..SessionConfig::default()
    };
    let session_a = PeerSession::open(config).await;
    assert!(!session_a.is_connected().await);
    session_a.set_nodes(&[n1()]).unwrap();

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    let relay = Arc::new(RelayServer::new(RelayConfig::default()));
    let serving = relay.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });

    wait_until_relay_has(&relay, "n1").await;
    assert!(session_a.is_connected().await);

    let session_b = open(&url, "B").await;
    assert_eq!(session_b.nodes().unwrap(), Some(vec![n1()]));
}

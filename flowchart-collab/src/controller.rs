//! Reconciliation between local edits, the shared document and the saved
//! snapshot.
//!
//! ```text
//!   Bootstrapping ──grace──► Deciding ──nodes present──────────────► Live
//!                               │                                     ▲
//!                               └──absent/empty──► Fetching ──seed────┘
//! ```
//!
//! Once live, every deep-change notification triggers a full re-read of
//! the document which is folded into the render state. Local edits go
//! straight to the document in any phase.

use std::sync::Arc;
use std::time::Duration;

use flowchart_core::{
    add_edge, apply_edge_changes, apply_node_changes, connect_edge, node_from_drop, Edge, Node,
    NodeId, RenderState, SharedStore, Subscription, SurfaceEvent,
};
use tokio::sync::{mpsc, watch, Mutex};

use crate::error::SyncError;
use crate::persistence::SnapshotPersistence;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Time given to the session to deliver peer state before deciding
    /// whether to fetch.
    pub grace_period: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Bootstrapping,
    /// Adopt-or-fetch
    Deciding,
    Fetching,
    Live,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// The session already had nodes; nothing was fetched.
    Adopted,
    /// The saved snapshot was fetched and written to the document.
    Seeded,
    /// Fetching or seeding failed; the graph starts empty.
    Fallback,
}

pub struct ReconciliationController<S: SharedStore, P: SnapshotPersistence> {
    store: Arc<S>,
    persistence: Arc<P>,
    config: ControllerConfig,
    render: watch::Sender<RenderState>,
    phase: watch::Sender<Phase>,
    /// Marked on every deep change; many notifications collapse into one.
    changes: Mutex<watch::Receiver<()>>,
    _subscription: Subscription,
}

impl<S: SharedStore, P: SnapshotPersistence> ReconciliationController<S, P> {
    /// Subscribes to the store right away. Notifications that arrive before
    /// the controller is live are held until then.
    pub fn new(store: Arc<S>, persistence: Arc<P>, config: ControllerConfig) -> Self {
        let (tx, rx) = watch::channel(());
        let subscription = store.subscribe(Box::new(move || {
            tx.send_replace(());
        }));
        let (render, _) = watch::channel(RenderState::default());
        let (phase, _) = watch::channel(Phase::Bootstrapping);
        Self {
            store,
            persistence,
            config,
            render,
            phase,
            changes: Mutex::new(rx),
            _subscription: subscription,
        }
    }

    pub fn render_state(&self) -> watch::Receiver<RenderState> {
        self.render.subscribe()
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub fn watch_phase(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Wait out the grace period, then adopt the session's graph or seed it
    /// from the saved snapshot. Always ends live.
    pub async fn bootstrap(&self) -> BootstrapOutcome {
        self.phase.send_replace(Phase::Bootstrapping);
        tokio::time::sleep(self.config.grace_period).await;

        self.phase.send_replace(Phase::Deciding);
        let populated = match self.store.nodes() {
            Ok(Some(nodes)) => !nodes.is_empty(),
            Ok(None) => false,
            Err(e) => {
                log::warn!("Unreadable nodes in session, fetching instead: {e}");
                false
            }
        };

        let outcome = if populated {
            log::info!("Session already populated, adopting it");
            BootstrapOutcome::Adopted
        } else {
            self.phase.send_replace(Phase::Fetching);
            match self.seed().await {
                Ok(()) => BootstrapOutcome::Seeded,
                Err(e) => {
                    log::error!("Error fetching data: {e}");
                    BootstrapOutcome::Fallback
                }
            }
        };

        self.phase.send_replace(Phase::Live);
        self.project();
        outcome
    }

    async fn seed(&self) -> Result<(), SyncError> {
        let snapshot = self.persistence.fetch_snapshot().await?;
        log::info!(
            "Seeding session with {} nodes, {} edges",
            snapshot.nodes.len(),
            snapshot.edges.len()
        );
        self.store.set_nodes(&snapshot.nodes)?;
        self.store.set_edges(&snapshot.edges)?;
        Ok(())
    }

    /// Re-read the document and fold it into the render state. Returns
    /// whether the render state changed.
    pub fn project(&self) -> bool {
        let nodes = self.store.nodes().unwrap_or_else(|e| {
            log::warn!("Skipping unreadable nodes: {e}");
            None
        });
        let edges = self.store.edges().unwrap_or_else(|e| {
            log::warn!("Skipping unreadable edges: {e}");
            None
        });
        self.render.send_if_modified(|state| state.project(nodes, edges))
    }

    /// Apply a gesture from the surface to the document and show it.
    pub fn handle_event(&self, event: SurfaceEvent) -> Result<(), SyncError> {
        match event {
            SurfaceEvent::NodesChanged(changes) => {
                let next = apply_node_changes(&changes, &self.current_nodes()?);
                self.commit_nodes(next)
            }
            SurfaceEvent::EdgesChanged(changes) => {
                let next = apply_edge_changes(&changes, &self.current_edges()?);
                self.commit_edges(next)
            }
            SurfaceEvent::Connect(connection) => {
                let nodes = self.current_nodes()?;
                let known = |id: &NodeId| nodes.iter().any(|n| &n.id == id);
                if !known(&connection.source) || !known(&connection.target) {
                    return Err(SyncError::DanglingConnection {
                        from: connection.source,
                        to: connection.target,
                    });
                }
                let next = add_edge(connect_edge(&connection), &self.current_edges()?);
                self.commit_edges(next)
            }
            SurfaceEvent::Drop(drop) => {
                let Some(node) = node_from_drop(&drop) else {
                    log::debug!("Ignoring drop without a node type");
                    return Ok(());
                };
                let mut next = self.current_nodes()?;
                next.push(node);
                self.commit_nodes(next)
            }
        }
    }

    fn current_nodes(&self) -> Result<Vec<Node>, SyncError> {
        Ok(self
            .store
            .nodes()?
            .unwrap_or_else(|| self.render.borrow().nodes.clone()))
    }

    fn current_edges(&self) -> Result<Vec<Edge>, SyncError> {
        Ok(self
            .store
            .edges()?
            .unwrap_or_else(|| self.render.borrow().edges.clone()))
    }

    fn commit_nodes(&self, nodes: Vec<Node>) -> Result<(), SyncError> {
        self.store.set_nodes(&nodes)?;
        self.render.send_if_modified(|state| state.replace_nodes(nodes));
        Ok(())
    }

    fn commit_edges(&self, edges: Vec<Edge>) -> Result<(), SyncError> {
        self.store.set_edges(&edges)?;
        self.render.send_if_modified(|state| state.replace_edges(edges));
        Ok(())
    }

    /// Push what is currently displayed to the persistence endpoint.
    pub async fn save(&self) -> Result<String, SyncError> {
        let snapshot = self.render.borrow().snapshot();
        match self.persistence.push_snapshot(&snapshot).await {
            Ok(ack) => {
                log::info!("Saved {} nodes, {} edges: {ack}", snapshot.nodes.len(), snapshot.edges.len());
                Ok(ack)
            }
            Err(e) => {
                log::error!("Error saving data: {e}");
                Err(e.into())
            }
        }
    }

    /// Bootstrap, then keep the render state in sync with the document
    /// while applying surface events, until `events` closes.
    pub async fn run(&self, mut events: mpsc::Receiver<SurfaceEvent>) -> BootstrapOutcome {
        let mut events_open = true;

        let bootstrap = self.bootstrap();
        tokio::pin!(bootstrap);
        let outcome = loop {
            tokio::select! {
                outcome = &mut bootstrap => break outcome,
                event = events.recv(), if events_open => match event {
                    Some(event) => self.dispatch(event),
                    None => events_open = false,
                },
            }
        };

        let mut changes = self.changes.lock().await;
        changes.mark_unchanged();
        self.project();

        while events_open {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.dispatch(event),
                    None => events_open = false,
                },
                Ok(()) = changes.changed() => {
                    changes.mark_unchanged();
                    self.project();
                }
            }
        }

        log::debug!("Surface event channel closed, controller stopping");
        outcome
    }

    fn dispatch(&self, event: SurfaceEvent) {
        if let Err(e) = self.handle_event(event) {
            log::warn!("Rejected surface event: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::TransportError;
    use flowchart_core::{
        Connection, DropEvent, GraphSnapshot, NodeChange, Position, SharedDocument,
        SurfaceBounds, Viewport,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct MockPersistence {
        saved: std::sync::Mutex<GraphSnapshot>,
        fetches: AtomicUsize,
        pushes: AtomicUsize,
        fail: bool,
    }

    impl MockPersistence {
        fn with(snapshot: GraphSnapshot) -> Self {
            Self {
                saved: std::sync::Mutex::new(snapshot),
                ..Self::default()
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }
    }

    #[async_trait::async_trait]
    impl SnapshotPersistence for MockPersistence {
        async fn fetch_snapshot(&self) -> Result<GraphSnapshot, TransportError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(TransportError::Status {
                    status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
                    body: "boom".to_string(),
                });
            }
            Ok(self.saved.lock().unwrap().clone())
        }

        async fn push_snapshot(&self, snapshot: &GraphSnapshot) -> Result<String, TransportError> {
            self.pushes.fetch_add(1, Ordering::SeqCst);
            *self.saved.lock().unwrap() = snapshot.clone();
            Ok("Data saved successfully".to_string())
        }
    }

    fn quick() -> ControllerConfig {
        ControllerConfig {
            grace_period: Duration::from_millis(10),
        }
    }

    fn node(id: &str, x: f64, y: f64) -> Node {
        Node::new(id.into(), "default", Position::new(x, y), id)
    }

    fn controller(
        store: Arc<SharedDocument>,
        persistence: MockPersistence,
    ) -> (
        Arc<ReconciliationController<SharedDocument, MockPersistence>>,
        Arc<MockPersistence>,
    ) {
        let persistence = Arc::new(persistence);
        let c = ReconciliationController::new(store, persistence.clone(), quick());
        (Arc::new(c), persistence)
    }

    async fn wait_for<F>(rx: &mut watch::Receiver<RenderState>, pred: F) -> RenderState
    where
        F: Fn(&RenderState) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
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

    #[tokio::test]
    async fn test_pending_changes_collapse_into_one_flag() {
        let doc = Arc::new(SharedDocument::new());
        let (c, _) = controller(doc.clone(), MockPersistence::default());
        for i in 0..1000 {
            doc.set_nodes(&[node(&format!("n{i}"), 0.0, 0.0)]).unwrap();
        }

        let mut changes = c.changes.lock().await;
        assert!(changes.has_changed().unwrap());
        changes.mark_unchanged();
        assert!(!changes.has_changed().unwrap());
        drop(changes);

        doc.set_edges(&[]).unwrap();
        assert!(c.changes.lock().await.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_empty_session_fetches_exactly_once() {
        let saved = GraphSnapshot::new(vec![node("a", 0.0, 0.0), node("b", 10.0, 10.0)], Vec::new());
        let doc = Arc::new(SharedDocument::new());
        let (c, persistence) = controller(doc.clone(), MockPersistence::with(saved.clone()));

        assert_eq!(c.phase(), Phase::Bootstrapping);
        assert_eq!(c.bootstrap().await, BootstrapOutcome::Seeded);
        assert_eq!(c.phase(), Phase::Live);
        assert_eq!(persistence.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(c.render_state().borrow().nodes, saved.nodes);
        assert_eq!(doc.nodes().unwrap(), Some(saved.nodes));
        assert_eq!(doc.edges().unwrap(), Some(Vec::new()));
    }

    #[tokio::test]
    async fn test_populated_session_is_adopted_without_fetch() {
        let doc = Arc::new(SharedDocument::new());
        doc.set_nodes(&[node("n1", 50.0, 50.0)]).unwrap();
        let (c, persistence) = controller(doc, MockPersistence::default());

        assert_eq!(c.bootstrap().await, BootstrapOutcome::Adopted);
        assert_eq!(persistence.fetches.load(Ordering::SeqCst), 0);
        assert_eq!(c.render_state().borrow().nodes[0].id.as_str(), "n1");
    }

    #[tokio::test]
    async fn test_state_arriving_during_grace_is_adopted() {
        let doc = Arc::new(SharedDocument::new());
        let persistence = Arc::new(MockPersistence::default());
        let config = ControllerConfig {
            grace_period: Duration::from_millis(200),
        };
        let c = ReconciliationController::new(doc.clone(), persistence.clone(), config);

        let late = doc.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2)).await;
            late.set_nodes(&[node("n1", 50.0, 50.0)]).unwrap();
        });

        assert_eq!(c.bootstrap().await, BootstrapOutcome::Adopted);
        assert_eq!(persistence.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_node_list_counts_as_unpopulated() {
        let doc = Arc::new(SharedDocument::new());
        doc.set_nodes(&[]).unwrap();
        let (c, persistence) = controller(doc, MockPersistence::default());

        assert_eq!(c.bootstrap().await, BootstrapOutcome::Seeded);
        assert_eq!(persistence.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_falls_back_to_empty_live() {
        let doc = Arc::new(SharedDocument::new());
        let (c, _) = controller(doc.clone(), MockPersistence::failing());

        assert_eq!(c.bootstrap().await, BootstrapOutcome::Fallback);
        assert_eq!(c.phase(), Phase::Live);
        assert!(c.render_state().borrow().is_empty());
        assert!(doc.nodes().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remote_changes_reach_render_state() {
        let doc = Arc::new(SharedDocument::new());
        let remote = Arc::new(SharedDocument::new());
        let (to_doc, to_remote) = (doc.clone(), remote.clone());
        remote.on_local_update(move |u| to_doc.apply_update(u).unwrap());
        doc.on_local_update(move |u| to_remote.apply_update(u).unwrap());

        let (c, _) = controller(doc, MockPersistence::default());
        let mut render = c.render_state();
        let (events_tx, events_rx) = mpsc::channel(8);
        let runner = c.clone();
        let task = tokio::spawn(async move { runner.run(events_rx).await });

        let mut watch_phase = c.watch_phase();
        watch_phase.wait_for(|p| *p == Phase::Live).await.unwrap();

        remote.set_nodes(&[node("r1", 1.0, 2.0)]).unwrap();
        let state = wait_for(&mut render, |s| s.nodes.len() == 1).await;
        assert_eq!(state.nodes[0].id.as_str(), "r1");

        // An empty list from a peer never blanks what is shown.
        remote.set_nodes(&[]).unwrap();
        remote.set_nodes(&[node("r1", 1.0, 2.0), node("r2", 3.0, 4.0)]).unwrap();
        let state = wait_for(&mut render, |s| s.nodes.len() == 2).await;
        assert!(state.nodes.iter().any(|n| n.id.as_str() == "r2"));

        drop(events_tx);
        assert_eq!(task.await.unwrap(), BootstrapOutcome::Seeded);
    }

    #[tokio::test]
    async fn test_empty_remote_read_keeps_render_state() {
        let doc = Arc::new(SharedDocument::new());
        doc.set_nodes(&[node("a", 0.0, 0.0)]).unwrap();
        let (c, _) = controller(doc.clone(), MockPersistence::default());
        c.bootstrap().await;

        // A peer that has seen our state clears the list.
        let peer = SharedDocument::new();
        peer.apply_update(&doc.encode_state()).unwrap();
        peer.set_nodes(&[]).unwrap();
        doc.apply_update(&peer.diff_since(&doc.state_vector()).unwrap())
            .unwrap();
        assert_eq!(doc.nodes().unwrap(), Some(Vec::new()));

        assert!(!c.project());
        assert_eq!(c.render_state().borrow().nodes.len(), 1);
    }

    #[tokio::test]
    async fn test_drop_creates_labelled_node() {
        let doc = Arc::new(SharedDocument::new());
        let (c, _) = controller(doc.clone(), MockPersistence::default());
        c.bootstrap().await;

        c.handle_event(SurfaceEvent::Drop(DropEvent {
            kind: "default".to_string(),
            client_x: 120.0,
            client_y: 80.0,
            bounds: SurfaceBounds { left: 20.0, top: 20.0 },
            viewport: Viewport::default(),
        }))
        .unwrap();

        let nodes = doc.nodes().unwrap().unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].position, Position::new(100.0, 60.0));
        assert_eq!(nodes[0].label(), Some("Node"));
        assert_eq!(c.render_state().borrow().nodes, nodes);
    }

    #[tokio::test]
    async fn test_untyped_drop_is_ignored() {
        let doc = Arc::new(SharedDocument::new());
        let (c, _) = controller(doc.clone(), MockPersistence::default());

        c.handle_event(SurfaceEvent::Drop(DropEvent {
            kind: String::new(),
            client_x: 1.0,
            client_y: 1.0,
            bounds: SurfaceBounds::default(),
            viewport: Viewport::default(),
        }))
        .unwrap();
        assert!(doc.nodes().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_connect_applies_edge_policy() {
        let doc = Arc::new(SharedDocument::new());
        doc.set_nodes(&[node("a", 0.0, 0.0), node("b", 100.0, 0.0)]).unwrap();
        let (c, _) = controller(doc.clone(), MockPersistence::default());
        c.bootstrap().await;

        let connection = Connection::new("a".into(), "b".into());
        c.handle_event(SurfaceEvent::Connect(connection.clone())).unwrap();
        c.handle_event(SurfaceEvent::Connect(connection)).unwrap();

        let edges = doc.edges().unwrap().unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].kind.as_deref(), Some("smoothstep"));
        assert!(edges[0].animated);
        assert_eq!(c.render_state().borrow().edges, edges);
    }

    #[tokio::test]
    async fn test_connect_to_missing_node_is_rejected() {
        let doc = Arc::new(SharedDocument::new());
        doc.set_nodes(&[node("a", 0.0, 0.0)]).unwrap();
        let (c, _) = controller(doc.clone(), MockPersistence::default());

        let err = c
            .handle_event(SurfaceEvent::Connect(Connection::new("a".into(), "ghost".into())))
            .unwrap_err();
        assert!(matches!(err, SyncError::DanglingConnection { ref to, .. } if to == &NodeId::from("ghost")));
        assert!(doc.edges().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_node_removal_keeps_edges() {
        let doc = Arc::new(SharedDocument::new());
        doc.set_nodes(&[node("a", 0.0, 0.0), node("b", 1.0, 1.0)]).unwrap();
        let (c, _) = controller(doc.clone(), MockPersistence::default());
        c.bootstrap().await;
        c.handle_event(SurfaceEvent::Connect(Connection::new("a".into(), "b".into())))
            .unwrap();

        c.handle_event(SurfaceEvent::NodesChanged(vec![NodeChange::Remove { id: "b".into() }]))
            .unwrap();
        assert_eq!(doc.nodes().unwrap().unwrap().len(), 1);
        assert_eq!(doc.edges().unwrap().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_drag_moves_node() {
        let doc = Arc::new(SharedDocument::new());
        doc.set_nodes(&[node("a", 0.0, 0.0)]).unwrap();
        let (c, _) = controller(doc.clone(), MockPersistence::default());
        c.bootstrap().await;

        c.handle_event(SurfaceEvent::NodesChanged(vec![NodeChange::Position {
            id: "a".into(),
            position: Some(Position::new(30.0, 40.0)),
            dragging: Some(true),
        }]))
        .unwrap();

        let moved = &doc.nodes().unwrap().unwrap()[0];
        assert_eq!(moved.position, Position::new(30.0, 40.0));
        assert_eq!(moved.dragging, Some(true));
    }

    #[tokio::test]
    async fn test_save_pushes_render_state() {
        let doc = Arc::new(SharedDocument::new());
        doc.set_nodes(&[node("a", 0.0, 0.0)]).unwrap();
        let (c, persistence) = controller(doc, MockPersistence::default());
        c.bootstrap().await;

        assert_eq!(c.save().await.unwrap(), "Data saved successfully");
        assert_eq!(persistence.pushes.load(Ordering::SeqCst), 1);
        assert_eq!(persistence.saved.lock().unwrap().nodes[0].id.as_str(), "a");
    }

    #[tokio::test]
    async fn test_run_applies_events_until_channel_closes() {
        let doc = Arc::new(SharedDocument::new());
        let (c, _) = controller(doc.clone(), MockPersistence::default());
        let (tx, rx) = mpsc::channel(8);

        tx.send(SurfaceEvent::NodesChanged(vec![NodeChange::Add {
            item: node("early", 5.0, 5.0),
        }]))
        .await
        .unwrap();
        drop(tx);

        // The edit lands during the grace period, so the session is adopted.
        assert_eq!(c.run(rx).await, BootstrapOutcome::Adopted);
        assert_eq!(doc.nodes().unwrap().unwrap()[0].id.as_str(), "early");
    }
}

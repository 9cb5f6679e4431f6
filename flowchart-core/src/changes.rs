//! Change descriptors emitted by the diagram surface, and the policies that
//! turn gestures (connect, drop) into new graph entities.

use serde::{Deserialize, Serialize};

use crate::{Edge, EdgeId, Node, NodeId, Position};

/// Render style given to every edge created by a connect gesture.
pub const SMOOTH_STEP: &str = "smoothstep";

/// Label given to nodes created by a drop.
pub const DROPPED_NODE_LABEL: &str = "Node";

/// Incremental node change, as produced by the surface.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NodeChange {
    Position {
        id: NodeId,
        #[serde(default)]
        position: Option<Position>,
        #[serde(default)]
        dragging: Option<bool>,
    },
    Dimensions {
        id: NodeId,
        width: f64,
        height: f64,
    },
    Select {
        id: NodeId,
        selected: bool,
    },
    Remove {
        id: NodeId,
    },
    Add {
        item: Node,
    },
    Reset {
        item: Node,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EdgeChange {
    Select { id: EdgeId, selected: bool },
    Remove { id: EdgeId },
    Add { item: Edge },
    Reset { item: Edge },
}

/// A completed connect gesture.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub source: NodeId,
    pub target: NodeId,
    #[serde(default)]
    pub source_handle: Option<String>,
    #[serde(default)]
    pub target_handle: Option<String>,
}

impl Connection {
    pub fn new(source: NodeId, target: NodeId) -> Self {
        Self {
            source,
            target,
            source_handle: None,
            target_handle: None,
        }
    }
}

/// Screen-space top-left corner of the diagram surface.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SurfaceBounds {
    pub left: f64,
    pub top: f64,
}

/// Pan/zoom transform of the surface.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub x: f64,
    pub y: f64,
    pub zoom: f64,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            zoom: 1.0,
        }
    }
}

impl Viewport {
    /// Map a point relative to the surface's top-left corner into diagram
    /// coordinates.
    pub fn project(&self, x: f64, y: f64) -> Position {
        let zoom = if self.zoom > 0.0 { self.zoom } else { 1.0 };
        Position::new((x - self.x) / zoom, (y - self.y) / zoom)
    }
}

/// Pointer release of a dragged palette element over the surface.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DropEvent {
    /// Type tag carried by the drag payload. Empty means "not ours".
    pub kind: String,
    pub client_x: f64,
    pub client_y: f64,
    #[serde(default)]
    pub bounds: SurfaceBounds,
    #[serde(default)]
    pub viewport: Viewport,
}

/// Everything the surface can ask the controller to do.
#[derive(Clone, Debug, PartialEq)]
pub enum SurfaceEvent {
    NodesChanged(Vec<NodeChange>),
    EdgesChanged(Vec<EdgeChange>),
    Connect(Connection),
    Drop(DropEvent),
}

/// Apply a batch of node changes, returning the new list.
pub fn apply_node_changes(changes: &[NodeChange], nodes: &[Node]) -> Vec<Node> {
    let mut next = nodes.to_vec();
    for change in changes {
        match change {
            NodeChange::Position {
                id,
                position,
                dragging,
            } => {
                if let Some(node) = next.iter_mut().find(|n| &n.id == id) {
                    if let Some(p) = position {
                        node.position = *p;
                    }
                    if dragging.is_some() {
                        node.dragging = *dragging;
                    }
                }
            }
            NodeChange::Dimensions { id, width, height } => {
                if let Some(node) = next.iter_mut().find(|n| &n.id == id) {
                    node.width = Some(*width);
                    node.height = Some(*height);
                }
            }
            NodeChange::Select { id, selected } => {
                if let Some(node) = next.iter_mut().find(|n| &n.id == id) {
                    node.selected = Some(*selected);
                }
            }
            NodeChange::Remove { id } => next.retain(|n| &n.id != id),
            NodeChange::Add { item } => match next.iter_mut().find(|n| n.id == item.id) {
                Some(node) => *node = item.clone(),
                None => next.push(item.clone()),
            },
            NodeChange::Reset { item } => {
                if let Some(node) = next.iter_mut().find(|n| n.id == item.id) {
                    *node = item.clone();
                }
            }
        }
    }
    next
}

/// Apply a batch of edge changes, returning the new list.
///
/// Removing a node never reaches this function, so edges pointing at a
/// deleted node stay where they are.
pub fn apply_edge_changes(changes: &[EdgeChange], edges: &[Edge]) -> Vec<Edge> {
    let mut next = edges.to_vec();
    for change in changes {
        match change {
            EdgeChange::Select { id, selected } => {
                if let Some(edge) = next.iter_mut().find(|e| &e.id == id) {
                    edge.selected = Some(*selected);
                }
            }
            EdgeChange::Remove { id } => next.retain(|e| &e.id != id),
            EdgeChange::Add { item } => match next.iter_mut().find(|e| e.id == item.id) {
                Some(edge) => *edge = item.clone(),
                None => next.push(item.clone()),
            },
            EdgeChange::Reset { item } => {
                if let Some(edge) = next.iter_mut().find(|e| e.id == item.id) {
                    *edge = item.clone();
                }
            }
        }
    }
    next
}

/// Edge-creation policy: every connection becomes an animated smooth-step
/// edge, whatever the types of its endpoints.
pub fn connect_edge(connection: &Connection) -> Edge {
    let mut edge = Edge::new(
        EdgeId::generate(),
        connection.source.clone(),
        connection.target.clone(),
    );
    edge.source_handle = connection.source_handle.clone();
    edge.target_handle = connection.target_handle.clone();
    edge.kind = Some(SMOOTH_STEP.to_string());
    edge.animated = true;
    edge
}

/// Append `edge` unless an edge already joins the same handles.
pub fn add_edge(edge: Edge, edges: &[Edge]) -> Vec<Edge> {
    let exists = edges.iter().any(|e| {
        e.source == edge.source
            && e.target == edge.target
            && e.source_handle == edge.source_handle
            && e.target_handle == edge.target_handle
    });
    let mut next = edges.to_vec();
    if !exists {
        next.push(edge);
    }
    next
}

/// Node-creation-by-drop policy. Returns `None` for drops without a type
/// tag.
pub fn node_from_drop(event: &DropEvent) -> Option<Node> {
    if event.kind.is_empty() {
        return None;
    }
    let position = event.viewport.project(
        event.client_x - event.bounds.left,
        event.client_y - event.bounds.top,
    );
    Some(Node::new(
        NodeId::generate(),
        event.kind.clone(),
        position,
        DROPPED_NODE_LABEL,
    ))
}

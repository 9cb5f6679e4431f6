use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub mod changes;
pub mod document;
pub mod render;

pub use changes::{
    add_edge, apply_edge_changes, apply_node_changes, connect_edge, node_from_drop, Connection,
    DropEvent, EdgeChange, NodeChange, SurfaceBounds, SurfaceEvent, Viewport,
};
pub use document::{DocumentError, SharedDocument, SharedStore, Subscription, EDGES_KEY, NODES_KEY};
pub use render::RenderState;

/// Type tag given to nodes that don't carry one.
pub const DEFAULT_NODE_TYPE: &str = "default";

/// Stable node identity. Two nodes with the same id are the same entity.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    /// Fresh collision-resistant id; never reused after deletion.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EdgeId(pub String);

impl EdgeId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EdgeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for EdgeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Point in diagram-local coordinates.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

fn default_node_type() -> String {
    DEFAULT_NODE_TYPE.to_string()
}

/// A diagram node.
///
/// Fields the renderer attaches on its own (`width`, `selected`, ...) are
/// optional, and anything else a peer sends is kept in `extra` so that a
/// snapshot round-trips field for field.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: NodeId,
    #[serde(rename = "type", default = "default_node_type")]
    pub kind: String,
    #[serde(default)]
    pub position: Position,
    /// Opaque payload, normally `{ "label": ... }`.
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dragging: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Node {
    pub fn new(id: NodeId, kind: impl Into<String>, position: Position, label: &str) -> Self {
        Self {
            id,
            kind: kind.into(),
            position,
            data: serde_json::json!({ "label": label }),
            width: None,
            height: None,
            selected: None,
            dragging: None,
            extra: Map::new(),
        }
    }

    /// The `label` entry of the payload, if there is one.
    pub fn label(&self) -> Option<&str> {
        self.data.get("label").and_then(Value::as_str)
    }
}

/// A directed connection between two nodes.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: EdgeId,
    pub source: NodeId,
    pub target: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
    /// Render style tag, e.g. `"smoothstep"`.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub animated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Edge {
    pub fn new(id: EdgeId, source: NodeId, target: NodeId) -> Self {
        Self {
            id,
            source,
            target,
            source_handle: None,
            target_handle: None,
            kind: None,
            animated: false,
            selected: None,
            extra: Map::new(),
        }
    }
}

/// The whole diagram at one point in time: unit of persistence and of
/// wire transfer. Order is insertion order and must round-trip.
#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct GraphSnapshot {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl GraphSnapshot {
    pub fn new(nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        Self { nodes, edges }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }

    /// Deterministic placeholder grid: node `(i, j)` sits at
    /// `(i * spacing, j * spacing)`. No edges.
    pub fn grid(rows: usize, cols: usize, spacing: f64) -> Self {
        let mut nodes = Vec::with_capacity(rows * cols);
        for i in 0..rows {
            for j in 0..cols {
                nodes.push(Node::new(
                    NodeId(format!("node-{i}-{j}")),
                    DEFAULT_NODE_TYPE,
                    Position::new(i as f64 * spacing, j as f64 * spacing),
                    &format!("{i}-{j}"),
                ));
            }
        }
        Self {
            nodes,
            edges: Vec::new(),
        }
    }

    pub fn contains_node(&self, id: &NodeId) -> bool {
        self.nodes.iter().any(|n| &n.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique() {
        let a = NodeId::generate();
        let b = NodeId::generate();
        assert_ne!(a, b);
        assert_ne!(EdgeId::generate(), EdgeId::generate());
    }

    #[test]
    fn test_node_wire_shape() {
        let node = Node::new("n1".into(), "input", Position::new(50.0, 50.0), "Start");
        let json = serde_json::to_value(&node).unwrap();

        assert_eq!(json["id"], "n1");
        assert_eq!(json["type"], "input");
        assert_eq!(json["position"]["x"], 50.0);
        assert_eq!(json["data"]["label"], "Start");
        assert!(json.get("width").is_none());
    }

    #[test]
    fn test_node_keeps_unknown_fields() {
        let raw = serde_json::json!({
            "id": "a",
            "type": "output",
            "position": { "x": 1.0, "y": 2.0 },
            "data": { "label": "A" },
            "positionAbsolute": { "x": 1.0, "y": 2.0 },
            "style": { "border": "1px solid" }
        });
        let node: Node = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(node.extra.len(), 2);
        assert_eq!(serde_json::to_value(&node).unwrap(), raw);
    }

    #[test]
    fn test_node_defaults_missing_type() {
        let node: Node = serde_json::from_str(r#"{"id":"x","position":{"x":0,"y":0}}"#).unwrap();
        assert_eq!(node.kind, DEFAULT_NODE_TYPE);
        assert!(node.label().is_none());
    }

    #[test]
    fn test_edge_wire_shape() {
        let json = r#"{"id":"e1","source":"a","target":"b","sourceHandle":"s","type":"smoothstep","animated":true}"#;
        let edge: Edge = serde_json::from_str(json).unwrap();
        assert_eq!(edge.source, NodeId::from("a"));
        assert_eq!(edge.source_handle.as_deref(), Some("s"));
        assert_eq!(edge.kind.as_deref(), Some("smoothstep"));
        assert!(edge.animated);

        let plain: Edge = serde_json::from_str(r#"{"id":"e2","source":"a","target":"b"}"#).unwrap();
        assert!(!plain.animated);
        assert!(plain.kind.is_none());
    }

    #[test]
    fn test_grid_layout() {
        let grid = GraphSnapshot::grid(10, 10, 200.0);
        assert_eq!(grid.nodes.len(), 100);
        assert!(grid.edges.is_empty());

        for i in 0..10 {
            for j in 0..10 {
                let node = &grid.nodes[i * 10 + j];
                assert_eq!(node.position, Position::new(i as f64 * 200.0, j as f64 * 200.0));
            }
        }
        assert_eq!(grid, GraphSnapshot::grid(10, 10, 200.0));
    }

    #[test]
    fn test_empty_snapshot() {
        let snapshot = GraphSnapshot::default();
        assert!(snapshot.is_empty());
        assert_eq!(
            serde_json::to_string(&snapshot).unwrap(),
            r#"{"nodes":[],"edges":[]}"#
        );
    }
}

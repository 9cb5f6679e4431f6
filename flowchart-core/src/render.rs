//! Local render state: the projection of the shared document that the
//! diagram surface currently displays.

use crate::{Edge, GraphSnapshot, Node};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RenderState {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    /// Bumped every time a projection changes what is displayed.
    pub revision: u64,
}

impl RenderState {
    /// Fold a fresh read of the document into the render state.
    ///
    /// Each list is replaced only when the read is non-empty; an absent or
    /// empty list means "not yet populated" and leaves the current one alone.
    /// Returns whether anything visible changed.
    pub fn project(&mut self, nodes: Option<Vec<Node>>, edges: Option<Vec<Edge>>) -> bool {
        let mut changed = false;
        if let Some(nodes) = nodes.filter(|n| !n.is_empty()) {
            if nodes != self.nodes {
                self.nodes = nodes;
                changed = true;
            }
        }
        if let Some(edges) = edges.filter(|e| !e.is_empty()) {
            if edges != self.edges {
                self.edges = edges;
                changed = true;
            }
        }
        if changed {
            self.revision += 1;
        }
        changed
    }

    /// Show the result of a local edit. Unlike [`RenderState::project`] an
    /// empty list is accepted, since the user asked for it.
    pub fn replace_nodes(&mut self, nodes: Vec<Node>) -> bool {
        if nodes == self.nodes {
            return false;
        }
        self.nodes = nodes;
        self.revision += 1;
        true
    }

    pub fn replace_edges(&mut self, edges: Vec<Edge>) -> bool {
        if edges == self.edges {
            return false;
        }
        self.edges = edges;
        self.revision += 1;
        true
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot::new(self.nodes.clone(), self.edges.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }
}

use flowchart_core::{DocumentError, NodeId};

use crate::persistence::TransportError;
use crate::protocol::ProtocolError;

/// Errors surfaced by the reconciliation controller and peer sessions.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// A connect gesture named a node that is not in the graph.
    #[error("connection {from} -> {to} references a missing node")]
    DanglingConnection { from: NodeId, to: NodeId },
}

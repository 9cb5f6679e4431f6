//! Shared document store: one local replica of the session's yrs document.
//!
//! The root map holds two keys, `"nodes"` and `"edges"`. Each value is the
//! JSON encoding of the whole list, so every write is a full replace at the
//! key level and concurrent writers resolve last-writer-wins per key.
//!
//! ```text
//!   set_nodes() ──► yrs txn ──► encoded update ──► local update sinks ──► peers
//!                      │
//!                      └──► deep observers (no payload)
//!   apply_update(remote) ──► yrs txn ──► deep observers
//! ```

use std::sync::{Mutex, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;
use yrs::types::DeepObservable;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Any, Doc, Map, MapRef, Out, ReadTxn, StateVector, Transact, Update};

use crate::{Edge, GraphSnapshot, Node};

pub use yrs::Subscription;

/// Name of the root map every replica shares.
pub const ROOT_MAP: &str = "flowchart";
pub const NODES_KEY: &str = "nodes";
pub const EDGES_KEY: &str = "edges";

#[derive(Debug, Clone, thiserror::Error)]
pub enum DocumentError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("unexpected value under key {key:?}")]
    UnexpectedValue { key: String },
    #[error("failed to decode update: {0}")]
    Decode(String),
    #[error("failed to apply update: {0}")]
    Apply(String),
}

impl From<yrs::encoding::read::Error> for DocumentError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        DocumentError::Decode(e.to_string())
    }
}

/// Key-value contract the reconciliation controller is written against.
pub trait SharedStore: Send + Sync + 'static {
    fn nodes(&self) -> Result<Option<Vec<Node>>, DocumentError>;
    fn edges(&self) -> Result<Option<Vec<Edge>>, DocumentError>;
    /// Replace the whole node list.
    fn set_nodes(&self, nodes: &[Node]) -> Result<(), DocumentError>;
    /// Replace the whole edge list.
    fn set_edges(&self, edges: &[Edge]) -> Result<(), DocumentError>;
    /// Called after every local or remote mutation. Callers must re-read
    /// whatever they need; the callback must not touch the document itself.
    fn subscribe(&self, on_any_change: Box<dyn Fn() + Send + Sync>) -> Subscription;
}

type UpdateSink = Box<dyn Fn(&[u8]) + Send + Sync>;

pub struct SharedDocument {
    doc: Doc,
    root: MapRef,
    /// Serializes transactions on this replica.
    txn_lock: Mutex<()>,
    /// Receivers of updates produced by local writes.
    sinks: RwLock<Vec<UpdateSink>>,
}

impl SharedDocument {
    pub fn new() -> Self {
        let doc = Doc::new();
        let root = doc.get_or_insert_map(ROOT_MAP);
        Self {
            doc,
            root,
            txn_lock: Mutex::new(()),
            sinks: RwLock::new(Vec::new()),
        }
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, ()> {
        self.txn_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Read the list bound to `key`. `None` when the key was never written.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<Vec<T>>, DocumentError> {
        let _guard = self.guard();
        let txn = self.doc.transact();
        match self.root.get(&txn, key) {
            None | Some(Out::Any(Any::Null)) | Some(Out::Any(Any::Undefined)) => Ok(None),
            Some(Out::Any(Any::String(json))) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| DocumentError::Serialization(e.to_string())),
            Some(_) => Err(DocumentError::UnexpectedValue {
                key: key.to_string(),
            }),
        }
    }

    /// Replace the list bound to `key` and hand the resulting update to
    /// every local update sink.
    pub fn set<T: Serialize>(&self, key: &str, values: &[T]) -> Result<(), DocumentError> {
        let json = serde_json::to_string(values)
            .map_err(|e| DocumentError::Serialization(e.to_string()))?;

        let update = {
            let _guard = self.guard();
            let mut txn = self.doc.transact_mut();
            self.root.insert(&mut txn, key, json);
            txn.encode_update_v1()
            // txn commits here and deep observers fire
        };

        let sinks = self.sinks.read().unwrap_or_else(|e| e.into_inner());
        for sink in sinks.iter() {
            sink(&update);
        }
        log::trace!("set {key}: {} byte update", update.len());
        Ok(())
    }

    /// Both lists, absent keys read as empty.
    pub fn snapshot(&self) -> Result<GraphSnapshot, DocumentError> {
        Ok(GraphSnapshot {
            nodes: self.get(NODES_KEY)?.unwrap_or_default(),
            edges: self.get(EDGES_KEY)?.unwrap_or_default(),
        })
    }

    /// Deep observation of the root map.
    pub fn observe<F>(&self, on_any_change: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.root.observe_deep(move |_txn, _events| on_any_change())
    }

    /// Register a receiver for updates produced by local writes.
    pub fn on_local_update<F>(&self, sink: F)
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        let mut sinks = self.sinks.write().unwrap_or_else(|e| e.into_inner());
        sinks.push(Box::new(sink));
    }

    /// Merge an update received from a peer. Local update sinks are not
    /// invoked, so remote changes are never echoed back.
    pub fn apply_update(&self, update: &[u8]) -> Result<(), DocumentError> {
        let update = Update::decode_v1(update)?;
        let _guard = self.guard();
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| DocumentError::Apply(e.to_string()))
    }

    pub fn state_vector(&self) -> Vec<u8> {
        let _guard = self.guard();
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Everything this replica has that a peer with `state_vector` lacks.
    pub fn diff_since(&self, state_vector: &[u8]) -> Result<Vec<u8>, DocumentError> {
        let remote = StateVector::decode_v1(state_vector)?;
        let _guard = self.guard();
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&remote))
    }

    /// Full state as a single update.
    pub fn encode_state(&self) -> Vec<u8> {
        let _guard = self.guard();
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    pub fn is_populated(&self) -> bool {
        let _guard = self.guard();
        let txn = self.doc.transact();
        self.root.len(&txn) > 0
    }
}

impl Default for SharedDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedStore for SharedDocument {
    fn nodes(&self) -> Result<Option<Vec<Node>>, DocumentError> {
        self.get(NODES_KEY)
    }

    fn edges(&self) -> Result<Option<Vec<Edge>>, DocumentError> {
        self.get(EDGES_KEY)
    }

    fn set_nodes(&self, nodes: &[Node]) -> Result<(), DocumentError> {
        self.set(NODES_KEY, nodes)
    }

    fn set_edges(&self, edges: &[Edge]) -> Result<(), DocumentError> {
        self.set(EDGES_KEY, edges)
    }

    fn subscribe(&self, on_any_change: Box<dyn Fn() + Send + Sync>) -> Subscription {
        self.observe(on_any_change)
    }
}

//! The saved graph: one JSON file holding `{nodes, edges}`.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use flowchart_core::GraphSnapshot;
use tokio::sync::Mutex;

use crate::config::DefaultGraph;

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("snapshot file: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub struct SnapshotStore {
    path: PathBuf,
    default_graph: DefaultGraph,
    /// Serializes file access so a first read cannot race another into
    /// generating the default twice.
    lock: Mutex<()>,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>, default_graph: DefaultGraph) -> Self {
        Self {
            path: path.into(),
            default_graph,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the saved graph, creating and saving the default one first if
    /// there is no file yet.
    pub async fn load_or_init(&self) -> Result<GraphSnapshot, PersistenceError> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                log::info!("No snapshot at {}, creating {:?} graph", self.path.display(), self.default_graph);
                let snapshot = self.default_graph.build();
                self.write(&snapshot).await?;
                Ok(snapshot)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the saved graph.
    pub async fn save(&self, snapshot: &GraphSnapshot) -> Result<(), PersistenceError> {
        let _guard = self.lock.lock().await;
        self.write(snapshot).await
    }

    /// Callers hold `lock`.
    async fn write(&self, snapshot: &GraphSnapshot) -> Result<(), PersistenceError> {
        let json = serde_json::to_vec(snapshot)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        log::debug!(
            "Wrote {} nodes, {} edges to {}",
            snapshot.nodes.len(),
            snapshot.edges.len(),
            self.path.display()
        );
        Ok(())
    }
}

//! Backend for the flowchart editor: the snapshot endpoint and the session
//! relay, run side by side.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use flowchart_collab::RelayServer;
use tokio::net::TcpListener;
use tokio::task::JoinSet;

pub mod config;
pub mod http;
pub mod store;

use crate::config::ServerConfig;
use crate::http::AppState;
use crate::store::SnapshotStore;

/// The running HTTP endpoint and relay.
pub struct Server {
    http_addr: SocketAddr,
    relay_addr: SocketAddr,
    tasks: JoinSet<Result<()>>,
}

impl Server {
    /// Bind both listeners and start serving.
    pub async fn spawn(config: ServerConfig) -> Result<Self> {
        let store = SnapshotStore::new(config.store.path.clone(), config.store.default_graph);
        let app = http::create_app(AppState {
            store: Arc::new(store),
        });

        let http_listener = TcpListener::bind(config.http_addr()).await?;
        let http_addr = http_listener.local_addr()?;
        let relay_listener = TcpListener::bind(config.relay_addr()).await?;
        let relay_addr = relay_listener.local_addr()?;

        let mut tasks = JoinSet::new();
        tasks.spawn(async move {
            axum::serve(http_listener, app).await?;
            Ok(())
        });
        let relay = RelayServer::new(config.relay_config());
        tasks.spawn(async move { relay.serve(relay_listener).await.map_err(|e| anyhow!(e)) });

        log::info!("HTTP server listening on {http_addr}");
        log::info!("Snapshot file: {}", config.store.path.display());
        Ok(Self {
            http_addr,
            relay_addr,
            tasks,
        })
    }

    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    pub fn relay_addr(&self) -> SocketAddr {
        self.relay_addr
    }

    /// Wait until one of the listeners stops.
    pub async fn run_until_done(&mut self) -> Result<()> {
        match self.tasks.join_next().await {
            Some(res) => res?,
            None => Ok(()),
        }
    }

    pub async fn shutdown(mut self) -> Result<()> {
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}
        Ok(())
    }
}

/// Run with the given config until ctrl-c or a listener failure.
pub async fn run_with_config_until_ctrl_c(config: ServerConfig) -> Result<()> {
    let mut server = Server::spawn(config).await?;
    let result = tokio::select! {
        res = tokio::signal::ctrl_c() => {
            log::info!("Shutting down");
            res.map_err(Into::into)
        }
        res = server.run_until_done() => res,
    };
    server.shutdown().await?;
    result
}

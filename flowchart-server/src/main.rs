use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use flowchart_server::config::{DefaultGraph, ServerConfig};
use flowchart_server::run_with_config_until_ctrl_c;

#[derive(Parser, Debug)]
#[command(about = "Snapshot endpoint and session relay for the flowchart editor")]
struct Cli {
    /// Path to config file
    #[clap(short, long)]
    config: Option<PathBuf>,
    /// HTTP port
    #[clap(short, long)]
    port: Option<u16>,
    /// Session relay port
    #[clap(long)]
    relay_port: Option<u16>,
    /// Snapshot file
    #[clap(long)]
    data: Option<PathBuf>,
    /// Graph created on first load when no snapshot exists
    #[clap(long, value_enum)]
    default_graph: Option<DefaultGraph>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Cli::parse();

    let mut config = if let Some(path) = args.config {
        log::debug!("loading config from {path:?}");
        ServerConfig::load(path).await?
    } else {
        log::debug!("using default config");
        ServerConfig::default()
    };
    if let Some(port) = args.port {
        config.http.port = port;
    }
    if let Some(port) = args.relay_port {
        config.relay.port = port;
    }
    if let Some(data) = args.data {
        config.store.path = data;
    }
    if let Some(graph) = args.default_graph {
        config.store.default_graph = graph;
    }

    run_with_config_until_ctrl_c(config).await
}

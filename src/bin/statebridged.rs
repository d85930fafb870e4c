use std::collections::HashMap;
use std::sync::Arc;
use anyhow::{anyhow, Context as _};
use clap::Parser;
use log::info;
use statebridge::backend::{Connector, TcpConnector};
use statebridge::engine::MemEngine;
use statebridge::server::ComponentServer;
use statebridge::{BackendKind, StateStore, StateStoreAdapter};
use tokio::signal;

/// Pluggable state-store component daemon.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Backend dialect: wide-column (cassandra) or graph (nebula).
    #[arg(short, long, env = "STATEBRIDGE_BACKEND", default_value = "wide-column")]
    backend: BackendKind,

    /// Unix socket the host runtime connects to.
    #[arg(short, long, env = "STATEBRIDGE_SOCKET", default_value = "/tmp/statebridge.sock")]
    socket: String,

    /// Serve over TCP on this port instead of the Unix socket.
    #[arg(short, long, env = "STATEBRIDGE_PORT")]
    port: Option<u16>,

    /// Run statements on an in-process engine instead of a remote backend.
    #[arg(long)]
    embedded: bool,

    /// Snapshot directory for the embedded engine.
    #[arg(short, long, env = "STATEBRIDGE_DATA_DIR")]
    data_dir: Option<String>,

    /// Initialize at startup with these metadata pairs (key=value) instead of waiting for `init`.
    #[arg(short, long = "meta", value_parser = parse_pair)]
    meta: Vec<(String, String)>,
}

fn parse_pair(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let connector: Arc<dyn Connector> = if args.embedded {
        let engine = match &args.data_dir {
            Some(dir) => MemEngine::with_persistence(dir).with_context(|| format!("opening data dir {}", dir))?,
            None => MemEngine::new(),
        };
        Arc::new(engine)
    } else {
        Arc::new(TcpConnector::new())
    };

    let adapter = Arc::new(StateStoreAdapter::new(args.backend, connector));
    if !args.meta.is_empty() {
        let metadata: HashMap<String, String> = args.meta.into_iter().collect();
        adapter.init(metadata).await.map_err(|e| anyhow!("init failed: {}", e))?;
    }

    let server = ComponentServer::new(adapter.clone());
    info!("Starting {} state store component...", args.backend);

    let served = async {
        match args.port {
            Some(port) => server.listen_tcp(&format!("0.0.0.0:{}", port)).await,
            #[cfg(unix)]
            None => server.listen_unix(&args.socket).await,
            #[cfg(not(unix))]
            None => Err(statebridge::Error::Validation("Unix sockets are unavailable; pass --port".to_string())),
        }
    };

    tokio::select! {
        res = served => {
            res.context("component server failed")?;
        }
        _ = signal::ctrl_c() => {
            info!("Shutdown signal received. Closing backend connections...");
            adapter.close().await?;
            #[cfg(unix)]
            {
                if args.port.is_none() {
                    let _ = std::fs::remove_file(&args.socket);
                }
            }
        }
    }

    Ok(())
}

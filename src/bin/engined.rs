use anyhow::Context as _;
use clap::Parser;
use log::info;
use statebridge::engine::MemEngine;
use statebridge::server::EngineServer;
use tokio::signal;

/// Development engine: executes translated statements for remote adapters.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, env = "STATEBRIDGE_ENGINE_PORT", default_value_t = 9042)]
    port: u16,

    /// Snapshot directory. Without it the engine keeps data in memory only.
    #[arg(short, long, env = "STATEBRIDGE_DATA_DIR")]
    data_dir: Option<String>,

    #[arg(short, long, env = "STATEBRIDGE_ENGINE_USER")]
    username: Option<String>,

    #[arg(long, env = "STATEBRIDGE_ENGINE_PASSWORD", hide_env_values = true)]
    password: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let engine = match &args.data_dir {
        Some(dir) => MemEngine::with_persistence(dir).with_context(|| format!("opening data dir {}", dir))?,
        None => MemEngine::new(),
    };
    info!("Engine started. Loaded {} namespaces.", engine.namespaces().len());

    let mut server = EngineServer::new(engine);
    if let (Some(user), Some(pass)) = (&args.username, &args.password) {
        server = server.with_credentials(user, pass);
    }

    let addr = format!("0.0.0.0:{}", args.port);
    tokio::select! {
        res = server.listen(&addr) => {
            res.context("engine server failed")?;
        }
        _ = signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting.");
        }
    }

    Ok(())
}

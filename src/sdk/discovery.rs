use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use crate::engine::MemEngine;
use crate::sdk::{Client, Endpoint};
use crate::{BackendKind, Result, StateStore, StateStoreAdapter};

/// Env var naming a component server's TCP address.
pub const ADDR_ENV: &str = "STATEBRIDGE_ADDR";
/// Env var naming a component server's Unix socket.
pub const SOCKET_ENV: &str = "STATEBRIDGE_SOCKET";

/// The endpoint configured in the environment, if any.
pub fn endpoint_from_env() -> Option<Endpoint> {
    if let Ok(addr) = env::var(ADDR_ENV) {
        if !addr.is_empty() {
            return Some(Endpoint::Tcp(addr));
        }
    }
    #[cfg(unix)]
    {
        if let Ok(path) = env::var(SOCKET_ENV) {
            if !path.is_empty() {
                return Some(Endpoint::Unix(path.into()));
            }
        }
    }
    None
}

/// Opens a [`StateStore`] based on the environment.
///
/// 1. If `STATEBRIDGE_ADDR` or `STATEBRIDGE_SOCKET` points at a reachable
///    component server, returns a [`Client`] for it (**Remote Mode**). The
///    server is expected to be initialized already.
/// 2. Otherwise, starts an initialized [`StateStoreAdapter`] of the given
///    kind over an embedded [`MemEngine`] persisted in `data_dir`
///    (**Embedded Mode**).
///
/// # Examples
///
/// ```no_run
/// use statebridge::{sdk, BackendKind};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let store = sdk::new(BackendKind::Graph, "./data").await?;
///     Ok(())
/// }
/// ```
pub async fn new(backend: BackendKind, data_dir: &str) -> Result<Arc<dyn StateStore>> {
    if let Some(endpoint) = endpoint_from_env() {
        match Client::connect(endpoint.clone()).await {
            Ok(client) => return Ok(Arc::new(client)),
            Err(e) => log::warn!("Component at {} unavailable ({}); using the embedded engine", endpoint, e),
        }
    }

    let engine = MemEngine::with_persistence(data_dir)?;
    let adapter = StateStoreAdapter::new(backend, Arc::new(engine));
    let metadata = HashMap::from([("host".to_string(), "embedded".to_string())]);
    adapter.init(metadata).await?;
    Ok(Arc::new(adapter))
}

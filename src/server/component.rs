use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use crate::server::{Request, Response, WireError, DEFAULT_MAX_CONNECTIONS};
use crate::{Context, DeleteRequest, Error, Query, Result, SetRequest, StateStore};

/// Serves a [`StateStore`] to the hosting runtime, one JSON request per line.
pub struct ComponentServer {
    store: Arc<dyn StateStore>,
    semaphore: Arc<Semaphore>,
}

impl ComponentServer {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self::with_max_connections(store, DEFAULT_MAX_CONNECTIONS)
    }

    pub fn with_max_connections(store: Arc<dyn StateStore>, max_connections: usize) -> Self {
        Self {
            store,
            semaphore: Arc::new(Semaphore::new(max_connections)),
        }
    }

    pub async fn listen_tcp(&self, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("State store component listening on {} (TCP)", listener.local_addr()?);
        self.serve_tcp(listener).await
    }

    pub async fn serve_tcp(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (socket, _) = listener.accept().await?;
            self.spawn_connection(socket);
        }
    }

    /// Binds a Unix socket, replacing a stale socket file left by a previous run.
    #[cfg(unix)]
    pub async fn listen_unix<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let listener = tokio::net::UnixListener::bind(path)?;
        info!("State store component listening on {}", path.display());
        loop {
            let (socket, _) = listener.accept().await?;
            self.spawn_connection(socket);
        }
    }

    fn spawn_connection<S>(&self, socket: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let store = self.store.clone();
        let sem = self.semaphore.clone();

        tokio::spawn(async move {
            let _permit = match sem.try_acquire() {
                Ok(p) => p,
                Err(_) => {
                    warn!("Server busy: too many concurrent connections. Rejecting...");
                    let mut socket = socket;
                    let _ = socket.shutdown().await;
                    return;
                }
            };

            if let Err(e) = handle_connection(socket, store).await {
                error!("Connection error: {}", e);
            }
        });
    }
}

/// Answers requests on one connection until the peer hangs up.
pub async fn handle_connection<S>(socket: S, store: Arc<dyn StateStore>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(socket);
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response: Response = match serde_json::from_str::<Request>(trimmed) {
            Ok(request) => {
                debug!("-> {}", request.method);
                dispatch(store.as_ref(), request).await.into()
            }
            Err(e) => Response::Error(WireError::from(&Error::Validation(format!("malformed request: {}", e)))),
        };

        let mut out = serde_json::to_string(&response)?;
        out.push('\n');
        writer.write_all(out.as_bytes()).await?;
    }
    Ok(())
}

#[derive(Deserialize)]
struct InitParams {
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Deserialize)]
struct KeyParams {
    key: String,
}

#[derive(Deserialize)]
struct KeysParams {
    keys: Vec<String>,
}

#[derive(Deserialize)]
struct ItemsParams<T> {
    items: Vec<T>,
}

fn params<T: DeserializeOwned>(raw: Value) -> Result<T> {
    let raw = if raw.is_null() { json!({}) } else { raw };
    serde_json::from_value(raw).map_err(|e| Error::Validation(format!("invalid params: {}", e)))
}

/// Runs one request against the store.
pub async fn dispatch(store: &dyn StateStore, request: Request) -> Result<Value> {
    let ctx = match request.timeout_ms {
        Some(ms) => Context::with_timeout(Duration::from_millis(ms)),
        None => Context::background(),
    };

    match request.method.as_str() {
        "init" => {
            let p: InitParams = params(request.params)?;
            store.init(p.metadata).await?;
            Ok(Value::Null)
        }
        "features" => Ok(json!(store.features().await?.names())),
        "get" => {
            let p: KeyParams = params(request.params)?;
            Ok(serde_json::to_value(store.get(&ctx, &p.key).await?)?)
        }
        "set" => {
            let req: SetRequest = params(request.params)?;
            store.set(&ctx, req).await?;
            Ok(Value::Null)
        }
        "delete" => {
            let req: DeleteRequest = params(request.params)?;
            store.delete(&ctx, req).await?;
            Ok(Value::Null)
        }
        "bulk_get" => {
            let p: KeysParams = params(request.params)?;
            Ok(serde_json::to_value(store.bulk_get(&ctx, p.keys).await?)?)
        }
        "bulk_set" => {
            let p: ItemsParams<SetRequest> = params(request.params)?;
            Ok(serde_json::to_value(store.bulk_set(&ctx, p.items).await?)?)
        }
        "bulk_delete" => {
            let p: ItemsParams<DeleteRequest> = params(request.params)?;
            Ok(serde_json::to_value(store.bulk_delete(&ctx, p.items).await?)?)
        }
        "query" => {
            let query: Query = params(request.params)?;
            Ok(serde_json::to_value(store.query(&ctx, query).await?)?)
        }
        "ping" => {
            store.ping(&ctx).await?;
            Ok(json!("PONG"))
        }
        "close" => {
            store.close().await?;
            Ok(Value::Null)
        }
        other => Err(Error::Validation(format!("unknown method '{}'", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;
    use crate::engine::MemEngine;
    use crate::StateStoreAdapter;

    fn store() -> Arc<dyn StateStore> {
        Arc::new(StateStoreAdapter::new(BackendKind::Graph, Arc::new(MemEngine::new())))
    }

    fn request(method: &str, params: Value) -> Request {
        Request { method: method.to_string(), params, timeout_ms: None }
    }

    #[tokio::test]
    async fn test_dispatch_flow() {
        let store = store();
        let err = dispatch(store.as_ref(), request("get", json!({ "key": "k" }))).await.unwrap_err();
        assert!(matches!(err, Error::NotInitialized));

        dispatch(store.as_ref(), request("init", json!({ "metadata": { "host": "memory" } })))
            .await
            .unwrap();
        dispatch(store.as_ref(), request("set", json!({ "key": "k", "value": { "a": 1 } })))
            .await
            .unwrap();
        let got = dispatch(store.as_ref(), request("get", json!({ "key": "k" }))).await.unwrap();
        assert_eq!(got["value"], json!({ "a": 1 }));
        assert!(got["etag"].is_string());

        let missing = dispatch(store.as_ref(), request("get", json!({ "key": "nope" }))).await.unwrap();
        assert!(missing.is_null());

        let features = dispatch(store.as_ref(), request("features", Value::Null)).await.unwrap();
        assert_eq!(features, json!(["ETAG", "QUERY_API"]));

        let pong = dispatch(store.as_ref(), request("ping", Value::Null)).await.unwrap();
        assert_eq!(pong, json!("PONG"));

        let all = dispatch(store.as_ref(), request("query", Value::Null)).await.unwrap();
        assert_eq!(all["results"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_requests_without_timeout_use_op_timeout() {
        let adapter = Arc::new(StateStoreAdapter::new(BackendKind::Graph, Arc::new(MemEngine::new())));
        adapter
            .init(
                [("host", "memory"), ("poolSize", "1"), ("opTimeoutMs", "100")]
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            )
            .await
            .unwrap();
        let pool = adapter.pool().unwrap();
        let _held = pool.acquire(&Context::background()).await.unwrap();

        let store: Arc<dyn StateStore> = adapter.clone();
        for req in [
            request("get", json!({ "key": "k" })),
            request("set", json!({ "key": "k", "value": 1 })),
            request("bulk_get", json!({ "keys": ["a", "b"] })),
        ] {
            let method = req.method.clone();
            let res = tokio::time::timeout(Duration::from_secs(2), dispatch(store.as_ref(), req))
                .await
                .unwrap_or_else(|_| panic!("{} blocked on an exhausted pool", method));
            assert!(matches!(res, Err(Error::Timeout(_))), "{}: {:?}", method, res);
        }
    }

    #[tokio::test]
    async fn test_bad_requests_are_validation_errors() {
        let store = store();
        let err = dispatch(store.as_ref(), request("explode", Value::Null)).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        let err = dispatch(store.as_ref(), request("get", json!({ "nokey": 1 }))).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}

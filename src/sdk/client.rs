use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use async_trait::async_trait;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use crate::server::{Request, Response};
use crate::{
    BulkGetItem, BulkOutcome, Context, DeleteRequest, Error, Features, Query, QueryResponse, Result, SetRequest,
    StateEntry, StateStore,
};

const MAX_ATTEMPTS: u32 = 3;

/// Where a component server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(String),
    #[cfg(unix)]
    Unix(PathBuf),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "{}", addr),
            #[cfg(unix)]
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

type BoxedReader = BufReader<Box<dyn AsyncRead + Send + Unpin>>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct ClientInner {
    reader: BoxedReader,
    writer: BoxedWriter,
}

impl ClientInner {
    async fn round_trip(&mut self, line: &str) -> Result<Response> {
        self.writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| Error::Connection(format!("write failed: {}", e)))?;

        let mut resp = String::new();
        match self.reader.read_line(&mut resp).await {
            Ok(0) => Err(Error::Connection("connection closed by server".to_string())),
            Ok(_) => serde_json::from_str(resp.trim())
                .map_err(|e| Error::Internal(format!("malformed response: {}", e))),
            Err(e) => Err(Error::Connection(format!("read failed: {}", e))),
        }
    }
}

/// A remote [`StateStore`] speaking the component protocol.
///
/// The connection is re-established on demand. Calls that are safe to repeat
/// (reads, `features`, `ping`) are attempted up to three times; writes are sent
/// once, since a lost reply leaves their outcome unknown.
pub struct Client {
    endpoint: Endpoint,
    inner: Mutex<Option<ClientInner>>,
}

impl Client {
    pub async fn connect(endpoint: Endpoint) -> Result<Self> {
        let inner = Client::connect_inner(&endpoint).await?;
        Ok(Self {
            endpoint,
            inner: Mutex::new(Some(inner)),
        })
    }

    /// Connects over TCP to `host:port`.
    pub async fn connect_tcp(addr: &str) -> Result<Self> {
        Client::connect(Endpoint::Tcp(addr.to_string())).await
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn connect_inner(endpoint: &Endpoint) -> Result<ClientInner> {
        let unreachable = |e: std::io::Error| Error::Connection(format!("cannot reach {}: {}", endpoint, e));
        let (reader, writer): (Box<dyn AsyncRead + Send + Unpin>, BoxedWriter) = match endpoint {
            Endpoint::Tcp(addr) => {
                let (r, w) = TcpStream::connect(addr).await.map_err(unreachable)?.into_split();
                (Box::new(r), Box::new(w))
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                let (r, w) = tokio::net::UnixStream::connect(path).await.map_err(unreachable)?.into_split();
                (Box::new(r), Box::new(w))
            }
        };
        Ok(ClientInner {
            reader: BufReader::new(reader),
            writer,
        })
    }

    async fn call(&self, ctx: &Context, method: &str, params: Value, idempotent: bool) -> Result<Value> {
        let request = Request {
            method: method.to_string(),
            params,
            timeout_ms: ctx.remaining().map(|d| d.as_millis() as u64),
        };
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');

        let attempts = if idempotent { MAX_ATTEMPTS } else { 1 };
        let mut inner_guard = self.inner.lock().await;
        let mut last_err = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
            }
            if inner_guard.is_none() {
                match Client::connect_inner(&self.endpoint).await {
                    Ok(inner) => *inner_guard = Some(inner),
                    Err(e) => {
                        last_err = Some(e);
                        continue;
                    }
                }
            }
            let Some(inner) = inner_guard.as_mut() else {
                continue;
            };

            let res = tokio::select! {
                biased;
                reason = ctx.done() => Err(reason),
                res = inner.round_trip(&line) => Ok(res),
            };
            let res = match res {
                Ok(res) => res,
                Err(reason) => {
                    // The reply may still arrive; this connection can no longer be trusted.
                    *inner_guard = None;
                    return Err(Error::Timeout(format!("{} waiting for {}", reason, method)));
                }
            };

            match res {
                Ok(Response::Ok(value)) => return Ok(value),
                Ok(Response::Error(wire)) => return Err(wire.into_error()),
                Err(e) => {
                    warn!("{} to {} failed (attempt {}/{}): {}", method, self.endpoint, attempt + 1, attempts, e);
                    *inner_guard = None;
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| Error::Connection(format!("{} failed after {} attempts", method, attempts))))
    }

    /// Reads a key and decodes its value into `T`.
    pub async fn get_as<T: DeserializeOwned>(&self, ctx: &Context, key: &str) -> Result<Option<T>> {
        match self.get(ctx, key).await? {
            Some(entry) => Ok(Some(serde_json::from_value(entry.value)?)),
            None => Ok(None),
        }
    }

    /// Encodes `value` as JSON and writes it unconditionally.
    pub async fn set_as<T: Serialize>(&self, ctx: &Context, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.set(ctx, SetRequest { key: key.to_string(), value, etag: None }).await
    }
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| Error::Internal(format!("unexpected response shape: {}", e)))
}

#[async_trait]
impl StateStore for Client {
    async fn init(&self, metadata: HashMap<String, String>) -> Result<()> {
        self.call(&Context::background(), "init", json!({ "metadata": metadata }), false).await?;
        Ok(())
    }

    async fn features(&self) -> Result<Features> {
        let names: Vec<String> = decode(self.call(&Context::background(), "features", Value::Null, true).await?)?;
        Ok(Features::from_names(&names))
    }

    async fn get(&self, ctx: &Context, key: &str) -> Result<Option<StateEntry>> {
        decode(self.call(ctx, "get", json!({ "key": key }), true).await?)
    }

    async fn set(&self, ctx: &Context, req: SetRequest) -> Result<()> {
        self.call(ctx, "set", serde_json::to_value(req)?, false).await?;
        Ok(())
    }

    async fn delete(&self, ctx: &Context, req: DeleteRequest) -> Result<()> {
        self.call(ctx, "delete", serde_json::to_value(req)?, false).await?;
        Ok(())
    }

    async fn bulk_get(&self, ctx: &Context, keys: Vec<String>) -> Result<Vec<BulkGetItem>> {
        decode(self.call(ctx, "bulk_get", json!({ "keys": keys }), true).await?)
    }

    async fn bulk_set(&self, ctx: &Context, items: Vec<SetRequest>) -> Result<BulkOutcome> {
        decode(self.call(ctx, "bulk_set", json!({ "items": items }), false).await?)
    }

    async fn bulk_delete(&self, ctx: &Context, items: Vec<DeleteRequest>) -> Result<BulkOutcome> {
        decode(self.call(ctx, "bulk_delete", json!({ "items": items }), false).await?)
    }

    async fn query(&self, ctx: &Context, query: Query) -> Result<QueryResponse> {
        decode(self.call(ctx, "query", serde_json::to_value(query)?, true).await?)
    }

    async fn ping(&self, ctx: &Context) -> Result<()> {
        let pong = self.call(ctx, "ping", Value::Null, true).await?;
        debug!("ping {}: {}", self.endpoint, pong);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.call(&Context::background(), "close", Value::Null, true).await?;
        *self.inner.lock().await = None;
        Ok(())
    }
}

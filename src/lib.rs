//! Statebridge is a pluggable state-store component.
//!
//! It exposes a fixed key-value operation set (`Init`, `Features`, `Get`, `Set`,
//! `Delete`, the bulk variants and `Query`) and translates every call into the
//! statement language of a wide-column (CQL) or graph (nGQL) backend.
//!
//! ## Core Components
//! - [`translate`]: Pure statement builders, one per backend dialect.
//! - [`pool`]: Bounded connection pool with scoped leases.
//! - [`executor`]: Runs statements with timeouts, bounded retries and error normalization.
//! - [`adapter`]: The [`StateStore`] façade tying the pieces together.
//! - [`engine`]: An embedded development engine that executes translated statements in-process.
//! - [`server`] / [`sdk`]: The local RPC surface and its client.

pub mod adapter;
pub mod backend;
pub mod config;
pub mod context;
pub mod engine;
pub mod executor;
pub mod pool;
pub mod query;
pub mod sdk;
pub mod server;
pub mod translate;

pub use adapter::StateStoreAdapter;
pub use config::{BackendKind, StoreConfig};
pub use context::Context;
pub use query::{Query, QueryFilter};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Errors returned by the state store.
///
/// Backend-specific failures are folded into this taxonomy by the
/// [`executor`]; callers never see a raw driver error.
#[derive(Error, Debug)]
pub enum Error {
    /// The request was malformed. Never retried.
    #[error("validation error: {0}")]
    Validation(String),
    /// The key does not exist. Only surfaced where absence is an error to the caller.
    #[error("key not found: {0}")]
    NotFound(String),
    /// The supplied etag does not match the stored one.
    #[error("etag mismatch for key {key}: expected {expected:?}, actual {actual:?}")]
    Conflict {
        key: String,
        expected: Option<String>,
        actual: Option<String>,
    },
    /// Transport-level failure talking to the backend.
    #[error("connection error: {0}")]
    Connection(String),
    /// The operation exceeded its deadline or its context was cancelled.
    #[error("timeout: {0}")]
    Timeout(String),
    /// The query shape cannot be expressed by the configured backend.
    #[error("unsupported query: {0}")]
    UnsupportedQuery(String),
    /// The backend answered with something that could not be interpreted.
    #[error("internal error: {0}")]
    Internal(String),
    /// An operation was attempted before `init`.
    #[error("state store is not initialized")]
    NotInitialized,
    /// An operation was attempted after `close`.
    #[error("state store is closed")]
    Closed,
    /// An I/O error occurred during persistence or network communication.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Error during JSON serialization or deserialization.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Stable identifier used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::NotFound(_) => "not_found",
            Error::Conflict { .. } => "conflict",
            Error::Connection(_) => "connection",
            Error::Timeout(_) => "timeout",
            Error::UnsupportedQuery(_) => "unsupported_query",
            Error::Internal(_) => "internal",
            Error::NotInitialized => "not_initialized",
            Error::Closed => "closed",
            Error::Io(_) => "io",
            Error::Serialization(_) => "serialization",
        }
    }
}

/// A specialized Result type for state store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Values are JSON documents; raw payloads travel as JSON strings.
pub type Value = serde_json::Value;

/// A stored entry as read back from the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEntry {
    pub key: String,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetRequest {
    pub key: String,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

/// One result per requested key in a bulk get.
///
/// `error` is only set when reading this particular key failed; an absent key
/// is `found: false` with no error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkGetItem {
    pub key: String,
    pub found: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkFailure {
    pub key: String,
    pub kind: String,
    pub message: String,
}

/// Per-key outcome of a bulk write. Nothing is rolled back on partial failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkOutcome {
    pub succeeded: Vec<String>,
    pub failed: Vec<BulkFailure>,
}

impl BulkOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryItem {
    pub key: String,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub results: Vec<QueryItem>,
    /// Continuation token for the next page, when the backend can resume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Capabilities of the configured backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Features {
    /// Etag-guarded writes are enforced by the backend.
    pub etag: bool,
    /// Unconditional bulk writes are applied as one atomic batch.
    pub transactional: bool,
    /// `query` is available.
    pub query_api: bool,
}

impl Features {
    /// Feature names in the form the hosting runtime expects.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.etag {
            names.push("ETAG");
        }
        if self.transactional {
            names.push("TRANSACTIONAL");
        }
        if self.query_api {
            names.push("QUERY_API");
        }
        names
    }

    /// Inverse of [`Features::names`]. Unknown names are ignored.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Self {
        let mut features = Features::default();
        for name in names {
            match name.as_ref() {
                "ETAG" => features.etag = true,
                "TRANSACTIONAL" => features.transactional = true,
                "QUERY_API" => features.query_api = true,
                _ => {}
            }
        }
        features
    }
}

/// The operation set a state-store component exposes to its host.
///
/// Every operation except [`StateStore::init`] fails with
/// [`Error::NotInitialized`] before initialization and [`Error::Closed`]
/// after [`StateStore::close`].
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Parses the metadata, connects to the backend and ensures the schema exists.
    async fn init(&self, metadata: HashMap<String, String>) -> Result<()>;
    /// Reports what the configured backend supports.
    async fn features(&self) -> Result<Features>;
    /// Returns `None` for a missing key; absence is not an error.
    async fn get(&self, ctx: &Context, key: &str) -> Result<Option<StateEntry>>;
    /// Upserts a value, guarded by `etag` when one is supplied.
    async fn set(&self, ctx: &Context, req: SetRequest) -> Result<()>;
    /// Removes a key. Deleting an absent key without an etag succeeds.
    async fn delete(&self, ctx: &Context, req: DeleteRequest) -> Result<()>;
    /// Returns exactly one item per requested key, in request order.
    async fn bulk_get(&self, ctx: &Context, keys: Vec<String>) -> Result<Vec<BulkGetItem>>;
    async fn bulk_set(&self, ctx: &Context, items: Vec<SetRequest>) -> Result<BulkOutcome>;
    async fn bulk_delete(&self, ctx: &Context, items: Vec<DeleteRequest>) -> Result<BulkOutcome>;
    async fn query(&self, ctx: &Context, query: Query) -> Result<QueryResponse>;
    /// Health probe: succeeds only while a live backend connection can be obtained.
    async fn ping(&self, ctx: &Context) -> Result<()>;
    /// Releases every backend connection. Idempotent.
    async fn close(&self) -> Result<()>;
}

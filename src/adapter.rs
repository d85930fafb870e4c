//! The state-store façade.
//!
//! [`StateStoreAdapter`] owns the lifecycle (`Uninitialized -> Initialized ->
//! Closed`) and drives Translator -> Connection Pool -> Executor for every
//! call. It holds no data of its own; the backend is the only source of truth.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::Mutex;
use crate::backend::{Connector, Outcome, Row};
use crate::config::{BackendKind, StoreConfig};
use crate::context::Context;
use crate::engine::Sealer;
use crate::executor::{ExecPolicy, Executor};
use crate::pool::ConnectionPool;
use crate::query::Query;
use crate::translate::{self, Op, Operation, RowWrite, Statement, Translator};
use crate::{
    BulkFailure, BulkGetItem, BulkOutcome, DeleteRequest, Error, Features, QueryItem, QueryResponse, Result,
    SetRequest, StateEntry, StateStore, Value,
};

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Uninitialized,
    Initialized,
    Closed,
}

struct Ready {
    config: StoreConfig,
    translator: Arc<dyn Translator>,
    executor: Executor,
    sealer: Option<Sealer>,
}

enum State {
    Uninitialized,
    Initialized(Arc<Ready>),
    Closed,
}

pub struct StateStoreAdapter {
    backend: BackendKind,
    connector: Arc<dyn Connector>,
    state: RwLock<State>,
    init_lock: Mutex<()>,
}

impl StateStoreAdapter {
    /// Creates an uninitialized adapter. The backend kind and connector are fixed for its lifetime.
    pub fn new(backend: BackendKind, connector: Arc<dyn Connector>) -> Self {
        Self {
            backend,
            connector,
            state: RwLock::new(State::Uninitialized),
            init_lock: Mutex::new(()),
        }
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    pub fn lifecycle(&self) -> Lifecycle {
        match self.state.read().as_deref() {
            Ok(State::Uninitialized) => Lifecycle::Uninitialized,
            Ok(State::Initialized(_)) => Lifecycle::Initialized,
            Ok(State::Closed) | Err(_) => Lifecycle::Closed,
        }
    }

    /// The active configuration, once initialized.
    pub fn config(&self) -> Option<StoreConfig> {
        self.ready().ok().map(|r| r.config.clone())
    }

    /// The connection pool, once initialized.
    pub fn pool(&self) -> Option<Arc<ConnectionPool>> {
        self.ready().ok().map(|r| r.executor.pool().clone())
    }

    fn ready(&self) -> Result<Arc<Ready>> {
        let state = self
            .state
            .read()
            .map_err(|_| Error::Internal("adapter state lock poisoned".to_string()))?;
        match &*state {
            State::Uninitialized => Err(Error::NotInitialized),
            State::Initialized(ready) => Ok(ready.clone()),
            State::Closed => Err(Error::Closed),
        }
    }

    /// Parses, connects and ensures the schema. Leaves the adapter
    /// uninitialized on failure so `init` can be retried.
    pub async fn init_with_config(&self, config: StoreConfig) -> Result<()> {
        let _guard = self.init_lock.lock().await;
        match self.lifecycle() {
            Lifecycle::Uninitialized => {}
            Lifecycle::Initialized => return Err(Error::Validation("state store is already initialized".to_string())),
            Lifecycle::Closed => return Err(Error::Closed),
        }
        if config.backend != self.backend {
            return Err(Error::Validation(format!(
                "configuration is for the {} backend but this adapter serves {}",
                config.backend, self.backend
            )));
        }
        info!(
            "Initializing {} state store on {}:{} ({}.{})",
            self.backend, config.host, config.port, config.keyspace, config.table
        );

        let translator = translate::for_config(&config);
        let sealer = config.encryption_key.as_ref().map(Sealer::new).transpose()?;
        let pool = ConnectionPool::open(self.connector.clone(), config.connect_params(), config.pool_size).await?;
        let executor = Executor::new(pool.clone(), ExecPolicy::from_config(&config));

        let ctx = Context::with_timeout(config.connect_timeout + config.op_timeout);
        for statement in translator.schema() {
            if let Err(e) = executor.execute(&ctx, &statement).await {
                error!("Schema setup failed at {}: {}", statement.op.name(), e);
                pool.close().await;
                return Err(e);
            }
        }
        info!("Schema {}.{} ready", config.keyspace, config.table);

        let ready = Arc::new(Ready { config, translator, executor, sealer });
        let mut state = self
            .state
            .write()
            .map_err(|_| Error::Internal("adapter state lock poisoned".to_string()))?;
        *state = State::Initialized(ready);
        Ok(())
    }

    fn encode_value(ready: &Ready, value: &Value) -> Result<String> {
        let stored = match &ready.sealer {
            Some(sealer) => sealer.seal(value)?,
            None => value.clone(),
        };
        Ok(serde_json::to_string(&stored)?)
    }

    fn decode_row(ready: &Ready, row: Row) -> Result<StateEntry> {
        let raw: Value = serde_json::from_str(&row.value).map_err(|e| {
            error!("Stored value for '{}' is not valid JSON: {}", row.key, e);
            Error::Internal(format!("stored value for '{}' is not valid JSON: {}", row.key, e))
        })?;
        let value = match &ready.sealer {
            Some(sealer) => sealer.unseal(&raw)?,
            None => raw,
        };
        Ok(StateEntry {
            key: row.key,
            value,
            etag: row.etag,
            last_modified: row.last_modified_ms.and_then(DateTime::<Utc>::from_timestamp_millis),
        })
    }

    fn row_write(ready: &Ready, key: &str, value: &Value) -> Result<RowWrite> {
        Ok(RowWrite {
            key: key.to_string(),
            value: Self::encode_value(ready, value)?,
            etag: uuid::Uuid::new_v4().to_string(),
            last_modified_ms: Utc::now().timestamp_millis(),
        })
    }

    async fn get_one(ready: &Ready, ctx: &Context, key: &str) -> Result<Option<StateEntry>> {
        let statement = ready.translator.translate(&Operation::Get { key })?;
        match ready.executor.execute(ctx, &statement).await? {
            Outcome::Rows { rows } => {
                let mut rows = rows.into_iter();
                match (rows.next(), rows.next()) {
                    (None, _) => Ok(None),
                    (Some(row), None) => Self::decode_row(ready, row).map(Some),
                    (Some(_), Some(_)) => {
                        error!("Backend returned several rows for key '{}'", key);
                        Err(Error::Internal(format!("backend returned several rows for key '{}'", key)))
                    }
                }
            }
            other => Err(unexpected(&statement, &other)),
        }
    }

    async fn set_one(ready: &Ready, ctx: &Context, req: &SetRequest) -> Result<()> {
        ready.translator.validate_key(&req.key)?;
        let row = Self::row_write(ready, &req.key, &req.value)?;
        let statement = ready.translator.translate(&Operation::Set { row, etag: req.etag.as_deref() })?;
        expect_write(&statement, ready.executor.execute(ctx, &statement).await?)
    }

    async fn delete_one(ready: &Ready, ctx: &Context, req: &DeleteRequest) -> Result<()> {
        let statement = ready.translator.translate(&Operation::Delete { key: &req.key, etag: req.etag.as_deref() })?;
        expect_write(&statement, ready.executor.execute(ctx, &statement).await?)
    }

    /// Fan-out width for bulk reads: at most half the pool, at least one.
    fn fan_out(ready: &Ready) -> usize {
        (ready.config.pool_size / 2).max(1)
    }
}

/// Records one key's outcome of a sequential bulk write. Nothing is rolled back.
fn record(outcome: &mut BulkOutcome, key: &str, res: Result<()>) {
    match res {
        Ok(()) => outcome.succeeded.push(key.to_string()),
        Err(e) => {
            debug!("Bulk item '{}' failed: {}", key, e);
            outcome.failed.push(BulkFailure { key: key.to_string(), kind: e.kind().to_string(), message: e.to_string() });
        }
    }
}

fn unexpected(statement: &Statement, outcome: &Outcome) -> Error {
    error!("Unexpected {:?} for {} [{}]", outcome, statement.op.name(), statement.text);
    Error::Internal(format!("unexpected backend result for {}", statement.op.name()))
}

fn expect_write(statement: &Statement, outcome: Outcome) -> Result<()> {
    match outcome {
        Outcome::Done | Outcome::Applied { applied: true, .. } => Ok(()),
        other => Err(unexpected(statement, &other)),
    }
}

#[async_trait]
impl StateStore for StateStoreAdapter {
    async fn init(&self, metadata: HashMap<String, String>) -> Result<()> {
        let config = StoreConfig::from_metadata(self.backend, &metadata)?;
        self.init_with_config(config).await
    }

    async fn features(&self) -> Result<Features> {
        let ready = self.ready()?;
        let mut features = ready.translator.features();
        if ready.sealer.is_some() {
            features.query_api = false;
        }
        Ok(features)
    }

    async fn get(&self, ctx: &Context, key: &str) -> Result<Option<StateEntry>> {
        let ready = self.ready()?;
        Self::get_one(&ready, ctx, key).await
    }

    async fn set(&self, ctx: &Context, req: SetRequest) -> Result<()> {
        let ready = self.ready()?;
        Self::set_one(&ready, ctx, &req).await
    }

    async fn delete(&self, ctx: &Context, req: DeleteRequest) -> Result<()> {
        let ready = self.ready()?;
        Self::delete_one(&ready, ctx, &req).await
    }

    async fn bulk_get(&self, ctx: &Context, keys: Vec<String>) -> Result<Vec<BulkGetItem>> {
        let ready = self.ready()?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        // Only a transport that cannot lease a single session fails the whole call.
        {
            let lease_ctx = ctx.child_with_timeout(ready.config.op_timeout);
            if let Err(e) = ready.executor.pool().acquire(&lease_ctx).await {
                warn!("Bulk get failed before any key could be read: {}", e);
                return Err(e);
            }
        }

        let width = Self::fan_out(&ready);
        let results: Vec<(String, Result<Option<StateEntry>>)> = stream::iter(keys)
            .map(|key| {
                let ready = &ready;
                async move {
                    let res = Self::get_one(ready, ctx, &key).await;
                    (key, res)
                }
            })
            .buffered(width)
            .collect()
            .await;

        Ok(results
            .into_iter()
            .map(|(key, res)| match res {
                Ok(Some(entry)) => BulkGetItem { key, found: true, value: Some(entry.value), etag: entry.etag, error: None },
                Ok(None) => BulkGetItem { key, found: false, value: None, etag: None, error: None },
                Err(e) => BulkGetItem { key, found: false, value: None, etag: None, error: Some(e.to_string()) },
            })
            .collect())
    }

    async fn bulk_set(&self, ctx: &Context, items: Vec<SetRequest>) -> Result<BulkOutcome> {
        let ready = self.ready()?;
        if items.is_empty() {
            return Ok(BulkOutcome::default());
        }

        // Atomic batches only carry unconditional writes.
        if items.iter().all(|i| i.etag.is_none()) {
            let rows = items
                .iter()
                .map(|i| {
                    ready.translator.validate_key(&i.key)?;
                    Self::row_write(&ready, &i.key, &i.value)
                })
                .collect::<Result<Vec<_>>>();
            if let Ok(rows) = rows {
                if let Some(statement) = ready.translator.batch_set(&rows)? {
                    debug!("Bulk set of {} keys as one batch", rows.len());
                    let outcome = ready.executor.execute(ctx, &statement).await?;
                    expect_write(&statement, outcome)?;
                    return Ok(BulkOutcome {
                        succeeded: items.into_iter().map(|i| i.key).collect(),
                        failed: Vec::new(),
                    });
                }
            }
        }

        let mut outcome = BulkOutcome::default();
        for item in &items {
            let res = Self::set_one(&ready, ctx, item).await;
            record(&mut outcome, &item.key, res);
        }
        Ok(outcome)
    }

    async fn bulk_delete(&self, ctx: &Context, items: Vec<DeleteRequest>) -> Result<BulkOutcome> {
        let ready = self.ready()?;
        if items.is_empty() {
            return Ok(BulkOutcome::default());
        }

        let all_valid = items.iter().all(|i| ready.translator.validate_key(&i.key).is_ok());
        if all_valid && items.iter().all(|i| i.etag.is_none()) {
            let keys: Vec<&str> = items.iter().map(|i| i.key.as_str()).collect();
            if let Some(statement) = ready.translator.batch_delete(&keys)? {
                debug!("Bulk delete of {} keys as one batch", keys.len());
                let outcome = ready.executor.execute(ctx, &statement).await?;
                expect_write(&statement, outcome)?;
                return Ok(BulkOutcome {
                    succeeded: items.into_iter().map(|i| i.key).collect(),
                    failed: Vec::new(),
                });
            }
        }

        let mut outcome = BulkOutcome::default();
        for item in &items {
            let res = Self::delete_one(&ready, ctx, item).await;
            record(&mut outcome, &item.key, res);
        }
        Ok(outcome)
    }

    async fn query(&self, ctx: &Context, query: Query) -> Result<QueryResponse> {
        let ready = self.ready()?;
        if ready.sealer.is_some() {
            return Err(Error::UnsupportedQuery("values are encrypted; queries cannot inspect them".to_string()));
        }
        let statement = ready.translator.translate(&Operation::Query(&query))?;
        let rows = match ready.executor.execute(ctx, &statement).await? {
            Outcome::Rows { rows } => rows,
            other => return Err(unexpected(&statement, &other)),
        };

        let token = match &statement.op {
            Op::Select { offset, limit: Some(limit), .. }
                if rows.len() == *limit && ready.translator.supports_offset_paging() =>
            {
                Some((offset + limit).to_string())
            }
            _ => None,
        };
        let results = rows
            .into_iter()
            .map(|row| {
                Self::decode_row(&ready, row).map(|entry| QueryItem { key: entry.key, value: entry.value, etag: entry.etag })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(QueryResponse { results, token })
    }

    async fn ping(&self, ctx: &Context) -> Result<()> {
        let ready = self.ready()?;
        let statement = ready.translator.ping();
        ready.executor.execute(ctx, &statement).await.map(|_| ())
    }

    async fn close(&self) -> Result<()> {
        let previous = {
            let mut state = self
                .state
                .write()
                .map_err(|_| Error::Internal("adapter state lock poisoned".to_string()))?;
            std::mem::replace(&mut *state, State::Closed)
        };
        if let State::Initialized(ready) = previous {
            ready.executor.pool().close().await;
            info!("{} state store closed", self.backend);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, Session};
    use crate::config::ConnectParams;
    use crate::engine::MemEngine;
    use crate::query::{QueryFilter, KEY_FIELD};
    use crate::translate::Target;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn meta(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    async fn adapter(kind: BackendKind) -> (StateStoreAdapter, MemEngine) {
        let engine = MemEngine::new();
        let adapter = StateStoreAdapter::new(kind, Arc::new(engine.clone()));
        adapter.init(meta(&[("host", "memory"), ("poolSize", "4")])).await.unwrap();
        (adapter, engine)
    }

    fn set(key: &str, value: Value) -> SetRequest {
        SetRequest { key: key.into(), value, etag: None }
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let adapter = StateStoreAdapter::new(BackendKind::Graph, Arc::new(MemEngine::new()));
        let ctx = Context::background();
        assert!(matches!(adapter.get(&ctx, "k").await, Err(Error::NotInitialized)));
        assert!(matches!(adapter.features().await, Err(Error::NotInitialized)));

        adapter.init(meta(&[("host", "memory")])).await.unwrap();
        assert_eq!(adapter.lifecycle(), Lifecycle::Initialized);
        assert!(matches!(adapter.init(meta(&[("host", "memory")])).await, Err(Error::Validation(_))));

        adapter.close().await.unwrap();
        adapter.close().await.unwrap();
        assert_eq!(adapter.lifecycle(), Lifecycle::Closed);
        assert!(matches!(adapter.get(&ctx, "k").await, Err(Error::Closed)));
        assert!(matches!(adapter.init(meta(&[("host", "memory")])).await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_bad_metadata_leaves_adapter_uninitialized() {
        let adapter = StateStoreAdapter::new(BackendKind::WideColumn, Arc::new(MemEngine::new()));
        let err = adapter.init(meta(&[("host", "memory"), ("bogus", "1")])).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(adapter.lifecycle(), Lifecycle::Uninitialized);
        adapter.init(meta(&[("host", "memory")])).await.unwrap();
    }

    #[tokio::test]
    async fn test_schema_created_idempotently() {
        let engine = MemEngine::new();
        for _ in 0..2 {
            let adapter = StateStoreAdapter::new(BackendKind::WideColumn, Arc::new(engine.clone()));
            adapter.init(meta(&[("host", "memory"), ("keyspace", "orders")])).await.unwrap();
            adapter.close().await.unwrap();
        }
        assert_eq!(engine.namespaces(), vec!["orders".to_string()]);
    }

    #[tokio::test]
    async fn test_get_set_delete() {
        for kind in [BackendKind::WideColumn, BackendKind::Graph] {
            let (adapter, _) = adapter(kind).await;
            let ctx = Context::background();
            assert!(adapter.get(&ctx, "missing").await.unwrap().is_none());

            adapter.set(&ctx, set("k1", json!({ "n": 1 }))).await.unwrap();
            let entry = adapter.get(&ctx, "k1").await.unwrap().unwrap();
            assert_eq!(entry.value, json!({ "n": 1 }));
            assert!(entry.etag.is_some());
            assert!(entry.last_modified.is_some());

            adapter.delete(&ctx, DeleteRequest { key: "k1".into(), etag: None }).await.unwrap();
            adapter.delete(&ctx, DeleteRequest { key: "k1".into(), etag: None }).await.unwrap();
            assert!(adapter.get(&ctx, "k1").await.unwrap().is_none());

            assert!(matches!(adapter.get(&ctx, "").await, Err(Error::Validation(_))));
        }
    }

    #[tokio::test]
    async fn test_etag_changes_and_guards_writes() {
        let (adapter, _) = adapter(BackendKind::Graph).await;
        let ctx = Context::background();
        adapter.set(&ctx, set("k", json!(1))).await.unwrap();
        let first = adapter.get(&ctx, "k").await.unwrap().unwrap().etag.unwrap();

        adapter
            .set(&ctx, SetRequest { key: "k".into(), value: json!(2), etag: Some(first.clone()) })
            .await
            .unwrap();
        let second = adapter.get(&ctx, "k").await.unwrap().unwrap();
        assert_ne!(second.etag.as_deref(), Some(first.as_str()));

        let err = adapter
            .set(&ctx, SetRequest { key: "k".into(), value: json!(3), etag: Some(first.clone()) })
            .await
            .unwrap_err();
        match err {
            Error::Conflict { expected, actual, .. } => {
                assert_eq!(expected, Some(first.clone()));
                assert_eq!(actual, second.etag.clone());
            }
            other => panic!("expected conflict, got {:?}", other),
        }
        assert_eq!(adapter.get(&ctx, "k").await.unwrap().unwrap().value, json!(2));

        let err = adapter.delete(&ctx, DeleteRequest { key: "k".into(), etag: Some(first) }).await.unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
        adapter.delete(&ctx, DeleteRequest { key: "k".into(), etag: second.etag }).await.unwrap();
        assert!(adapter.get(&ctx, "k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_stale_writers_one_wins() {
        let (adapter, _) = adapter(BackendKind::WideColumn).await;
        let adapter = Arc::new(adapter);
        let ctx = Context::background();
        adapter.set(&ctx, set("k", json!("base"))).await.unwrap();
        let etag = adapter.get(&ctx, "k").await.unwrap().unwrap().etag;

        let tasks: Vec<_> = (0..2)
            .map(|i| {
                let adapter = adapter.clone();
                let etag = etag.clone();
                tokio::spawn(async move {
                    adapter
                        .set(&Context::background(), SetRequest { key: "k".into(), value: json!(i), etag })
                        .await
                })
            })
            .collect();
        let mut ok = 0;
        let mut conflicts = 0;
        for t in tasks {
            match t.await.unwrap() {
                Ok(()) => ok += 1,
                Err(Error::Conflict { .. }) => conflicts += 1,
                Err(e) => panic!("unexpected {:?}", e),
            }
        }
        assert_eq!((ok, conflicts), (1, 1));
    }

    #[tokio::test]
    async fn test_bulk_roundtrip_both_paths() {
        for kind in [BackendKind::WideColumn, BackendKind::Graph] {
            let (adapter, _) = adapter(kind).await;
            let ctx = Context::background();
            let out = adapter
                .bulk_set(&ctx, vec![set("k1", json!("v1")), set("k2", json!("v2"))])
                .await
                .unwrap();
            assert_eq!(out.succeeded, vec!["k1", "k2"]);
            assert!(out.is_complete());

            let items = adapter
                .bulk_get(&ctx, vec!["k1".into(), "nope".into(), "k2".into()])
                .await
                .unwrap();
            assert_eq!(items.len(), 3);
            assert_eq!(items[0].value, Some(json!("v1")));
            assert!(!items[1].found);
            assert!(items[1].error.is_none());
            assert_eq!(items[2].value, Some(json!("v2")));

            let out = adapter
                .bulk_delete(&ctx, vec![DeleteRequest { key: "k1".into(), etag: None }, DeleteRequest { key: "k2".into(), etag: None }])
                .await
                .unwrap();
            assert_eq!(out.succeeded.len(), 2);
            assert!(adapter.get(&ctx, "k1").await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_bulk_partial_failures_are_per_item() {
        let (adapter, _) = adapter(BackendKind::WideColumn).await;
        let ctx = Context::background();
        adapter.set(&ctx, set("guarded", json!(0))).await.unwrap();
        let out = adapter
            .bulk_set(
                &ctx,
                vec![
                    set("a", json!(1)),
                    SetRequest { key: "guarded".into(), value: json!(1), etag: Some("stale".into()) },
                    set("", json!(1)),
                ],
            )
            .await
            .unwrap();
        assert_eq!(out.succeeded, vec!["a"]);
        assert_eq!(out.failed.len(), 2);
        assert_eq!(out.failed[0].kind, "conflict");
        assert_eq!(out.failed[1].kind, "validation");

        let items = adapter.bulk_get(&ctx, vec!["a".into(), "".into()]).await.unwrap();
        assert!(items[0].found);
        assert!(items[1].error.is_some());
    }

    #[tokio::test]
    async fn test_query_and_paging() {
        let (adapter, _) = adapter(BackendKind::Graph).await;
        let ctx = Context::background();
        for i in 0..5 {
            adapter.set(&ctx, set(&format!("k{}", i), json!({ "n": i, "team": if i % 2 == 0 { "a" } else { "b" } }))).await.unwrap();
        }
        let q: Query = serde_json::from_value(json!({
            "filter": { "EQ": { "team": "a" } },
            "sort": [ { "key": "n", "order": "DESC" } ],
            "page": { "limit": 2 }
        }))
        .unwrap();
        let page = adapter.query(&ctx, q.clone()).await.unwrap();
        let keys: Vec<_> = page.results.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["k4", "k2"]);
        assert_eq!(page.token.as_deref(), Some("2"));

        let mut next = q;
        next.page.as_mut().unwrap().token = page.token;
        let page = adapter.query(&ctx, next).await.unwrap();
        assert_eq!(page.results.len(), 1);
        assert_eq!(page.results[0].key, "k0");
        assert!(page.token.is_none());
    }

    #[tokio::test]
    async fn test_wide_column_query_fails_closed() {
        let (adapter, _) = adapter(BackendKind::WideColumn).await;
        let ctx = Context::background();
        adapter.set(&ctx, set("k1", json!({ "team": "a" }))).await.unwrap();
        let err = adapter.query(&ctx, Query::filtered(QueryFilter::eq("team", "a"))).await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedQuery(_)));

        let res = adapter.query(&ctx, Query::filtered(QueryFilter::eq(KEY_FIELD, "k1"))).await.unwrap();
        assert_eq!(res.results.len(), 1);
    }

    #[tokio::test]
    async fn test_sealed_values() {
        let engine = MemEngine::new();
        let adapter = StateStoreAdapter::new(BackendKind::Graph, Arc::new(engine.clone()));
        let key_hex = hex::encode(b"thisis32byteslongsecretkey123456");
        adapter.init(meta(&[("host", "memory"), ("encryptionKey", &key_hex)])).await.unwrap();
        let ctx = Context::background();

        adapter.set(&ctx, set("secret", json!({ "pin": 1234 }))).await.unwrap();
        assert_eq!(adapter.get(&ctx, "secret").await.unwrap().unwrap().value, json!({ "pin": 1234 }));

        let target = Target { namespace: "dapr".into(), container: "state".into() };
        let raw = engine.row(&target, "secret").unwrap();
        assert!(!raw.value.contains("1234"));

        assert!(!adapter.features().await.unwrap().query_api);
        assert!(matches!(adapter.query(&ctx, Query::default()).await, Err(Error::UnsupportedQuery(_))));
    }

    #[tokio::test]
    async fn test_features_per_backend() {
        let (wide, _) = adapter(BackendKind::WideColumn).await;
        assert_eq!(wide.features().await.unwrap().names(), vec!["ETAG", "TRANSACTIONAL", "QUERY_API"]);
        let (graph, _) = adapter(BackendKind::Graph).await;
        assert_eq!(graph.features().await.unwrap().names(), vec!["ETAG", "QUERY_API"]);
    }

    #[tokio::test]
    async fn test_pool_exhaustion_times_out() {
        let engine = MemEngine::new();
        let adapter = StateStoreAdapter::new(BackendKind::WideColumn, Arc::new(engine));
        adapter.init(meta(&[("host", "memory"), ("poolSize", "1")])).await.unwrap();
        let pool = adapter.pool().unwrap();
        let _held = pool.acquire(&Context::background()).await.unwrap();

        let err = adapter.get(&Context::with_timeout(Duration::from_millis(30)), "k").await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    /// Delays every key read by `delay` and records how many run at once.
    #[derive(Clone)]
    struct SlowReads {
        engine: MemEngine,
        delay: Duration,
        in_flight: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl SlowReads {
        fn new(delay: Duration) -> Self {
            Self {
                engine: MemEngine::new(),
                delay,
                in_flight: Arc::new(AtomicUsize::new(0)),
                peak: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    struct SlowSession {
        inner: Box<dyn Session>,
        reads: SlowReads,
    }

    #[async_trait]
    impl Session for SlowSession {
        async fn execute(&mut self, statement: &Statement) -> std::result::Result<Outcome, BackendError> {
            if !matches!(statement.op, Op::Fetch { .. }) {
                return self.inner.execute(statement).await;
            }
            let now = self.reads.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.reads.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.reads.delay).await;
            self.reads.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.inner.execute(statement).await
        }

        async fn close(&mut self) {
            self.inner.close().await;
        }
    }

    #[async_trait]
    impl Connector for SlowReads {
        async fn connect(&self, params: &ConnectParams) -> std::result::Result<Box<dyn Session>, BackendError> {
            let inner = self.engine.connect(params).await?;
            Ok(Box::new(SlowSession { inner, reads: self.clone() }))
        }
    }

    #[tokio::test]
    async fn test_bulk_get_fan_out_is_bounded() {
        let reads = SlowReads::new(Duration::from_millis(20));
        let adapter = StateStoreAdapter::new(BackendKind::Graph, Arc::new(reads.clone()));
        adapter.init(meta(&[("host", "memory"), ("poolSize", "6")])).await.unwrap();
        let ctx = Context::background();
        adapter.set(&ctx, set("k0", json!(0))).await.unwrap();

        let keys: Vec<String> = (0..12).map(|i| format!("k{}", i)).collect();
        let items = adapter.bulk_get(&ctx, keys).await.unwrap();
        assert_eq!(items.len(), 12);
        assert!(items[0].found);

        let peak = reads.peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "{} reads ran at once with a fan-out of 3", peak);
        assert!(peak > 1);
        assert!(adapter.pool().unwrap().live() <= 4);
    }

    #[tokio::test]
    async fn test_bulk_get_timeouts_after_dispatch_are_per_item() {
        let reads = SlowReads::new(Duration::from_millis(300));
        let adapter = StateStoreAdapter::new(BackendKind::WideColumn, Arc::new(reads));
        adapter
            .init(meta(&[("host", "memory"), ("poolSize", "4"), ("opTimeoutMs", "50"), ("maxRetries", "0")]))
            .await
            .unwrap();

        let items = adapter
            .bulk_get(&Context::background(), vec!["a".into(), "b".into()])
            .await
            .unwrap();
        assert_eq!(items.len(), 2);
        for item in &items {
            assert!(!item.found);
            assert!(item.error.is_some(), "{:?}", item);
        }
    }

    #[tokio::test]
    async fn test_bulk_get_fails_whole_when_no_session_can_be_leased() {
        let adapter = StateStoreAdapter::new(BackendKind::WideColumn, Arc::new(MemEngine::new()));
        adapter.init(meta(&[("host", "memory"), ("poolSize", "1"), ("opTimeoutMs", "50")])).await.unwrap();
        let pool = adapter.pool().unwrap();
        let _held = pool.acquire(&Context::background()).await.unwrap();

        let err = adapter
            .bulk_get(&Context::background(), vec!["a".into(), "b".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }
}

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, RwLock};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use crate::backend::{BackendError, Connector, Outcome, Row, Session};
use crate::config::ConnectParams;
use crate::engine::Persistence;
use crate::query::order_by;
use crate::translate::{Op, RowWrite, Statement, Target};

/// A stored row, keyed by state key inside its container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRow {
    pub value: String,
    pub etag: String,
    pub last_modified_ms: i64,
}

impl From<&RowWrite> for StoredRow {
    fn from(row: &RowWrite) -> Self {
        Self {
            value: row.value.clone(),
            etag: row.etag.clone(),
            last_modified_ms: row.last_modified_ms,
        }
    }
}

pub(crate) type Container = BTreeMap<String, StoredRow>;
pub(crate) type Namespace = HashMap<String, Container>;
type EngineData = HashMap<String, Namespace>;

/// Embedded development engine.
///
/// Executes the structured form of translated statements for either dialect.
/// Conditional writes and batches run under one write lock, so they are atomic
/// with respect to every other statement.
#[derive(Clone)]
pub struct MemEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    data: RwLock<EngineData>,
    persistence: Option<Persistence>,
    persist_lock: Mutex<()>,
}

impl Default for MemEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemEngine {
    pub fn new() -> Self {
        Self::with_data(HashMap::new(), None)
    }

    /// Opens an engine that snapshots every namespace to `dir` after each write.
    pub fn with_persistence<P: AsRef<Path>>(dir: P) -> crate::Result<Self> {
        let persistence = Persistence::new(dir)?;
        let data = persistence.load_all()?;
        log::info!("Engine loaded {} namespaces", data.len());
        Ok(Self::with_data(data, Some(persistence)))
    }

    fn with_data(data: EngineData, persistence: Option<Persistence>) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                data: RwLock::new(data),
                persistence,
                persist_lock: Mutex::new(()),
            }),
        }
    }

    /// Reads one row directly, bypassing statements.
    pub fn row(&self, target: &Target, key: &str) -> Option<StoredRow> {
        let data = self.inner.data.read().ok()?;
        data.get(&target.namespace)?.get(&target.container)?.get(key).cloned()
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.inner
            .data
            .read()
            .map(|d| d.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Runs one statement.
    pub async fn execute(&self, statement: &Statement) -> Result<Outcome, BackendError> {
        let target = &statement.target;
        let (outcome, mutated) = if is_read(&statement.op) {
            let data = self.inner.data.read().map_err(|_| poisoned())?;
            (read(&data, target, &statement.op)?, false)
        } else {
            let mut data = self.inner.data.write().map_err(|_| poisoned())?;
            write(&mut data, target, &statement.op)?
        };
        if mutated {
            self.persist(&target.namespace).await?;
        }
        Ok(outcome)
    }

    async fn persist(&self, namespace: &str) -> Result<(), BackendError> {
        let Some(persistence) = &self.inner.persistence else {
            return Ok(());
        };
        let _guard = self.inner.persist_lock.lock().await;
        let snapshot = {
            let data = self.inner.data.read().map_err(|_| poisoned())?;
            data.get(namespace).cloned()
        };
        let Some(snapshot) = snapshot else {
            return Ok(());
        };
        let persistence = persistence.clone();
        let name = namespace.to_string();
        tokio::task::spawn_blocking(move || persistence.save_namespace(&name, &snapshot))
            .await
            .map_err(|e| BackendError::Transport(format!("persistence task failed: {}", e)))?
            .map_err(|e| {
                log::error!("Failed to persist namespace {}: {}", namespace, e);
                BackendError::Transport(format!("failed to persist namespace {}: {}", namespace, e))
            })
    }
}

fn poisoned() -> BackendError {
    BackendError::Protocol("engine state lock poisoned".to_string())
}

fn is_read(op: &Op) -> bool {
    matches!(op, Op::Ping | Op::Fetch { .. } | Op::Select { .. })
}

fn container<'a>(data: &'a EngineData, target: &Target) -> Result<&'a Container, BackendError> {
    data.get(&target.namespace)
        .ok_or_else(|| BackendError::Rejected(format!("namespace '{}' does not exist", target.namespace)))?
        .get(&target.container)
        .ok_or_else(|| unconfigured(target))
}

fn container_mut<'a>(data: &'a mut EngineData, target: &Target) -> Result<&'a mut Container, BackendError> {
    data.get_mut(&target.namespace)
        .ok_or_else(|| BackendError::Rejected(format!("namespace '{}' does not exist", target.namespace)))?
        .get_mut(&target.container)
        .ok_or_else(|| unconfigured(target))
}

fn unconfigured(target: &Target) -> BackendError {
    BackendError::Rejected(format!("unconfigured container {}.{}", target.namespace, target.container))
}

fn to_row(key: &str, stored: &StoredRow) -> Row {
    Row {
        key: key.to_string(),
        value: stored.value.clone(),
        etag: Some(stored.etag.clone()),
        last_modified_ms: Some(stored.last_modified_ms),
    }
}

fn read(data: &EngineData, target: &Target, op: &Op) -> Result<Outcome, BackendError> {
    match op {
        Op::Ping => Ok(Outcome::Done),
        Op::Fetch { key } => {
            let rows = container(data, target)?
                .get(key)
                .map(|stored| vec![to_row(key, stored)])
                .unwrap_or_default();
            Ok(Outcome::Rows { rows })
        }
        Op::Select { filter, sort, offset, limit } => {
            let table = container(data, target)?;
            let mut matched = Vec::new();
            for (key, stored) in table {
                let doc: serde_json::Value = serde_json::from_str(&stored.value)
                    .map_err(|e| BackendError::Protocol(format!("stored value for '{}' is not JSON: {}", key, e)))?;
                if filter.as_ref().map_or(true, |f| f.matches(key, &doc)) {
                    matched.push((key, stored, doc));
                }
            }
            if !sort.is_empty() {
                matched.sort_by(|a, b| order_by(sort, (a.0.as_str(), &a.2), (b.0.as_str(), &b.2)));
            }
            let rows = matched
                .into_iter()
                .skip(*offset)
                .take(limit.unwrap_or(usize::MAX))
                .map(|(key, stored, _)| to_row(key, stored))
                .collect();
            Ok(Outcome::Rows { rows })
        }
        other => Err(BackendError::Invalid(format!("{} is not a read", other.name()))),
    }
}

/// Applies a mutating op. Returns the outcome and whether anything changed.
fn write(data: &mut EngineData, target: &Target, op: &Op) -> Result<(Outcome, bool), BackendError> {
    match op {
        Op::EnsureNamespace => {
            let created = !data.contains_key(&target.namespace);
            data.entry(target.namespace.clone()).or_default();
            Ok((Outcome::Done, created))
        }
        Op::EnsureContainer => {
            let ns = data
                .get_mut(&target.namespace)
                .ok_or_else(|| BackendError::Rejected(format!("namespace '{}' does not exist", target.namespace)))?;
            let created = !ns.contains_key(&target.container);
            ns.entry(target.container.clone()).or_default();
            Ok((Outcome::Done, created))
        }
        Op::EnsureIndex => {
            container(data, target)?;
            Ok((Outcome::Done, false))
        }
        Op::Upsert { row } => {
            container_mut(data, target)?.insert(row.key.clone(), StoredRow::from(row));
            Ok((Outcome::Done, true))
        }
        Op::CompareAndSet { row, expected } => {
            let table = container_mut(data, target)?;
            let current = table.get(&row.key).map(|r| r.etag.clone());
            if current.as_deref() != Some(expected.as_str()) {
                return Ok((Outcome::Applied { applied: false, current_etag: current }, false));
            }
            table.insert(row.key.clone(), StoredRow::from(row));
            Ok((Outcome::Applied { applied: true, current_etag: Some(row.etag.clone()) }, true))
        }
        Op::Delete { key } => {
            let removed = container_mut(data, target)?.remove(key).is_some();
            Ok((Outcome::Done, removed))
        }
        Op::CompareAndDelete { key, expected } => {
            let table = container_mut(data, target)?;
            let current = table.get(key).map(|r| r.etag.clone());
            if current.as_deref() != Some(expected.as_str()) {
                return Ok((Outcome::Applied { applied: false, current_etag: current }, false));
            }
            table.remove(key);
            Ok((Outcome::Applied { applied: true, current_etag: None }, true))
        }
        Op::Batch { ops } => {
            // Validate everything first so a rejected batch leaves no partial writes.
            container(data, target)?;
            if let Some(bad) = ops.iter().find(|op| !matches!(op, Op::Upsert { .. } | Op::Delete { .. })) {
                return Err(BackendError::Invalid(format!("{} cannot be part of a batch", bad.name())));
            }
            let mut mutated = false;
            for op in ops {
                let (_, changed) = write(data, target, op)?;
                mutated |= changed;
            }
            Ok((Outcome::Done, mutated))
        }
        other => Err(BackendError::Invalid(format!("{} is not a write", other.name()))),
    }
}

/// An in-process session. Cheap to open; never breaks.
pub struct MemSession {
    engine: MemEngine,
}

#[async_trait]
impl Session for MemSession {
    async fn execute(&mut self, statement: &Statement) -> Result<Outcome, BackendError> {
        log::debug!("engine executing {} on {}.{}", statement.op.name(), statement.target.namespace, statement.target.container);
        self.engine.execute(statement).await
    }

    async fn close(&mut self) {}
}

#[async_trait]
impl Connector for MemEngine {
    async fn connect(&self, _params: &ConnectParams) -> Result<Box<dyn Session>, BackendError> {
        Ok(Box::new(MemSession { engine: self.clone() }))
    }
}

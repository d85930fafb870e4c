//! Statement translation.
//!
//! A [`Translator`] turns one logical [`Operation`] into a backend
//! [`Statement`]. Translation is pure: no I/O, no clocks, no randomness. The
//! adapter supplies new etags and timestamps so the same input always yields
//! the same statement.

pub mod cql;
pub mod ngql;

pub use cql::CqlTranslator;
pub use ngql::NgqlTranslator;

use std::sync::Arc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use crate::config::{BackendKind, StoreConfig};
use crate::query::{Query, QueryFilter, Sort};
use crate::{Error, Features, Result};

/// The schema container a statement addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub namespace: String,
    pub container: String,
}

/// A full row image written by set operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowWrite {
    pub key: String,
    /// JSON text of the value (possibly sealed).
    pub value: String,
    pub etag: String,
    pub last_modified_ms: i64,
}

/// The logical operation a statement performs.
///
/// Native drivers only look at [`Statement::text`] and [`Statement::params`];
/// the embedded engine executes this structured form instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    Ping,
    EnsureNamespace,
    EnsureContainer,
    EnsureIndex,
    Fetch { key: String },
    Upsert { row: RowWrite },
    CompareAndSet { row: RowWrite, expected: String },
    Delete { key: String },
    CompareAndDelete { key: String, expected: String },
    Batch { ops: Vec<Op> },
    Select {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<QueryFilter>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        sort: Vec<Sort>,
        #[serde(default)]
        offset: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
    },
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::Ping => "ping",
            Op::EnsureNamespace => "ensure_namespace",
            Op::EnsureContainer => "ensure_container",
            Op::EnsureIndex => "ensure_index",
            Op::Fetch { .. } => "fetch",
            Op::Upsert { .. } => "upsert",
            Op::CompareAndSet { .. } => "compare_and_set",
            Op::Delete { .. } => "delete",
            Op::CompareAndDelete { .. } => "compare_and_delete",
            Op::Batch { .. } => "batch",
            Op::Select { .. } => "select",
        }
    }

    pub fn is_conditional(&self) -> bool {
        matches!(self, Op::CompareAndSet { .. } | Op::CompareAndDelete { .. })
    }
}

/// A translated, ready-to-run backend statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub text: String,
    #[serde(default)]
    pub params: Vec<(String, Value)>,
    pub target: Target,
    pub op: Op,
    /// Safe to re-run after an ambiguous failure.
    pub idempotent: bool,
}

impl Statement {
    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }
}

/// One logical request against a single key, or a query.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation<'a> {
    Get { key: &'a str },
    Set { row: RowWrite, etag: Option<&'a str> },
    Delete { key: &'a str, etag: Option<&'a str> },
    Query(&'a Query),
}

/// Builds statements for one backend dialect.
pub trait Translator: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Capabilities this dialect can honour.
    fn features(&self) -> Features;

    /// Idempotent create-if-absent statements, in execution order.
    fn schema(&self) -> Vec<Statement>;

    /// A cheap liveness probe.
    fn ping(&self) -> Statement;

    /// Translates a single logical operation.
    fn translate(&self, operation: &Operation<'_>) -> Result<Statement>;

    /// Atomic batch of unconditional upserts, or `None` when the dialect has no atomic batches.
    fn batch_set(&self, rows: &[RowWrite]) -> Result<Option<Statement>>;

    /// Atomic batch of unconditional deletes, or `None` when the dialect has no atomic batches.
    fn batch_delete(&self, keys: &[&str]) -> Result<Option<Statement>>;

    /// Whether a page token can be turned into a resume offset.
    fn supports_offset_paging(&self) -> bool;

    /// Longest key the backend can address.
    fn max_key_len(&self) -> usize;

    fn validate_key(&self, key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(Error::Validation("key must not be empty".to_string()));
        }
        if key.len() > self.max_key_len() {
            return Err(Error::Validation(format!(
                "key is {} bytes, {} backend allows at most {}",
                key.len(),
                self.kind(),
                self.max_key_len()
            )));
        }
        Ok(())
    }
}

/// Picks the dialect for a backend kind.
pub fn for_config(config: &StoreConfig) -> Arc<dyn Translator> {
    let target = Target {
        namespace: config.keyspace.clone(),
        container: config.table.clone(),
    };
    match config.backend {
        BackendKind::WideColumn => Arc::new(CqlTranslator::new(target, config.replication_factor)),
        BackendKind::Graph => Arc::new(NgqlTranslator::new(target)),
    }
}

/// Parses a page token into an offset.
pub(crate) fn offset_from_token(token: Option<&str>) -> Result<usize> {
    match token {
        None => Ok(0),
        Some(t) => t
            .parse::<usize>()
            .map_err(|_| Error::Validation(format!("invalid page token '{}'", t))),
    }
}

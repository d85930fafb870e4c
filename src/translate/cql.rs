use serde_json::{json, Value};
use crate::config::BackendKind;
use crate::query::{CompareOp, Query, QueryFilter, KEY_FIELD};
use crate::translate::{Op, Operation, RowWrite, Statement, Target, Translator};
use crate::{Error, Features, Result};

/// CQL partition keys are capped at 64 KiB.
const MAX_KEY_LEN: usize = 65_535;

/// Translator for Cassandra-compatible wide-column stores.
///
/// Etag-guarded writes use lightweight transactions (`IF etag = ?`), which the
/// backend evaluates atomically per partition. Unconditional bulk writes go
/// out as a single logged batch.
pub struct CqlTranslator {
    target: Target,
    replication_factor: u32,
    qualified: String,
}

impl CqlTranslator {
    pub fn new(target: Target, replication_factor: u32) -> Self {
        let qualified = format!("{}.{}", target.namespace, target.container);
        Self { target, replication_factor, qualified }
    }

    fn statement(&self, text: String, params: Vec<(String, Value)>, op: Op, idempotent: bool) -> Statement {
        Statement {
            text,
            params,
            target: self.target.clone(),
            op,
            idempotent,
        }
    }

    fn insert_text(&self, suffix: &str) -> String {
        format!(
            "INSERT INTO {} (key, value, etag, last_modified) VALUES (:key{s}, :value{s}, :etag{s}, :last_modified{s})",
            self.qualified,
            s = suffix
        )
    }

    fn query(&self, query: &Query) -> Result<Statement> {
        query.validate()?;
        if !query.sort.is_empty() {
            return Err(Error::UnsupportedQuery("wide-column backend cannot sort query results".to_string()));
        }
        if query.token().is_some() {
            return Err(Error::UnsupportedQuery("wide-column backend cannot resume from a page token".to_string()));
        }

        let mut text = format!("SELECT key, value, etag, last_modified FROM {}", self.qualified);
        let mut params = Vec::new();
        if let Some(filter) = &query.filter {
            let clause = match filter {
                QueryFilter::Compare { op: CompareOp::Eq, field, value } if field == KEY_FIELD => {
                    require_string_keys(std::slice::from_ref(value))?;
                    params.push(("p0".to_string(), value.clone()));
                    "key = :p0"
                }
                QueryFilter::In { field, values } if field == KEY_FIELD => {
                    require_string_keys(values)?;
                    params.push(("p0".to_string(), Value::Array(values.clone())));
                    "key IN :p0"
                }
                other => {
                    return Err(Error::UnsupportedQuery(format!(
                        "wide-column backend only filters on EQ or IN over '{}', got {}",
                        KEY_FIELD,
                        describe(other)
                    )))
                }
            };
            text.push_str(" WHERE ");
            text.push_str(clause);
        }
        if let Some(limit) = query.limit() {
            text.push_str(&format!(" LIMIT {}", limit));
        }

        let op = Op::Select {
            filter: query.filter.clone(),
            sort: Vec::new(),
            offset: 0,
            limit: query.limit(),
        };
        Ok(self.statement(text, params, op, true))
    }
}

impl Translator for CqlTranslator {
    fn kind(&self) -> BackendKind {
        BackendKind::WideColumn
    }

    fn features(&self) -> Features {
        Features {
            etag: true,
            transactional: true,
            query_api: true,
        }
    }

    fn schema(&self) -> Vec<Statement> {
        vec![
            self.statement(
                format!(
                    "CREATE KEYSPACE IF NOT EXISTS {} WITH replication = {{'class': 'SimpleStrategy', 'replication_factor': {}}}",
                    self.target.namespace, self.replication_factor
                ),
                Vec::new(),
                Op::EnsureNamespace,
                true,
            ),
            self.statement(
                format!(
                    "CREATE TABLE IF NOT EXISTS {} (key text PRIMARY KEY, value text, etag text, last_modified timestamp)",
                    self.qualified
                ),
                Vec::new(),
                Op::EnsureContainer,
                true,
            ),
        ]
    }

    fn ping(&self) -> Statement {
        self.statement("SELECT release_version FROM system.local".to_string(), Vec::new(), Op::Ping, true)
    }

    fn translate(&self, operation: &Operation<'_>) -> Result<Statement> {
        match operation {
            Operation::Get { key } => {
                self.validate_key(key)?;
                Ok(self.statement(
                    format!("SELECT key, value, etag, last_modified FROM {} WHERE key = :key", self.qualified),
                    vec![("key".to_string(), json!(key))],
                    Op::Fetch { key: key.to_string() },
                    true,
                ))
            }
            Operation::Set { row, etag: None } => {
                self.validate_key(&row.key)?;
                Ok(self.statement(self.insert_text(""), row_params(row, ""), Op::Upsert { row: row.clone() }, false))
            }
            Operation::Set { row, etag: Some(expected) } => {
                self.validate_key(&row.key)?;
                let mut params = row_params(row, "");
                params.push(("expected".to_string(), json!(expected)));
                Ok(self.statement(
                    format!(
                        "UPDATE {} SET value = :value, etag = :etag, last_modified = :last_modified WHERE key = :key IF etag = :expected",
                        self.qualified
                    ),
                    params,
                    Op::CompareAndSet { row: row.clone(), expected: expected.to_string() },
                    false,
                ))
            }
            Operation::Delete { key, etag: None } => {
                self.validate_key(key)?;
                Ok(self.statement(
                    format!("DELETE FROM {} WHERE key = :key", self.qualified),
                    vec![("key".to_string(), json!(key))],
                    Op::Delete { key: key.to_string() },
                    true,
                ))
            }
            Operation::Delete { key, etag: Some(expected) } => {
                self.validate_key(key)?;
                Ok(self.statement(
                    format!("DELETE FROM {} WHERE key = :key IF etag = :expected", self.qualified),
                    vec![("key".to_string(), json!(key)), ("expected".to_string(), json!(expected))],
                    Op::CompareAndDelete { key: key.to_string(), expected: expected.to_string() },
                    false,
                ))
            }
            Operation::Query(query) => self.query(query),
        }
    }

    fn batch_set(&self, rows: &[RowWrite]) -> Result<Option<Statement>> {
        if rows.is_empty() {
            return Err(Error::Validation("batch must contain at least one row".to_string()));
        }
        let mut text = String::from("BEGIN BATCH\n");
        let mut params = Vec::new();
        for (i, row) in rows.iter().enumerate() {
            self.validate_key(&row.key)?;
            let suffix = i.to_string();
            text.push_str("  ");
            text.push_str(&self.insert_text(&suffix));
            text.push_str(";\n");
            params.extend(row_params(row, &suffix));
        }
        text.push_str("APPLY BATCH");
        let ops = rows.iter().map(|row| Op::Upsert { row: row.clone() }).collect();
        Ok(Some(self.statement(text, params, Op::Batch { ops }, false)))
    }

    fn batch_delete(&self, keys: &[&str]) -> Result<Option<Statement>> {
        if keys.is_empty() {
            return Err(Error::Validation("batch must contain at least one key".to_string()));
        }
        let mut text = String::from("BEGIN BATCH\n");
        let mut params = Vec::new();
        for (i, key) in keys.iter().enumerate() {
            self.validate_key(key)?;
            text.push_str(&format!("  DELETE FROM {} WHERE key = :key{};\n", self.qualified, i));
            params.push((format!("key{}", i), json!(key)));
        }
        text.push_str("APPLY BATCH");
        let ops = keys.iter().map(|key| Op::Delete { key: key.to_string() }).collect();
        Ok(Some(self.statement(text, params, Op::Batch { ops }, true)))
    }

    fn supports_offset_paging(&self) -> bool {
        false
    }

    fn max_key_len(&self) -> usize {
        MAX_KEY_LEN
    }
}

fn row_params(row: &RowWrite, suffix: &str) -> Vec<(String, Value)> {
    vec![
        (format!("key{}", suffix), json!(row.key)),
        (format!("value{}", suffix), json!(row.value)),
        (format!("etag{}", suffix), json!(row.etag)),
        (format!("last_modified{}", suffix), json!(row.last_modified_ms)),
    ]
}

fn require_string_keys(values: &[Value]) -> Result<()> {
    if values.iter().all(Value::is_string) {
        Ok(())
    } else {
        Err(Error::Validation(format!("'{}' can only be compared with strings", KEY_FIELD)))
    }
}

fn describe(filter: &QueryFilter) -> String {
    match filter {
        QueryFilter::Compare { op, field, .. } => format!("{} on '{}'", op.name(), field),
        QueryFilter::In { field, .. } => format!("IN on '{}'", field),
        QueryFilter::And(_) => "AND".to_string(),
        QueryFilter::Or(_) => "OR".to_string(),
    }
}

use serde_json::{json, Value};
use crate::config::BackendKind;
use crate::query::{path_segments, CompareOp, Query, QueryFilter, SortOrder, KEY_FIELD};
use crate::translate::{offset_from_token, Op, Operation, RowWrite, Statement, Target, Translator};
use crate::{Error, Features, Result};

/// Vertex ids are `FIXED_STRING(256)`.
const MAX_KEY_LEN: usize = 256;

/// Translator for NebulaGraph-compatible graph stores.
///
/// Every entry is a vertex keyed by the state key and carrying one tag with
/// `value`, `etag` and `last_modified` properties. Etag-guarded sets use
/// `UPDATE VERTEX ... WHEN`, which the storage layer applies atomically.
/// Guarded deletes are a fetch-filter-delete pipeline. There are no
/// multi-statement transactions, so bulk writes are never batched.
pub struct NgqlTranslator {
    target: Target,
}

impl NgqlTranslator {
    pub fn new(target: Target) -> Self {
        Self { target }
    }

    fn tag(&self) -> &str {
        &self.target.container
    }

    fn statement(&self, body: String, params: Vec<(String, Value)>, op: Op, idempotent: bool) -> Statement {
        Statement {
            text: format!("USE {}; {}", self.target.namespace, body),
            params,
            target: self.target.clone(),
            op,
            idempotent,
        }
    }

    fn set_clause(&self) -> &'static str {
        "SET value = $value, etag = $etag, last_modified = $last_modified"
    }

    fn field_expr(&self, field: &str) -> Result<String> {
        if field == KEY_FIELD {
            return Ok("id(v)".to_string());
        }
        let mut expr = format!("json_extract(v.{}.value)", self.tag());
        for segment in path_segments(field) {
            if segment.contains(['"', '\\']) {
                return Err(Error::Validation(format!("field segment '{}' cannot be addressed", segment)));
            }
            expr.push_str(&format!("[\"{}\"]", segment));
        }
        Ok(expr)
    }

    fn filter_expr(&self, filter: &QueryFilter, params: &mut Vec<(String, Value)>) -> Result<String> {
        match filter {
            QueryFilter::Compare { op, field, value } => {
                require_scalar(value)?;
                let name = format!("p{}", params.len());
                params.push((name.clone(), value.clone()));
                Ok(format!("{} {} ${}", self.field_expr(field)?, operator(*op), name))
            }
            QueryFilter::In { field, values } => {
                for v in values {
                    require_scalar(v)?;
                }
                let name = format!("p{}", params.len());
                params.push((name.clone(), Value::Array(values.clone())));
                Ok(format!("{} IN ${}", self.field_expr(field)?, name))
            }
            QueryFilter::And(children) => self.combine(children, " AND ", params),
            QueryFilter::Or(children) => self.combine(children, " OR ", params),
        }
    }

    fn combine(&self, children: &[QueryFilter], joiner: &str, params: &mut Vec<(String, Value)>) -> Result<String> {
        if children.is_empty() {
            return Err(Error::Validation("AND/OR requires at least one filter".to_string()));
        }
        let parts = children
            .iter()
            .map(|child| self.filter_expr(child, params))
            .collect::<Result<Vec<_>>>()?;
        Ok(format!("({})", parts.join(joiner)))
    }

    fn query(&self, query: &Query) -> Result<Statement> {
        query.validate()?;
        let offset = offset_from_token(query.token())?;
        let tag = self.tag();

        let mut params = Vec::new();
        let mut body = format!("MATCH (v:{})", tag);
        if let Some(filter) = &query.filter {
            body.push_str(" WHERE ");
            body.push_str(&self.filter_expr(filter, &mut params)?);
        }
        body.push_str(&format!(
            " RETURN id(v) AS key, v.{t}.value AS value, v.{t}.etag AS etag, v.{t}.last_modified AS last_modified",
            t = tag
        ));

        let mut order = Vec::new();
        for (i, sort) in query.sort.iter().enumerate() {
            body.push_str(&format!(", {} AS s{}", self.field_expr(&sort.key)?, i));
            let dir = match sort.order {
                SortOrder::Asc => "ASC",
                SortOrder::Desc => "DESC",
            };
            order.push(format!("s{} {}", i, dir));
        }
        if !order.is_empty() {
            body.push_str(&format!(" ORDER BY {}", order.join(", ")));
        }
        if offset > 0 {
            body.push_str(&format!(" SKIP {}", offset));
        }
        if let Some(limit) = query.limit() {
            body.push_str(&format!(" LIMIT {}", limit));
        }

        let op = Op::Select {
            filter: query.filter.clone(),
            sort: query.sort.clone(),
            offset,
            limit: query.limit(),
        };
        Ok(self.statement(body, params, op, true))
    }
}

impl Translator for NgqlTranslator {
    fn kind(&self) -> BackendKind {
        BackendKind::Graph
    }

    fn features(&self) -> Features {
        Features {
            etag: true,
            transactional: false,
            query_api: true,
        }
    }

    fn schema(&self) -> Vec<Statement> {
        let tag = self.tag();
        vec![
            Statement {
                text: format!(
                    "CREATE SPACE IF NOT EXISTS {}(vid_type = FIXED_STRING({}))",
                    self.target.namespace, MAX_KEY_LEN
                ),
                params: Vec::new(),
                target: self.target.clone(),
                op: Op::EnsureNamespace,
                idempotent: true,
            },
            self.statement(
                format!("CREATE TAG IF NOT EXISTS {}(value string, etag string, last_modified int)", tag),
                Vec::new(),
                Op::EnsureContainer,
                true,
            ),
            self.statement(
                format!("CREATE TAG INDEX IF NOT EXISTS {t}_index ON {t}()", t = tag),
                Vec::new(),
                Op::EnsureIndex,
                true,
            ),
        ]
    }

    fn ping(&self) -> Statement {
        Statement {
            text: "YIELD 1".to_string(),
            params: Vec::new(),
            target: self.target.clone(),
            op: Op::Ping,
            idempotent: true,
        }
    }

    fn translate(&self, operation: &Operation<'_>) -> Result<Statement> {
        let tag = self.tag();
        match operation {
            Operation::Get { key } => {
                self.validate_key(key)?;
                Ok(self.statement(
                    format!(
                        "FETCH PROP ON {t} $key YIELD id(vertex) AS key, {t}.value AS value, {t}.etag AS etag, {t}.last_modified AS last_modified",
                        t = tag
                    ),
                    vec![("key".to_string(), json!(key))],
                    Op::Fetch { key: key.to_string() },
                    true,
                ))
            }
            Operation::Set { row, etag: None } => {
                self.validate_key(&row.key)?;
                Ok(self.statement(
                    format!("UPSERT VERTEX ON {} $key {}", tag, self.set_clause()),
                    row_params(row),
                    Op::Upsert { row: row.clone() },
                    false,
                ))
            }
            Operation::Set { row, etag: Some(expected) } => {
                self.validate_key(&row.key)?;
                let mut params = row_params(row);
                params.push(("expected".to_string(), json!(expected)));
                Ok(self.statement(
                    format!("UPDATE VERTEX ON {} $key {} WHEN etag == $expected YIELD etag AS etag", tag, self.set_clause()),
                    params,
                    Op::CompareAndSet { row: row.clone(), expected: expected.to_string() },
                    false,
                ))
            }
            Operation::Delete { key, etag: None } => {
                self.validate_key(key)?;
                Ok(self.statement(
                    "DELETE VERTEX $key WITH EDGE".to_string(),
                    vec![("key".to_string(), json!(key))],
                    Op::Delete { key: key.to_string() },
                    true,
                ))
            }
            Operation::Delete { key, etag: Some(expected) } => {
                self.validate_key(key)?;
                Ok(self.statement(
                    format!(
                        "FETCH PROP ON {t} $key YIELD id(vertex) AS id, {t}.etag AS etag | YIELD $-.id AS id WHERE $-.etag == $expected | DELETE VERTEX $-.id WITH EDGE",
                        t = tag
                    ),
                    vec![("key".to_string(), json!(key)), ("expected".to_string(), json!(expected))],
                    Op::CompareAndDelete { key: key.to_string(), expected: expected.to_string() },
                    false,
                ))
            }
            Operation::Query(query) => self.query(query),
        }
    }

    fn batch_set(&self, _rows: &[RowWrite]) -> Result<Option<Statement>> {
        Ok(None)
    }

    fn batch_delete(&self, _keys: &[&str]) -> Result<Option<Statement>> {
        Ok(None)
    }

    fn supports_offset_paging(&self) -> bool {
        true
    }

    fn max_key_len(&self) -> usize {
        MAX_KEY_LEN
    }
}

fn row_params(row: &RowWrite) -> Vec<(String, Value)> {
    vec![
        ("key".to_string(), json!(row.key)),
        ("value".to_string(), json!(row.value)),
        ("etag".to_string(), json!(row.etag)),
        ("last_modified".to_string(), json!(row.last_modified_ms)),
    ]
}

fn operator(op: CompareOp) -> &'static str {
    match op {
        CompareOp::Eq => "==",
        CompareOp::Neq => "!=",
        CompareOp::Gt => ">",
        CompareOp::Gte => ">=",
        CompareOp::Lt => "<",
        CompareOp::Lte => "<=",
    }
}

/// nGQL compares scalars only; nested documents and nulls cannot be matched reliably.
fn require_scalar(value: &Value) -> Result<()> {
    match value {
        Value::String(_) | Value::Number(_) | Value::Bool(_) => Ok(()),
        other => Err(Error::UnsupportedQuery(format!(
            "graph backend cannot compare against {}",
            match other {
                Value::Null => "null",
                Value::Array(_) => "an array",
                _ => "an object",
            }
        ))),
    }
}

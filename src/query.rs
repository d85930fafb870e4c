//! Backend-agnostic query model.
//!
//! Queries arrive as the host's JSON query document:
//!
//! ```json
//! { "filter": { "AND": [ { "EQ": { "person.org": "Dev Ops" } }, { "IN": { "state": ["CA", "WA"] } } ] },
//!   "sort": [ { "key": "state", "order": "DESC" } ],
//!   "page": { "limit": 10 } }
//! ```
//!
//! Field names are dot-separated paths into the JSON value. The pseudo-field
//! [`KEY_FIELD`] addresses the entry key itself.

use std::borrow::Cow;
use std::cmp::Ordering;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use crate::{Error, Result};

/// Pseudo-field naming the state key rather than a path in the value.
pub const KEY_FIELD: &str = "_key";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CompareOp {
    pub fn name(&self) -> &'static str {
        match self {
            CompareOp::Eq => "EQ",
            CompareOp::Neq => "NEQ",
            CompareOp::Gt => "GT",
            CompareOp::Gte => "GTE",
            CompareOp::Lt => "LT",
            CompareOp::Lte => "LTE",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "EQ" => Some(CompareOp::Eq),
            "NEQ" => Some(CompareOp::Neq),
            "GT" => Some(CompareOp::Gt),
            "GTE" => Some(CompareOp::Gte),
            "LT" => Some(CompareOp::Lt),
            "LTE" => Some(CompareOp::Lte),
            _ => None,
        }
    }
}

/// A predicate tree over entry attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum QueryFilter {
    Compare { op: CompareOp, field: String, value: Value },
    In { field: String, values: Vec<Value> },
    And(Vec<QueryFilter>),
    Or(Vec<QueryFilter>),
}

impl QueryFilter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        QueryFilter::Compare { op: CompareOp::Eq, field: field.into(), value: value.into() }
    }

    /// Parses one node of the JSON filter document.
    pub fn from_json(doc: &Value) -> Result<Self> {
        let (op, body) = single_entry(doc, "filter")?;
        match op.as_str() {
            "AND" | "OR" => {
                let children = body
                    .as_array()
                    .ok_or_else(|| Error::Validation(format!("{} expects an array of filters", op)))?;
                if children.is_empty() {
                    return Err(Error::Validation(format!("{} requires at least one filter", op)));
                }
                let parsed = children.iter().map(QueryFilter::from_json).collect::<Result<Vec<_>>>()?;
                Ok(if op == "AND" { QueryFilter::And(parsed) } else { QueryFilter::Or(parsed) })
            }
            "IN" => {
                let (field, values) = single_entry(body, "IN")?;
                validate_field(&field)?;
                let values = values
                    .as_array()
                    .ok_or_else(|| Error::Validation("IN expects an array of values".to_string()))?;
                if values.is_empty() {
                    return Err(Error::Validation("IN requires at least one value".to_string()));
                }
                Ok(QueryFilter::In { field, values: values.clone() })
            }
            name => {
                let op = CompareOp::from_name(name)
                    .ok_or_else(|| Error::Validation(format!("unknown filter operator '{}'", name)))?;
                let (field, value) = single_entry(body, name)?;
                validate_field(&field)?;
                Ok(QueryFilter::Compare { op, field, value: value.clone() })
            }
        }
    }

    pub fn to_json(&self) -> Value {
        let mut node = Map::new();
        match self {
            QueryFilter::Compare { op, field, value } => {
                let mut inner = Map::new();
                inner.insert(field.clone(), value.clone());
                node.insert(op.name().to_string(), Value::Object(inner));
            }
            QueryFilter::In { field, values } => {
                let mut inner = Map::new();
                inner.insert(field.clone(), Value::Array(values.clone()));
                node.insert("IN".to_string(), Value::Object(inner));
            }
            QueryFilter::And(children) => {
                node.insert("AND".to_string(), Value::Array(children.iter().map(|c| c.to_json()).collect()));
            }
            QueryFilter::Or(children) => {
                node.insert("OR".to_string(), Value::Array(children.iter().map(|c| c.to_json()).collect()));
            }
        }
        Value::Object(node)
    }

    /// Evaluates the predicate against one entry.
    pub fn matches(&self, key: &str, doc: &Value) -> bool {
        match self {
            QueryFilter::Compare { op, field, value } => {
                // A missing field never matches, NEQ included.
                let Some(actual) = resolve(field, key, doc) else {
                    return false;
                };
                match op {
                    CompareOp::Eq => &*actual == value,
                    CompareOp::Neq => &*actual != value,
                    CompareOp::Gt => compare(&actual, value) == Some(Ordering::Greater),
                    CompareOp::Gte => matches!(compare(&actual, value), Some(Ordering::Greater | Ordering::Equal)),
                    CompareOp::Lt => compare(&actual, value) == Some(Ordering::Less),
                    CompareOp::Lte => matches!(compare(&actual, value), Some(Ordering::Less | Ordering::Equal)),
                }
            }
            QueryFilter::In { field, values } => match resolve(field, key, doc) {
                Some(actual) => values.iter().any(|v| v == &*actual),
                None => false,
            },
            QueryFilter::And(children) => children.iter().all(|c| c.matches(key, doc)),
            QueryFilter::Or(children) => children.iter().any(|c| c.matches(key, doc)),
        }
    }
}

impl TryFrom<Value> for QueryFilter {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        QueryFilter::from_json(&value)
    }
}

impl From<QueryFilter> for Value {
    fn from(filter: QueryFilter) -> Self {
        filter.to_json()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sort {
    pub key: String,
    #[serde(default)]
    pub order: SortOrder,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Page {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    #[serde(default, deserialize_with = "deserialize_filter", skip_serializing_if = "Option::is_none")]
    pub filter: Option<QueryFilter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sort: Vec<Sort>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<Page>,
}

impl Query {
    pub fn filtered(filter: QueryFilter) -> Self {
        Self { filter: Some(filter), ..Default::default() }
    }

    /// Checks the parts serde cannot: sort paths and page bounds.
    pub fn validate(&self) -> Result<()> {
        for s in &self.sort {
            validate_field(&s.key)?;
        }
        if let Some(page) = &self.page {
            if page.limit == Some(0) {
                return Err(Error::Validation("page limit must be greater than zero".to_string()));
            }
        }
        Ok(())
    }

    pub fn limit(&self) -> Option<usize> {
        self.page.as_ref().and_then(|p| p.limit)
    }

    pub fn token(&self) -> Option<&str> {
        self.page.as_ref().and_then(|p| p.token.as_deref())
    }
}

fn deserialize_filter<'de, D>(deserializer: D) -> std::result::Result<Option<QueryFilter>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    match raw {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(ref map)) if map.is_empty() => Ok(None),
        Some(doc) => QueryFilter::from_json(&doc).map(Some).map_err(serde::de::Error::custom),
    }
}

fn single_entry<'a>(doc: &'a Value, what: &str) -> Result<(String, &'a Value)> {
    let map = doc
        .as_object()
        .ok_or_else(|| Error::Validation(format!("{} must be an object", what)))?;
    let mut entries = map.iter();
    match (entries.next(), entries.next()) {
        (Some((k, v)), None) => Ok((k.clone(), v)),
        _ => Err(Error::Validation(format!("{} must have exactly one entry", what))),
    }
}

fn validate_field(field: &str) -> Result<()> {
    if field.is_empty() || field.split('.').any(|segment| segment.is_empty()) {
        return Err(Error::Validation(format!("invalid field path '{}'", field)));
    }
    Ok(())
}

/// Splits a dotted field path into its segments.
pub fn path_segments(field: &str) -> impl Iterator<Item = &str> {
    field.split('.')
}

/// Looks up a field on an entry, treating [`KEY_FIELD`] as the key.
pub fn resolve<'a>(field: &str, key: &str, doc: &'a Value) -> Option<Cow<'a, Value>> {
    if field == KEY_FIELD {
        return Some(Cow::Owned(Value::String(key.to_string())));
    }
    let mut current = doc;
    for segment in path_segments(field) {
        current = current.as_object()?.get(segment)?;
    }
    Some(Cow::Borrowed(current))
}

/// Orders two JSON scalars of the same type; mixed types are incomparable.
pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Ordering of two entries under a sort specification. Missing fields sort first.
pub fn order_by(sort: &[Sort], a: (&str, &Value), b: (&str, &Value)) -> Ordering {
    for s in sort {
        let left = resolve(&s.key, a.0, a.1);
        let right = resolve(&s.key, b.0, b.1);
        let ord = match (left, right) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(l), Some(r)) => compare(&l, &r).unwrap_or(Ordering::Equal),
        };
        let ord = match s.order {
            SortOrder::Asc => ord,
            SortOrder::Desc => ord.reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

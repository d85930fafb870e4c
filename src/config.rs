//! Typed component configuration.
//!
//! The host hands `init` a flat string map. It is parsed exactly once into a
//! [`StoreConfig`]; unknown keys and malformed values are rejected up front.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::{Error, Result};

/// Which statement dialect is wired into the adapter. Fixed for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Cassandra-compatible store spoken to in CQL.
    WideColumn,
    /// NebulaGraph-compatible store spoken to in nGQL.
    Graph,
}

impl BackendKind {
    pub fn default_port(&self) -> u16 {
        match self {
            BackendKind::WideColumn => 9042,
            BackendKind::Graph => 9669,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::WideColumn => write!(f, "wide-column"),
            BackendKind::Graph => write!(f, "graph"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wide-column" | "widecolumn" | "cassandra" | "cql" => Ok(BackendKind::WideColumn),
            "graph" | "nebula" | "ngql" => Ok(BackendKind::Graph),
            other => Err(Error::Validation(format!("unknown backend kind '{}'", other))),
        }
    }
}

/// Parameters a [`crate::backend::Connector`] needs to open a session.
#[derive(Clone)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub connect_timeout: Duration,
}

impl fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

pub const DEFAULT_KEYSPACE: &str = "dapr";
pub const DEFAULT_TABLE: &str = "state";
pub const DEFAULT_POOL_SIZE: usize = 4;
pub const MAX_POOL_SIZE: usize = 256;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_OP_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_MAX_RETRIES: u32 = 2;
const MAX_RETRIES_LIMIT: u32 = 10;
const MAX_IDENTIFIER_LEN: usize = 48;

#[derive(Clone)]
pub struct StoreConfig {
    pub backend: BackendKind,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Logical container: CQL keyspace or graph space.
    pub keyspace: String,
    /// Physical container: CQL table or graph tag.
    pub table: String,
    pub pool_size: usize,
    pub connect_timeout: Duration,
    pub op_timeout: Duration,
    pub max_retries: u32,
    pub replication_factor: u32,
    pub encryption_key: Option<[u8; 32]>,
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("backend", &self.backend)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("keyspace", &self.keyspace)
            .field("table", &self.table)
            .field("pool_size", &self.pool_size)
            .field("connect_timeout", &self.connect_timeout)
            .field("op_timeout", &self.op_timeout)
            .field("max_retries", &self.max_retries)
            .field("replication_factor", &self.replication_factor)
            .field("encryption_key", &self.encryption_key.map(|_| "<redacted>"))
            .finish()
    }
}

impl StoreConfig {
    /// Parses the host-supplied metadata map. Keys are matched case-insensitively.
    pub fn from_metadata(backend: BackendKind, metadata: &HashMap<String, String>) -> Result<Self> {
        let mut fields: HashMap<&'static str, (String, String)> = HashMap::new();
        for (raw_key, value) in metadata {
            let canonical = canonical_key(raw_key)
                .ok_or_else(|| Error::Validation(format!("unknown metadata key '{}'", raw_key)))?;
            if let Some((previous, _)) = fields.insert(canonical, (raw_key.clone(), value.clone())) {
                return Err(Error::Validation(format!(
                    "metadata keys '{}' and '{}' both set '{}'",
                    previous, raw_key, canonical
                )));
            }
        }
        let take = |name: &str| fields.get(name).map(|(_, v)| v.trim().to_string());

        let host = take("host")
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::Validation("missing required metadata 'host'".to_string()))?;
        let port = match take("port") {
            Some(p) => parse_number::<u16>("port", &p)?,
            None => backend.default_port(),
        };
        if port == 0 {
            return Err(Error::Validation("port must be non-zero".to_string()));
        }

        let keyspace = take("keyspace").unwrap_or_else(|| DEFAULT_KEYSPACE.to_string());
        validate_identifier("keyspace", &keyspace)?;
        let table = take("tableOrTag").unwrap_or_else(|| DEFAULT_TABLE.to_string());
        validate_identifier("tableOrTag", &table)?;

        let pool_size = match take("poolSize") {
            Some(v) => parse_number::<usize>("poolSize", &v)?,
            None => DEFAULT_POOL_SIZE,
        };
        if pool_size == 0 || pool_size > MAX_POOL_SIZE {
            return Err(Error::Validation(format!("poolSize must be between 1 and {}", MAX_POOL_SIZE)));
        }

        let connect_timeout = positive_millis("connectTimeoutMs", take("connectTimeoutMs"), DEFAULT_CONNECT_TIMEOUT_MS)?;
        let op_timeout = positive_millis("opTimeoutMs", take("opTimeoutMs"), DEFAULT_OP_TIMEOUT_MS)?;

        let max_retries = match take("maxRetries") {
            Some(v) => parse_number::<u32>("maxRetries", &v)?,
            None => DEFAULT_MAX_RETRIES,
        };
        if max_retries > MAX_RETRIES_LIMIT {
            return Err(Error::Validation(format!("maxRetries must be at most {}", MAX_RETRIES_LIMIT)));
        }

        let replication_factor = match take("replicationFactor") {
            Some(v) => parse_number::<u32>("replicationFactor", &v)?,
            None => 1,
        };
        if replication_factor == 0 {
            return Err(Error::Validation("replicationFactor must be at least 1".to_string()));
        }

        let encryption_key = match take("encryptionKey") {
            Some(hex_key) => Some(parse_key(&hex_key)?),
            None => None,
        };

        Ok(Self {
            backend,
            host,
            port,
            username: take("username").filter(|u| !u.is_empty()),
            password: fields.get("password").map(|(_, v)| v.clone()).filter(|p| !p.is_empty()),
            keyspace,
            table,
            pool_size,
            connect_timeout,
            op_timeout,
            max_retries,
            replication_factor,
            encryption_key,
        })
    }

    pub fn connect_params(&self) -> ConnectParams {
        ConnectParams {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            password: self.password.clone(),
            connect_timeout: self.connect_timeout,
        }
    }
}

fn canonical_key(raw: &str) -> Option<&'static str> {
    let key = match raw.trim().to_ascii_lowercase().as_str() {
        "host" => "host",
        "port" => "port",
        "username" => "username",
        "password" => "password",
        "keyspace" | "namespace" | "space" => "keyspace",
        "tableortag" | "table" | "tag" => "tableOrTag",
        "poolsize" => "poolSize",
        "connecttimeoutms" => "connectTimeoutMs",
        "optimeoutms" => "opTimeoutMs",
        "maxretries" => "maxRetries",
        "replicationfactor" => "replicationFactor",
        "encryptionkey" => "encryptionKey",
        _ => return None,
    };
    Some(key)
}

fn parse_number<T: FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.parse::<T>()
        .map_err(|_| Error::Validation(format!("metadata '{}' is not a valid number: '{}'", name, raw)))
}

fn positive_millis(name: &str, raw: Option<String>, default: u64) -> Result<Duration> {
    let ms = match raw {
        Some(v) => parse_number::<u64>(name, &v)?,
        None => default,
    };
    if ms == 0 {
        return Err(Error::Validation(format!("{} must be greater than zero", name)));
    }
    Ok(Duration::from_millis(ms))
}

/// Identifiers are interpolated into statements, so only a conservative alphabet is accepted.
fn validate_identifier(name: &str, ident: &str) -> Result<()> {
    let mut chars = ident.chars();
    let valid_head = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
    let valid_tail = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid_head || !valid_tail || ident.len() > MAX_IDENTIFIER_LEN {
        return Err(Error::Validation(format!(
            "{} '{}' must match [A-Za-z_][A-Za-z0-9_]* and be at most {} characters",
            name, ident, MAX_IDENTIFIER_LEN
        )));
    }
    Ok(())
}

fn parse_key(hex_key: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hex_key)
        .map_err(|e| Error::Validation(format!("encryptionKey is not valid hex: {}", e)))?;
    bytes
        .try_into()
        .map_err(|_| Error::Validation("encryptionKey must be 32 bytes (64 hex characters)".to_string()))
}

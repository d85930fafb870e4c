/// Line-oriented servers.
///
/// [`ComponentServer`] exposes a [`crate::StateStore`] to its host over
/// newline-delimited JSON. [`EngineServer`] serves a [`crate::engine::MemEngine`]
/// to remote [`crate::backend::TcpConnector`] sessions.
pub mod component;
pub mod engine;

pub use component::ComponentServer;
pub use engine::EngineServer;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use crate::Error;

/// Connections served at once before new ones are rejected.
pub const DEFAULT_MAX_CONNECTIONS: usize = 100;

/// One inbound call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
    /// Deadline for this call. Without it each backend attempt, waiting for a
    /// connection included, is still bounded by the store's operation timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// One reply line: `{"ok": ...}` or `{"error": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    Ok(Value),
    Error(WireError),
}

impl From<crate::Result<Value>> for Response {
    fn from(result: crate::Result<Value>) -> Self {
        match result {
            Ok(value) => Response::Ok(value),
            Err(e) => Response::Error(WireError::from(&e)),
        }
    }
}

/// An [`Error`] as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
}

impl From<&Error> for WireError {
    fn from(e: &Error) -> Self {
        let mut wire = WireError {
            kind: e.kind().to_string(),
            message: e.to_string(),
            key: None,
            expected: None,
            actual: None,
        };
        match e {
            Error::Validation(m)
            | Error::NotFound(m)
            | Error::Connection(m)
            | Error::Timeout(m)
            | Error::UnsupportedQuery(m)
            | Error::Internal(m) => wire.message = m.clone(),
            Error::Conflict { key, expected, actual } => {
                wire.key = Some(key.clone());
                wire.expected = expected.clone();
                wire.actual = actual.clone();
            }
            _ => {}
        }
        wire
    }
}

impl WireError {
    /// Rebuilds the typed error. Kinds that cannot be reconstructed become `Internal`.
    pub fn into_error(self) -> Error {
        match self.kind.as_str() {
            "validation" => Error::Validation(self.message),
            "not_found" => Error::NotFound(self.message),
            "conflict" => Error::Conflict {
                key: self.key.unwrap_or_default(),
                expected: self.expected,
                actual: self.actual,
            },
            "connection" => Error::Connection(self.message),
            "timeout" => Error::Timeout(self.message),
            "unsupported_query" => Error::UnsupportedQuery(self.message),
            "not_initialized" => Error::NotInitialized,
            "closed" => Error::Closed,
            "io" => Error::Io(std::io::Error::new(std::io::ErrorKind::Other, self.message)),
            _ => Error::Internal(self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_response_shapes() {
        let ok = Response::from(Ok::<_, Error>(json!("PONG")));
        assert_eq!(serde_json::to_value(&ok).unwrap(), json!({ "ok": "PONG" }));

        let err = Response::from(Err::<Value, _>(Error::Conflict {
            key: "k".into(),
            expected: Some("a".into()),
            actual: None,
        }));
        let wire = serde_json::to_value(&err).unwrap();
        assert_eq!(wire["error"]["kind"], "conflict");
        assert_eq!(wire["error"]["expected"], "a");
        assert!(wire["error"].get("actual").is_none());
    }

    #[test]
    fn test_wire_error_rebuilds_kind() {
        let err = Error::UnsupportedQuery("sort".into());
        let rebuilt = WireError::from(&err).into_error();
        assert!(matches!(rebuilt, Error::UnsupportedQuery(m) if m == "sort"));

        let rebuilt = WireError::from(&Error::Closed).into_error();
        assert!(matches!(rebuilt, Error::Closed));

        let conflict = Error::Conflict { key: "k".into(), expected: Some("1".into()), actual: Some("2".into()) };
        match WireError::from(&conflict).into_error() {
            Error::Conflict { key, expected, actual } => {
                assert_eq!(key, "k");
                assert_eq!(expected.as_deref(), Some("1"));
                assert_eq!(actual.as_deref(), Some("2"));
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_request_defaults() {
        let req: Request = serde_json::from_str(r#"{"method":"ping"}"#).unwrap();
        assert_eq!(req.method, "ping");
        assert!(req.params.is_null());
        assert!(req.timeout_ms.is_none());
    }
}

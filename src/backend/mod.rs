//! Outbound transport seam.
//!
//! The adapter never talks to a database directly. It goes through a
//! [`Connector`] that opens [`Session`]s able to run translated statements.
//! Native drivers plug in here; the crate ships the embedded
//! [`crate::engine::MemEngine`] and the [`tcp::TcpConnector`].

pub mod tcp;

pub use tcp::TcpConnector;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use crate::config::ConnectParams;
use crate::translate::Statement;

/// Errors raised by a backend transport, before normalization.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum BackendError {
    /// No session could be opened.
    #[error("backend unreachable: {0}")]
    Unreachable(String),
    /// An established session broke mid-call.
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("backend timed out")]
    Timeout,
    /// The backend refused the statement (syntax, missing schema).
    #[error("statement rejected: {0}")]
    Rejected(String),
    /// The backend rejected the request contents.
    #[error("invalid request: {0}")]
    Invalid(String),
    /// The backend cannot evaluate this statement shape.
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// The response could not be interpreted.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl BackendError {
    /// Whether the session that produced this error must not be reused.
    pub fn breaks_session(&self) -> bool {
        matches!(self, BackendError::Transport(_) | BackendError::Timeout | BackendError::Protocol(_))
    }
}

/// One row returned by a read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub key: String,
    /// JSON text as stored.
    pub value: String,
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default)]
    pub last_modified_ms: Option<i64>,
}

/// What a statement produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Done,
    Rows { rows: Vec<Row> },
    /// Result of a conditional write. `current_etag` is what the backend holds now.
    Applied {
        applied: bool,
        #[serde(default)]
        current_etag: Option<String>,
    },
}

/// Wire envelope for statement replies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reply {
    Ok(Outcome),
    Err(BackendError),
}

impl From<Result<Outcome, BackendError>> for Reply {
    fn from(result: Result<Outcome, BackendError>) -> Self {
        match result {
            Ok(outcome) => Reply::Ok(outcome),
            Err(e) => Reply::Err(e),
        }
    }
}

impl From<Reply> for Result<Outcome, BackendError> {
    fn from(reply: Reply) -> Self {
        match reply {
            Reply::Ok(outcome) => Ok(outcome),
            Reply::Err(e) => Err(e),
        }
    }
}

/// A live backend session. Used by one operation at a time.
#[async_trait]
pub trait Session: Send {
    async fn execute(&mut self, statement: &Statement) -> Result<Outcome, BackendError>;

    async fn close(&mut self);
}

/// Opens sessions against a backend.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, params: &ConnectParams) -> Result<Box<dyn Session>, BackendError>;
}

//! Operation Executor.
//!
//! Runs one translated statement on a leased connection with a per-call
//! timeout, retries idempotent statements on transport failures and turns
//! every [`BackendError`] into the crate's [`Error`] taxonomy. Conditional
//! writes are never retried: after an ambiguous failure a second attempt
//! could apply the same etag twice.

use std::sync::Arc;
use std::time::Duration;
use log::{debug, error, warn};
use crate::backend::{BackendError, Outcome};
use crate::config::StoreConfig;
use crate::context::{Context, DoneReason};
use crate::pool::{ConnectionPool, PooledConnection};
use crate::translate::{Op, Statement};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct ExecPolicy {
    /// Upper bound for a single backend call.
    pub timeout: Duration,
    /// Extra attempts for idempotent statements.
    pub max_retries: u32,
    /// Base delay between attempts, multiplied by the attempt number.
    pub backoff: Duration,
}

impl Default for ExecPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_retries: 2,
            backoff: Duration::from_millis(50),
        }
    }
}

impl ExecPolicy {
    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            timeout: config.op_timeout,
            max_retries: config.max_retries,
            ..Default::default()
        }
    }
}

enum Failure {
    Interrupted(DoneReason),
    Backend(BackendError),
}

pub struct Executor {
    pool: Arc<ConnectionPool>,
    policy: ExecPolicy,
}

impl Executor {
    pub fn new(pool: Arc<ConnectionPool>, policy: ExecPolicy) -> Self {
        Self { pool, policy }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Leases a connection, runs the statement and releases the connection,
    /// retrying idempotent statements on connection and timeout errors.
    ///
    /// Each attempt, waiting for a connection included, is bounded by the
    /// policy timeout even when `ctx` carries no deadline.
    pub async fn execute(&self, ctx: &Context, statement: &Statement) -> Result<Outcome> {
        let retryable_op = statement.idempotent && !statement.op.is_conditional();
        let attempts = if retryable_op { self.policy.max_retries + 1 } else { 1 };
        let mut attempt = 0;
        loop {
            attempt += 1;
            let attempt_ctx = ctx.child_with_timeout(self.policy.timeout);
            let result = match self.pool.acquire(&attempt_ctx).await {
                Ok(mut conn) => {
                    let result = self.execute_on(&attempt_ctx, &mut conn, statement).await;
                    conn.release();
                    result
                }
                Err(e) => Err(e),
            };

            let err = match result {
                Ok(outcome) => return Ok(outcome),
                Err(err) => err,
            };
            let retryable = matches!(err, Error::Connection(_) | Error::Timeout(_)) && ctx.done_reason().is_none();
            if retryable && attempt < attempts {
                warn!(
                    "Retrying {} after attempt {}/{} failed: {}",
                    statement.op.name(),
                    attempt,
                    attempts,
                    err
                );
                self.backoff(ctx, attempt).await?;
                continue;
            }
            if !matches!(err, Error::Conflict { .. }) {
                warn!("{} failed after {} attempt(s): {}", statement.op.name(), attempt, err);
            }
            return Err(err);
        }
    }

    /// Runs the statement once on an already leased connection.
    ///
    /// A session that times out, is interrupted, or fails at the transport
    /// level is marked broken so the pool evicts it.
    pub async fn execute_on(&self, ctx: &Context, conn: &mut PooledConnection, statement: &Statement) -> Result<Outcome> {
        let budget = match ctx.remaining() {
            Some(remaining) => remaining.min(self.policy.timeout),
            None => self.policy.timeout,
        };
        debug!("Executing {}: {}", statement.op.name(), statement.text);

        let session = conn.session()?;
        let result = tokio::select! {
            biased;
            reason = ctx.done() => Err(Failure::Interrupted(reason)),
            res = tokio::time::timeout(budget, session.execute(statement)) => match res {
                Ok(inner) => inner.map_err(Failure::Backend),
                Err(_) => Err(Failure::Backend(BackendError::Timeout)),
            },
        };

        match result {
            Ok(outcome) => check_applied(statement, outcome),
            Err(Failure::Interrupted(reason)) => {
                conn.mark_broken();
                // The statement may or may not have reached the backend.
                Err(Error::Timeout(format!("{} during {}; outcome unknown", reason, statement.op.name())))
            }
            Err(Failure::Backend(e)) => {
                if e.breaks_session() {
                    conn.mark_broken();
                }
                Err(normalize(e, statement))
            }
        }
    }

    async fn backoff(&self, ctx: &Context, attempt: u32) -> Result<()> {
        let delay = self.policy.backoff * attempt;
        tokio::select! {
            biased;
            reason = ctx.done() => Err(Error::Timeout(format!("{} while backing off", reason))),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

/// Maps a backend failure into the store's error taxonomy.
pub fn normalize(err: BackendError, statement: &Statement) -> Error {
    let op = statement.op.name();
    match err {
        BackendError::Unreachable(msg) | BackendError::Transport(msg) => Error::Connection(msg),
        BackendError::Timeout => Error::Timeout(format!("backend did not answer {} in time", op)),
        BackendError::Invalid(msg) => Error::Validation(msg),
        BackendError::Unsupported(msg) => Error::UnsupportedQuery(msg),
        BackendError::Rejected(msg) => {
            error!("Backend rejected {} [{}]: {}", op, statement.text, msg);
            Error::Internal(format!("backend rejected {}: {}", op, msg))
        }
        BackendError::Protocol(msg) => {
            error!("Uninterpretable backend response to {} [{}]: {}", op, statement.text, msg);
            Error::Internal(format!("uninterpretable response to {}: {}", op, msg))
        }
    }
}

/// Turns a not-applied conditional write into [`Error::Conflict`].
fn check_applied(statement: &Statement, outcome: Outcome) -> Result<Outcome> {
    let current_etag = match &outcome {
        Outcome::Applied { applied: false, current_etag } => current_etag.clone(),
        _ => return Ok(outcome),
    };
    let (key, expected) = match &statement.op {
        Op::CompareAndSet { row, expected } => (&row.key, expected),
        Op::CompareAndDelete { key, expected } => (key, expected),
        other => {
            error!("Backend reported a conditional result for unconditional {}", other.name());
            return Err(Error::Internal(format!("unexpected conditional result for {}", other.name())));
        }
    };
    Err(Error::Conflict {
        key: key.clone(),
        expected: Some(expected.clone()),
        actual: current_etag,
    })
}

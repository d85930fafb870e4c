use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use async_trait::async_trait;
use statebridge::backend::{BackendError, Connector, Outcome, Session};
use statebridge::config::ConnectParams;
use statebridge::engine::MemEngine;
use statebridge::translate::Statement;

/// Wraps a [`MemEngine`] and breaks the next N statements with a transport failure.
#[derive(Clone)]
pub struct FlakyConnector {
    engine: MemEngine,
    failures: Arc<AtomicUsize>,
    executed: Arc<AtomicUsize>,
}

#[allow(dead_code)]
impl FlakyConnector {
    pub fn new(engine: MemEngine) -> Self {
        Self {
            engine,
            failures: Arc::new(AtomicUsize::new(0)),
            executed: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Statements that reached the engine.
    pub fn executed(&self) -> usize {
        self.executed.load(Ordering::SeqCst)
    }
}

struct FlakySession {
    inner: Box<dyn Session>,
    failures: Arc<AtomicUsize>,
    executed: Arc<AtomicUsize>,
}

#[async_trait]
impl Session for FlakySession {
    async fn execute(&mut self, statement: &Statement) -> Result<Outcome, BackendError> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(BackendError::Transport("injected failure".to_string()));
        }
        self.executed.fetch_add(1, Ordering::SeqCst);
        self.inner.execute(statement).await
    }

    async fn close(&mut self) {
        self.inner.close().await;
    }
}

#[async_trait]
impl Connector for FlakyConnector {
    async fn connect(&self, params: &ConnectParams) -> Result<Box<dyn Session>, BackendError> {
        let inner = self.engine.connect(params).await?;
        Ok(Box::new(FlakySession {
            inner,
            failures: self.failures.clone(),
            executed: self.executed.clone(),
        }))
    }
}

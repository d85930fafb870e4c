//! Connection Manager.
//!
//! A fixed number of permits bounds how many sessions exist at once. Idle
//! sessions are reused; new ones are opened lazily up to capacity. A lease is
//! returned on drop, so every exit path (success, error, cancellation, panic)
//! gives the permit back. Broken sessions are evicted instead of being returned.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use log::{debug, info, warn};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use crate::backend::{BackendError, Connector, Session};
use crate::config::ConnectParams;
use crate::context::Context;
use crate::{Error, Result};

pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    params: ConnectParams,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Box<dyn Session>>>,
    capacity: usize,
    live: AtomicUsize,
    closed: AtomicBool,
}

impl ConnectionPool {
    /// Opens a pool and eagerly establishes one session to prove the backend is reachable.
    pub async fn open(connector: Arc<dyn Connector>, params: ConnectParams, capacity: usize) -> Result<Arc<Self>> {
        if capacity == 0 {
            return Err(Error::Validation("pool capacity must be at least 1".to_string()));
        }
        let first = connector.connect(&params).await.map_err(|e| {
            Error::Connection(format!("cannot reach backend at {}:{}: {}", params.host, params.port, e))
        })?;
        info!("Connected to backend at {}:{} (pool capacity {})", params.host, params.port, capacity);

        Ok(Arc::new(Self {
            connector,
            params,
            permits: Arc::new(Semaphore::new(capacity)),
            idle: Mutex::new(vec![first]),
            capacity,
            live: AtomicUsize::new(1),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sessions currently open, leased or idle.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn idle(&self) -> usize {
        self.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }

    /// Permits not currently leased.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Leases a session, waiting for a free permit until the context ends.
    pub async fn acquire(self: &Arc<Self>, ctx: &Context) -> Result<PooledConnection> {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        let permit = tokio::select! {
            biased;
            reason = ctx.done() => {
                return Err(Error::Timeout(format!("{} while waiting for a backend connection", reason)));
            }
            permit = self.permits.clone().acquire_owned() => permit.map_err(|_| Error::Closed)?,
        };

        let reused = self.idle.lock().ok().and_then(|mut idle| idle.pop());
        let session = match reused {
            Some(session) => session,
            None => {
                let session = tokio::select! {
                    biased;
                    reason = ctx.done() => {
                        return Err(Error::Timeout(format!("{} while opening a backend connection", reason)));
                    }
                    res = self.connector.connect(&self.params) => res.map_err(|e| self.connect_error(e))?,
                };
                let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
                debug!("Opened backend session ({}/{} live)", live, self.capacity);
                session
            }
        };

        Ok(PooledConnection {
            session: Some(session),
            pool: Arc::clone(self),
            permit: Some(permit),
            broken: false,
        })
    }

    fn connect_error(&self, e: BackendError) -> Error {
        warn!("Failed to open backend session to {}:{}: {}", self.params.host, self.params.port, e);
        Error::Connection(e.to_string())
    }

    fn give_back(&self, session: Box<dyn Session>, broken: bool) {
        if !broken && !self.is_closed() {
            if let Ok(mut idle) = self.idle.lock() {
                idle.push(session);
                return;
            }
        }
        // Dropping the session closes its transport.
        drop(session);
        let live = self.live.fetch_sub(1, Ordering::SeqCst) - 1;
        if broken {
            warn!("Evicted broken backend session ({} live)", live);
        }
    }

    /// Stops handing out sessions and closes every idle one. Leased sessions
    /// are discarded when they come back.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.permits.close();
        let drained: Vec<Box<dyn Session>> = match self.idle.lock() {
            Ok(mut idle) => idle.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for mut session in drained {
            session.close().await;
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
        info!("Connection pool closed");
    }
}

/// A leased session. Returned to the pool on [`release`](Self::release) or drop.
pub struct PooledConnection {
    session: Option<Box<dyn Session>>,
    pool: Arc<ConnectionPool>,
    permit: Option<OwnedSemaphorePermit>,
    broken: bool,
}

impl PooledConnection {
    /// The leased session. Errors once the lease has been released.
    pub fn session(&mut self) -> Result<&mut (dyn Session + 'static)> {
        self.session
            .as_deref_mut()
            .ok_or_else(|| Error::Internal("connection already released".to_string()))
    }

    /// Marks the session as unusable; it will be evicted instead of reused.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Returns the session and its permit. Safe to call more than once.
    pub fn release(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.give_back(session, self.broken);
        }
        self.permit.take();
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemEngine;
    use std::time::Duration;

    fn params() -> ConnectParams {
        ConnectParams {
            host: "memory".into(),
            port: 1,
            username: None,
            password: None,
            connect_timeout: Duration::from_millis(100),
        }
    }

    async fn pool(capacity: usize) -> Arc<ConnectionPool> {
        ConnectionPool::open(Arc::new(MemEngine::new()), params(), capacity).await.unwrap()
    }

    #[tokio::test]
    async fn test_reuses_idle_sessions() {
        let pool = pool(2).await;
        assert_eq!(pool.live(), 1);
        {
            let _a = pool.acquire(&Context::background()).await.unwrap();
            assert_eq!(pool.idle(), 0);
            assert_eq!(pool.available(), 1);
        }
        assert_eq!(pool.idle(), 1);
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.live(), 1);
    }

    #[tokio::test]
    async fn test_opens_lazily_up_to_capacity() {
        let pool = pool(2).await;
        let ctx = Context::background();
        let a = pool.acquire(&ctx).await.unwrap();
        let b = pool.acquire(&ctx).await.unwrap();
        assert_eq!(pool.live(), 2);
        drop(a);
        drop(b);
        assert_eq!(pool.idle(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_pool_times_out() {
        let pool = pool(1).await;
        let _held = pool.acquire(&Context::background()).await.unwrap();
        let res = pool.acquire(&Context::with_timeout(Duration::from_millis(30))).await;
        assert!(matches!(res, Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn test_cancel_aborts_waiting() {
        let pool = pool(1).await;
        let _held = pool.acquire(&Context::background()).await.unwrap();
        let ctx = Context::background();
        let waiter = {
            let pool = pool.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { pool.acquire(&ctx).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        ctx.cancel();
        let res = waiter.await.unwrap();
        assert!(matches!(res, Err(Error::Timeout(msg)) if msg.contains("cancelled")));
    }

    #[tokio::test]
    async fn test_release_is_idempotent_and_broken_is_evicted() {
        let pool = pool(1).await;
        let mut conn = pool.acquire(&Context::background()).await.unwrap();
        conn.mark_broken();
        conn.release();
        conn.release();
        assert!(conn.session().is_err());
        drop(conn);
        assert_eq!(pool.live(), 0);
        assert_eq!(pool.idle(), 0);
        assert_eq!(pool.available(), 1);

        let _fresh = pool.acquire(&Context::background()).await.unwrap();
        assert_eq!(pool.live(), 1);
    }

    #[tokio::test]
    async fn test_close_rejects_acquire() {
        let pool = pool(1).await;
        pool.close().await;
        pool.close().await;
        assert_eq!(pool.live(), 0);
        assert!(matches!(pool.acquire(&Context::background()).await, Err(Error::Closed)));
    }
}

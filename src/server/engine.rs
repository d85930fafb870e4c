use std::sync::Arc;
use log::{debug, error, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use crate::backend::tcp::Hello;
use crate::backend::{BackendError, Outcome, Reply};
use crate::engine::MemEngine;
use crate::server::DEFAULT_MAX_CONNECTIONS;
use crate::translate::Statement;
use crate::Result;

/// Serves a [`MemEngine`] to remote sessions.
///
/// Each connection opens with a [`Hello`]; every following line is a
/// [`Statement`] answered by one [`Reply`].
pub struct EngineServer {
    engine: MemEngine,
    credentials: Option<Arc<(String, String)>>,
    semaphore: Arc<Semaphore>,
}

impl EngineServer {
    pub fn new(engine: MemEngine) -> Self {
        Self {
            engine,
            credentials: None,
            semaphore: Arc::new(Semaphore::new(DEFAULT_MAX_CONNECTIONS)),
        }
    }

    /// Requires every session to present these credentials.
    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some(Arc::new((username.to_string(), password.to_string())));
        self
    }

    pub async fn listen(&self, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("Engine listening on {} (TCP)", listener.local_addr()?);
        self.serve(listener).await
    }

    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (socket, peer) = listener.accept().await?;
            let engine = self.engine.clone();
            let credentials = self.credentials.clone();
            let sem = self.semaphore.clone();

            tokio::spawn(async move {
                let _permit = match sem.try_acquire() {
                    Ok(p) => p,
                    Err(_) => {
                        warn!("Engine busy: rejecting session from {}", peer);
                        let mut socket = socket;
                        let _ = socket.shutdown().await;
                        return;
                    }
                };
                if let Err(e) = handle_session(socket, engine, credentials.as_deref()).await {
                    error!("Session from {} failed: {}", peer, e);
                }
            });
        }
    }
}

async fn write_reply<W: AsyncWrite + Unpin>(writer: &mut W, reply: &Reply) -> Result<()> {
    let mut out = serde_json::to_string(reply)?;
    out.push('\n');
    writer.write_all(out.as_bytes()).await?;
    Ok(())
}

/// Runs one session: handshake, then statements until the peer hangs up.
pub async fn handle_session<S>(socket: S, engine: MemEngine, credentials: Option<&(String, String)>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(socket);
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    if reader.read_line(&mut line).await? == 0 {
        return Ok(());
    }
    let hello: Hello = match serde_json::from_str(line.trim()) {
        Ok(hello) => hello,
        Err(e) => {
            let reply = Reply::Err(BackendError::Protocol(format!("expected hello: {}", e)));
            return write_reply(&mut writer, &reply).await;
        }
    };
    if let Some((user, pass)) = credentials {
        if hello.username.as_deref() != Some(user.as_str()) || hello.password.as_deref() != Some(pass.as_str()) {
            warn!("Rejected session: bad credentials");
            let reply = Reply::Err(BackendError::Invalid("authentication failed".to_string()));
            return write_reply(&mut writer, &reply).await;
        }
    }
    write_reply(&mut writer, &Reply::Ok(Outcome::Done)).await?;

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let reply = match serde_json::from_str::<Statement>(trimmed) {
            Ok(statement) => {
                debug!("Engine executing {}", statement.op.name());
                Reply::from(engine.execute(&statement).await)
            }
            Err(e) => Reply::Err(BackendError::Invalid(format!("malformed statement: {}", e))),
        };
        write_reply(&mut writer, &reply).await?;
    }
    Ok(())
}

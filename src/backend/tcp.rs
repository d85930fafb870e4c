use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use crate::backend::{BackendError, Connector, Outcome, Reply, Session};
use crate::config::ConnectParams;
use crate::translate::Statement;

/// First line a session sends after connecting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Speaks newline-delimited JSON statements to a `statebridge-engined` process.
#[derive(Debug, Clone, Default)]
pub struct TcpConnector;

impl TcpConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, params: &ConnectParams) -> Result<Box<dyn Session>, BackendError> {
        let addr = format!("{}:{}", params.host, params.port);
        let stream = tokio::time::timeout(params.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| BackendError::Unreachable(format!("connect to {} timed out", addr)))?
            .map_err(|e| BackendError::Unreachable(format!("connect to {}: {}", addr, e)))?;
        stream.set_nodelay(true).map_err(|e| BackendError::Unreachable(e.to_string()))?;

        let (reader, writer) = stream.into_split();
        let mut session = TcpSession {
            reader: BufReader::new(reader),
            writer,
        };

        let hello = Hello {
            username: params.username.clone(),
            password: params.password.clone(),
        };
        let reply = tokio::time::timeout(params.connect_timeout, session.round_trip(&hello))
            .await
            .map_err(|_| BackendError::Unreachable(format!("handshake with {} timed out", addr)))?
            .map_err(|e| BackendError::Unreachable(format!("handshake with {}: {}", addr, e)))?;
        match reply {
            Reply::Ok(_) => {
                log::debug!("Opened backend session to {}", addr);
                Ok(Box::new(session))
            }
            Reply::Err(e) => Err(BackendError::Unreachable(format!("{} refused session: {}", addr, e))),
        }
    }
}

pub struct TcpSession {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TcpSession {
    async fn round_trip<T: Serialize>(&mut self, message: &T) -> Result<Reply, BackendError> {
        let mut line = serde_json::to_string(message).map_err(|e| BackendError::Protocol(e.to_string()))?;
        line.push('\n');
        self.writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        let mut resp = String::new();
        match self.reader.read_line(&mut resp).await {
            Ok(0) => Err(BackendError::Transport("connection closed by backend".to_string())),
            Ok(_) => serde_json::from_str(resp.trim())
                .map_err(|e| BackendError::Protocol(format!("undecodable reply: {}", e))),
            Err(e) => Err(BackendError::Transport(e.to_string())),
        }
    }
}

#[async_trait]
impl Session for TcpSession {
    async fn execute(&mut self, statement: &Statement) -> Result<Outcome, BackendError> {
        self.round_trip(statement).await?.into()
    }

    async fn close(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}

//! Connection to the remote aggregation service.
//!
//! [`RemoteLink`] owns a single line-delimited JSON connection and the
//! reconnection policy. A supervisor task keeps trying to connect; every
//! transition between live and non-live is reported as a [`LinkStatus`] so the
//! runtime can switch between remote delivery and local buffering.

use async_trait::async_trait;
use digitme_protocol::{
    RemoteRequest, RemoteResponse, SessionRecord, TimerRecord, MAX_REQUEST_BYTES,
    PROTOCOL_VERSION,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::backoff;

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("Remote link is not connected")]
    Unavailable,

    #[error("Remote handshake timed out")]
    Timeout,

    #[error("Remote transport failed: {0}")]
    Transport(#[from] std::io::Error),

    #[error("Remote rejected records: status {status_code}: {message}")]
    Rejected { status_code: i32, message: String },

    #[error("Remote protocol error: {0}")]
    Protocol(String),
}

impl RemoteError {
    /// True when the link itself is unusable, as opposed to a rejected payload.
    pub fn is_link_failure(&self) -> bool {
        !matches!(self, RemoteError::Rejected { .. })
    }
}

/// The two logical operations the relay needs from the remote store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn save_sessions(&self, records: &[SessionRecord]) -> Result<(), RemoteError>;
    async fn save_timers(&self, records: &[TimerRecord]) -> Result<(), RemoteError>;
    fn is_live(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Up,
    Down,
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub endpoint: String,
    pub connect_timeout: Duration,
    pub attempt_timeout: Duration,
    pub client_name: String,
}

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

pub struct RemoteLink {
    config: LinkConfig,
    connection: Mutex<Option<Connection>>,
    live: AtomicBool,
    lost: Notify,
}

/// Accepts `tcp://host:port` or a bare `host:port`.
pub fn socket_address(endpoint: &str) -> &str {
    endpoint.strip_prefix("tcp://").unwrap_or(endpoint)
}

impl RemoteLink {
    pub fn new(config: LinkConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            connection: Mutex::new(None),
            live: AtomicBool::new(false),
            lost: Notify::new(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    /// Starts the connect/reconnect supervisor.
    pub fn spawn(self: &Arc<Self>, status_tx: mpsc::UnboundedSender<LinkStatus>) -> JoinHandle<()> {
        let link = Arc::clone(self);
        tokio::spawn(async move { link.supervise(status_tx).await })
    }

    async fn supervise(self: Arc<Self>, status_tx: mpsc::UnboundedSender<LinkStatus>) {
        let deadline = Instant::now() + self.config.connect_timeout;
        let mut fallback_logged = false;
        let mut attempt = 0u32;

        loop {
            let result = match time::timeout(self.config.attempt_timeout, self.connect_once()).await
            {
                Ok(result) => result,
                Err(_) => Err(RemoteError::Timeout),
            };

            match result {
                Ok(connection) => {
                    *self.connection.lock().await = Some(connection);
                    self.live.store(true, Ordering::SeqCst);
                    fallback_logged = true;
                    attempt = 0;
                    info!(endpoint = %self.config.endpoint, "Connected to remote aggregation service");
                    if status_tx.send(LinkStatus::Up).is_err() {
                        return;
                    }

                    self.lost.notified().await;
                    warn!(endpoint = %self.config.endpoint, "Remote link lost");
                    if status_tx.send(LinkStatus::Down).is_err() {
                        return;
                    }
                    continue;
                }
                Err(err) => {
                    debug!(error = %err, attempt, "Remote connect attempt failed");
                }
            }

            let now = Instant::now();
            let delay = if !fallback_logged && now < deadline {
                backoff::initial_retry_delay(deadline - now)
            } else {
                if !fallback_logged {
                    warn!(
                        endpoint = %self.config.endpoint,
                        timeout_secs = self.config.connect_timeout.as_secs(),
                        "Failed to connect to remote aggregation service; falling back to local buffer"
                    );
                    fallback_logged = true;
                }
                let delay = backoff::reconnect_delay(attempt);
                attempt = attempt.saturating_add(1);
                delay
            };
            time::sleep(delay).await;
        }
    }

    async fn connect_once(&self) -> Result<Connection, RemoteError> {
        let stream = TcpStream::connect(socket_address(&self.config.endpoint)).await?;
        let (reader, writer) = stream.into_split();
        let mut connection = Connection {
            reader: BufReader::new(reader),
            writer,
        };

        let hello = RemoteRequest::Hello {
            protocol_version: PROTOCOL_VERSION,
            client: self.config.client_name.clone(),
        };
        match exchange(&mut connection, &hello).await? {
            RemoteResponse::Welcome { protocol_version } if protocol_version == PROTOCOL_VERSION => {
                Ok(connection)
            }
            RemoteResponse::Welcome { protocol_version } => Err(RemoteError::Protocol(format!(
                "protocol version mismatch: got {}, expected {}",
                protocol_version, PROTOCOL_VERSION
            ))),
            other => Err(RemoteError::Protocol(format!(
                "expected welcome, got {:?}",
                other
            ))),
        }
    }

    fn mark_lost(&self) {
        if self.live.swap(false, Ordering::SeqCst) {
            self.lost.notify_one();
        }
    }

    async fn call(&self, request: RemoteRequest) -> Result<(), RemoteError> {
        let mut guard = self.connection.lock().await;
        let connection = guard.as_mut().ok_or(RemoteError::Unavailable)?;

        let response = match exchange(connection, &request).await {
            Ok(response) => response,
            Err(err) => {
                *guard = None;
                self.mark_lost();
                return Err(err);
            }
        };

        match response {
            RemoteResponse::Saved(reply) if reply.is_accepted() => Ok(()),
            RemoteResponse::Saved(reply) => Err(RemoteError::Rejected {
                status_code: reply.status_code,
                message: reply.err_msg,
            }),
            RemoteResponse::Error(info) => Err(RemoteError::Rejected {
                status_code: -1,
                message: format!("{}: {}", info.code, info.message),
            }),
            RemoteResponse::Welcome { .. } => {
                *guard = None;
                self.mark_lost();
                Err(RemoteError::Protocol("unexpected welcome".to_string()))
            }
        }
    }
}

async fn exchange(
    connection: &mut Connection,
    request: &RemoteRequest,
) -> Result<RemoteResponse, RemoteError> {
    let mut line = serde_json::to_string(request)
        .map_err(|err| RemoteError::Protocol(format!("failed to encode request: {}", err)))?;
    line.push('\n');
    connection.writer.write_all(line.as_bytes()).await?;
    connection.writer.flush().await?;

    let mut response = Vec::new();
    let limit = MAX_REQUEST_BYTES as u64 + 1;
    let read = (&mut connection.reader)
        .take(limit)
        .read_until(b'\n', &mut response)
        .await?;
    if read == 0 {
        return Err(RemoteError::Transport(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "remote closed the connection",
        )));
    }
    if response.len() > MAX_REQUEST_BYTES {
        return Err(RemoteError::Protocol(
            "response exceeded maximum size".to_string(),
        ));
    }

    serde_json::from_slice(&response)
        .map_err(|err| RemoteError::Protocol(format!("invalid response JSON: {}", err)))
}

#[async_trait]
impl RemoteStore for RemoteLink {
    async fn save_sessions(&self, records: &[SessionRecord]) -> Result<(), RemoteError> {
        self.call(RemoteRequest::SaveSessions {
            records: records.to_vec(),
        })
        .await
    }

    async fn save_timers(&self, records: &[TimerRecord]) -> Result<(), RemoteError> {
        self.call(RemoteRequest::SaveTimers {
            records: records.to_vec(),
        })
        .await
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

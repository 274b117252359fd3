//! Client side of the line protocol.
//!
//! A `LineChannel` multiplexes many concurrent calls over one byte stream:
//! every outgoing request gets a fresh id, and a reader task routes each
//! response to the waiting caller. When the stream ends, all waiters are
//! woken with `Closed`.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::protocol::{encode_line, RpcRequest, RpcResponse};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid endpoint '{0}'")]
    InvalidEndpoint(String),
    #[error("cannot connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },
    #[error("connection to {0} timed out")]
    ConnectTimeout(String),
    #[error("channel closed")]
    Closed,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A connection to a peer speaking the line protocol
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    /// Send one request and wait for its response. The request id is
    /// replaced on the wire and restored on the returned response.
    async fn call(&self, request: RpcRequest) -> Result<RpcResponse, TransportError>;

    fn is_closed(&self) -> bool;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn RemoteChannel>, TransportError>;
}

/// Where a remote tool lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// `tcp://host:port`
    Tcp(String),
    /// `stdio:program arg...`, a child process speaking the protocol on stdio
    Process { program: String, args: Vec<String> },
}

impl Endpoint {
    pub fn parse(s: &str) -> Result<Self, TransportError> {
        let s = s.trim();
        if let Some(addr) = s.strip_prefix("tcp://") {
            if addr.is_empty() || !addr.contains(':') {
                return Err(TransportError::InvalidEndpoint(s.to_string()));
            }
            return Ok(Endpoint::Tcp(addr.to_string()));
        }
        if let Some(cmd) = s.strip_prefix("stdio:") {
            let mut parts = cmd.split_whitespace().map(str::to_string);
            let program = parts
                .next()
                .ok_or_else(|| TransportError::InvalidEndpoint(s.to_string()))?;
            return Ok(Endpoint::Process {
                program,
                args: parts.collect(),
            });
        }
        Err(TransportError::InvalidEndpoint(s.to_string()))
    }
}

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<RpcResponse>>>>;

/// Removes a pending entry when the caller stops waiting (e.g. on timeout).
struct PendingGuard {
    pending: Pending,
    id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

pub struct LineChannel {
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: Pending,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    _child: Option<Child>,
}

impl LineChannel {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_child(reader, writer, None)
    }

    fn with_child<R, W>(reader: R, writer: W, child: Option<Child>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(read_responses(reader, pending.clone(), closed.clone()));
        Self {
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            pending,
            closed,
            reader,
            _child: child,
        }
    }

    /// Calls currently awaiting a response
    pub fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }
}

async fn read_responses<R>(reader: R, pending: Pending, closed: Arc<AtomicBool>)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                let response: RpcResponse = match serde_json::from_str(&line) {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(error = %e, "discarding malformed response");
                        continue;
                    }
                };
                let key = id_key(&response.id);
                match pending.lock().remove(&key) {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => debug!(id = %key, "response for unknown or abandoned request"),
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "channel read failed");
                break;
            }
        }
    }
    closed.store(true, Ordering::SeqCst);
    // Dropping the senders wakes every waiter with Closed
    pending.lock().clear();
}

fn id_key(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl RemoteChannel for LineChannel {
    async fn call(&self, mut request: RpcRequest) -> Result<RpcResponse, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let caller_id = std::mem::replace(
            &mut request.id,
            Value::String(uuid::Uuid::new_v4().to_string()),
        );
        let key = id_key(&request.id);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(key.clone(), tx);
        let _guard = PendingGuard {
            pending: self.pending.clone(),
            id: key,
        };
        // The reader may have drained the table between the check and the insert
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let line = encode_line(&request)?;
        {
            let mut writer = self.writer.lock().await;
            let written = async {
                writer.write_all(line.as_bytes()).await?;
                writer.flush().await
            }
            .await;
            if let Err(e) = written {
                self.closed.store(true, Ordering::SeqCst);
                return Err(TransportError::Io(e));
            }
        }

        let mut response = rx.await.map_err(|_| TransportError::Closed)?;
        response.id = caller_id;
        Ok(response)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for LineChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Connects TCP and child-process endpoints
pub struct DefaultConnector {
    connect_timeout: Duration,
}

impl DefaultConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for DefaultConnector {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn RemoteChannel>, TransportError> {
        match Endpoint::parse(endpoint)? {
            Endpoint::Tcp(addr) => {
                let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr))
                    .await
                    .map_err(|_| TransportError::ConnectTimeout(endpoint.to_string()))?
                    .map_err(|source| TransportError::Connect {
                        endpoint: endpoint.to_string(),
                        source,
                    })?;
                stream.set_nodelay(true)?;
                let (r, w) = stream.into_split();
                info!(endpoint = %endpoint, "connected to remote tool host");
                Ok(Arc::new(LineChannel::new(r, w)))
            }
            Endpoint::Process { program, args } => {
                let mut child = Command::new(&program)
                    .args(&args)
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::inherit())
                    .kill_on_drop(true)
                    .spawn()
                    .map_err(|source| TransportError::Connect {
                        endpoint: endpoint.to_string(),
                        source,
                    })?;
                let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
                    return Err(TransportError::Closed);
                };
                info!(endpoint = %endpoint, pid = child.id(), "spawned remote tool host");
                Ok(Arc::new(LineChannel::with_child(stdout, stdin, Some(child))))
            }
        }
    }
}

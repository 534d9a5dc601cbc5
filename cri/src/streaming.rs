//! CRI streaming server for exec, attach, and port-forward.
//!
//! Kubernetes CRI uses a two-phase protocol for interactive operations:
//! 1. gRPC call registers a session and returns a streaming URL
//! 2. Kubelet connects to the URL over HTTP and upgrades the connection
//!
//! This module owns the HTTP side: it accepts connections, parses the
//! request head, and hands the connection to a [`StreamingHandler`] which
//! consumes the session and bridges it to the engine.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use privrt_core::config::StreamingConfig;
use privrt_core::error::{AdapterError, Result};

use crate::http::{read_head, send_response};

/// Type of CRI streaming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKind {
    Exec,
    Attach,
    PortForward,
}

impl SessionKind {
    /// URL path segment for this kind.
    pub fn as_path(&self) -> &'static str {
        match self {
            SessionKind::Exec => "exec",
            SessionKind::Attach => "attach",
            SessionKind::PortForward => "portforward",
        }
    }

    pub fn from_path(segment: &str) -> Option<Self> {
        match segment {
            "exec" => Some(SessionKind::Exec),
            "attach" => Some(SessionKind::Attach),
            "portforward" => Some(SessionKind::PortForward),
            _ => None,
        }
    }
}

/// A pending streaming session registered by a CRI gRPC call.
#[derive(Debug, Clone)]
pub struct StreamingSession {
    /// Type of streaming operation.
    pub kind: SessionKind,
    /// Container id (exec/attach) or sandbox container id (port-forward).
    pub container_id: String,
    /// Command to execute (exec only).
    pub cmd: Vec<String>,
    pub tty: bool,
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
    /// Ports to forward (port-forward only).
    pub ports: Vec<i32>,
}

struct PendingSession {
    session: StreamingSession,
    registered_at: Instant,
}

/// Single-use session tokens with a creation deadline.
#[derive(Clone)]
pub struct SessionCache {
    sessions: Arc<DashMap<String, PendingSession>>,
    ttl: Duration,
}

impl SessionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            ttl,
        }
    }

    /// Register a session and return its token.
    pub fn insert(&self, session: StreamingSession) -> String {
        self.evict_expired();
        let token = uuid::Uuid::new_v4().simple().to_string();
        self.sessions.insert(
            token.clone(),
            PendingSession {
                session,
                registered_at: Instant::now(),
            },
        );
        token
    }

    /// Take a session out of the cache.
    ///
    /// Unknown, already consumed and expired tokens are all `SessionNotFound`.
    pub fn consume(&self, token: &str) -> Result<StreamingSession> {
        let (_, pending) = self
            .sessions
            .remove(token)
            .ok_or_else(|| AdapterError::SessionNotFound(token.to_string()))?;
        if pending.registered_at.elapsed() > self.ttl {
            return Err(AdapterError::SessionNotFound(token.to_string()));
        }
        Ok(pending.session)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn evict_expired(&self) {
        let ttl = self.ttl;
        self.sessions
            .retain(|_, pending| pending.registered_at.elapsed() <= ttl);
    }
}

/// A routed streaming request.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub method: String,
    pub kind: SessionKind,
    pub token: String,
    /// Header names are lowercased.
    pub headers: HashMap<String, String>,
    pub peer: SocketAddr,
    /// Bytes the client sent past the request head.
    pub buffered: Vec<u8>,
}

impl StreamRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(|v| v.as_str())
    }
}

/// Serves routed streaming requests.
///
/// The handler owns the connection from here on and writes its own
/// response, including the protocol upgrade.
#[async_trait]
pub trait StreamingHandler: Send + Sync {
    async fn serve_stream(&self, request: StreamRequest, stream: TcpStream) -> Result<()>;

    /// Called once the listener is bound, with the address it actually got.
    fn listening(&self, _addr: SocketAddr) {}
}

/// Current state of a streaming listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerState {
    Starting,
    Listening(SocketAddr),
    Failed(StreamingFault),
    Stopped,
}

/// Terminal failure of a streaming listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingFault {
    pub addr: SocketAddr,
    pub message: String,
}

impl From<StreamingFault> for AdapterError {
    fn from(fault: StreamingFault) -> Self {
        AdapterError::StreamingListen {
            addr: fault.addr.to_string(),
            message: fault.message,
        }
    }
}

/// CRI streaming server that handles HTTP connections from kubelet.
pub struct StreamingServer {
    /// Listening address.
    addr: SocketAddr,
    handler: Arc<dyn StreamingHandler>,
}

impl StreamingServer {
    /// Create a new streaming server.
    pub fn new(config: &StreamingConfig, handler: Arc<dyn StreamingHandler>) -> Self {
        Self {
            addr: config.addr,
            handler,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Bind and serve until `shutdown` flips to `true`.
    ///
    /// Progress is published on `state`. Bind failures and non-transient
    /// accept failures end the loop with [`AdapterError::StreamingListen`].
    pub async fn serve(
        self,
        state: &watch::Sender<ListenerState>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let listen_error = |e: std::io::Error| AdapterError::StreamingListen {
            addr: self.addr.to_string(),
            message: e.to_string(),
        };

        let listener = TcpListener::bind(self.addr).await.map_err(listen_error)?;
        let local_addr = listener.local_addr().map_err(listen_error)?;
        self.handler.listening(local_addr);
        state.send_replace(ListenerState::Listening(local_addr));
        tracing::info!(addr = %local_addr, "CRI streaming server listening");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::debug!(addr = %local_addr, "CRI streaming server shutting down");
                        return Ok(());
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let handler = self.handler.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, peer, handler).await {
                                tracing::warn!(peer = %peer, error = %e, "Streaming connection failed");
                            }
                        });
                    }
                    Err(e) if is_transient_accept_error(&e) => {
                        tracing::debug!(error = %e, "Transient accept error");
                    }
                    Err(e) => return Err(listen_error(e)),
                },
            }
        }
    }
}

fn is_transient_accept_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::Interrupted
    )
}

/// Handle an incoming HTTP connection from kubelet.
async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<dyn StreamingHandler>,
) -> Result<()> {
    let (head, buffered) = match read_head(&mut stream).await {
        Ok(parsed) => parsed,
        Err(AdapterError::SerializationError(msg)) => {
            send_response(&mut stream, 400, &msg).await?;
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    let Some((method, path)) = head.request_target() else {
        send_response(&mut stream, 400, "Bad Request").await?;
        return Ok(());
    };
    let method = method.to_string();

    // Parse request path: /exec/<token>
    let path = path.split('?').next().unwrap_or("");
    let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
    let route = match segments.as_slice() {
        [kind, token] if !token.is_empty() => {
            SessionKind::from_path(kind).map(|kind| (kind, token.to_string()))
        }
        _ => None,
    };
    let Some((kind, token)) = route else {
        send_response(&mut stream, 404, "Not Found").await?;
        return Ok(());
    };

    if method != "GET" && method != "POST" {
        send_response(&mut stream, 405, "Method Not Allowed").await?;
        return Ok(());
    }

    tracing::debug!(peer = %peer, kind = kind.as_path(), "Streaming request");

    let request = StreamRequest {
        method,
        kind,
        token,
        headers: head.headers,
        peer,
        buffered,
    };
    handler.serve_stream(request, stream).await
}

/// Pick the first client-requested sub-protocol the server supports.
///
/// `Ok(None)` when the client requested none; `Err` with the client's list
/// when nothing matches.
pub fn negotiate_protocol(
    requested: Option<&str>,
    supported: &[String],
) -> std::result::Result<Option<String>, String> {
    let requested: Vec<&str> = requested
        .unwrap_or("")
        .split(',')
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect();
    if requested.is_empty() {
        return Ok(None);
    }
    requested
        .iter()
        .find(|p| supported.iter().any(|s| s == *p))
        .map(|p| Some(p.to_string()))
        .ok_or_else(|| requested.join(", "))
}

/// Write `101 Switching Protocols`, echoing the negotiated sub-protocol.
pub async fn send_upgrade<W>(writer: &mut W, protocol: Option<&str>) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut response =
        String::from("HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: tcp\r\n");
    if let Some(protocol) = protocol {
        response.push_str(&format!("X-Stream-Protocol-Version: {}\r\n", protocol));
    }
    response.push_str("\r\n");
    writer.write_all(response.as_bytes()).await
}

/// Copy bytes both ways until the engine side closes or neither direction
/// has moved a byte for `idle`.
///
/// A client EOF only half-closes the engine side, so output keeps flowing
/// after stdin ends. `client_buffered` / `engine_buffered` are bytes already
/// read from the respective side and are delivered first.
pub async fn bridge<C, E>(
    client: C,
    client_buffered: Vec<u8>,
    engine: E,
    engine_buffered: Vec<u8>,
    idle: Duration,
) -> std::io::Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin,
    E: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut engine_read, mut engine_write) = tokio::io::split(engine);
    let last_activity = Mutex::new(tokio::time::Instant::now());

    let client_to_engine = async {
        if !client_buffered.is_empty() {
            engine_write.write_all(&client_buffered).await?;
        }
        pump(&mut client_read, &mut engine_write, &last_activity).await
    };
    let engine_to_client = async {
        if !engine_buffered.is_empty() {
            client_write.write_all(&engine_buffered).await?;
        }
        pump(&mut engine_read, &mut client_write, &last_activity).await
    };
    let idle_timer = async {
        loop {
            let deadline = *last_activity.lock() + idle;
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep_until(deadline).await;
        }
    };
    tokio::pin!(client_to_engine, engine_to_client, idle_timer);

    let mut client_done = false;
    loop {
        tokio::select! {
            r = &mut client_to_engine, if !client_done => {
                client_done = true;
                r?;
            }
            r = &mut engine_to_client => return r,
            _ = &mut idle_timer => {
                tracing::debug!(idle = ?idle, "Streaming session idle timeout");
                return Ok(());
            }
        }
    }
}

/// Copy until EOF, then shut down the writer.
async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    last_activity: &Mutex<tokio::time::Instant>,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 32 * 1024];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        *last_activity.lock() = tokio::time::Instant::now();
        writer.write_all(&buf[..n]).await?;
    }
    writer.flush().await?;
    let _ = writer.shutdown().await;
    Ok(())
}

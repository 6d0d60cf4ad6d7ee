use crate::types::CapabilityDescriptor;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter,
};
use tokio::net::TcpStream;
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::{Mutex as AsyncMutex, oneshot};
use tokio::time::timeout;
use thiserror::Error;
use tracing::{debug, warn};

pub const PROTOCOL_VERSION: &str = "2025-06-18";

const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("backend '{backend}' connection failed: {message}")]
    Connection { backend: String, message: String },
    #[error("backend '{backend}' protocol error: {message}")]
    Protocol { backend: String, message: String },
    #[error("backend '{backend}' did not answer '{capability}' within {timeout_ms}ms")]
    InvocationTimeout {
        backend: String,
        capability: String,
        timeout_ms: u64,
    },
    #[error("backend '{backend}' does not expose capability '{capability}'")]
    UnknownCapability { backend: String, capability: String },
    #[error("backend '{backend}' returned error {code}: {message}")]
    Rpc {
        backend: String,
        code: i64,
        message: String,
    },
    #[error("backend '{backend}' sent invalid JSON: {source}")]
    InvalidJson {
        backend: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("session for backend '{backend}' is closed")]
    Closed { backend: String },
}

impl SessionError {
    /// Connection failures are retryable once the backend's readiness window
    /// has elapsed; everything else is not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SessionError::Connection { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unconnected,
    Initializing,
    Ready,
    Closed,
}

/// The channel a session runs over. Stdio pipes come from a launched
/// `BackendProcess`; TCP endpoints are dialled here.
pub enum SessionTransport {
    Stdio {
        stdin: ChildStdin,
        stdout: ChildStdout,
    },
    Tcp {
        host: String,
        port: u16,
    },
}

/// The seam the registry invokes capabilities through. `Session` is the
/// production implementation; tests substitute scripted fakes.
#[async_trait]
pub trait CapabilityInvoker: Send + Sync {
    fn backend(&self) -> &str;

    async fn list_capabilities(&self) -> Result<Vec<CapabilityDescriptor>, SessionError>;

    async fn invoke(&self, capability: &str, arguments: Value)
    -> Result<Value, SessionError>;
}

type BoxedWriter = BufWriter<Box<dyn AsyncWrite + Send + Unpin>>;

/// The live, initialized protocol channel to one backend. Exclusively owns
/// its read/write halves; requests on one session are serialized, sessions
/// on distinct backends proceed in parallel.
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    backend: String,
    invoke_timeout: Duration,
    state: AsyncMutex<SessionState>,
    writer: AsyncMutex<Option<BoxedWriter>>,
    pending: AsyncMutex<HashMap<String, oneshot::Sender<Result<Value, SessionError>>>>,
    // Serializes request/response exchanges so concurrent invocations never
    // interleave on the channel.
    gate: AsyncMutex<()>,
    id_counter: AtomicU64,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("backend", &self.inner.backend)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Establishes the channel. Fails with `Connection` on refused or
    /// unreachable endpoints; the handshake happens later in `initialize`.
    pub async fn connect(
        backend: impl Into<String>,
        transport: SessionTransport,
        invoke_timeout: Duration,
    ) -> Result<Self, SessionError> {
        let backend = backend.into();
        match transport {
            SessionTransport::Stdio { stdin, stdout } => {
                Ok(Self::attach(backend, stdout, stdin, invoke_timeout))
            }
            SessionTransport::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), port))
                    .await
                    .map_err(|source| SessionError::Connection {
                        backend: backend.clone(),
                        message: format!("{host}:{port}: {source}"),
                    })?;
                let (read_half, write_half) = stream.into_split();
                Ok(Self::attach(backend, read_half, write_half, invoke_timeout))
            }
        }
    }

    /// Wires a session over arbitrary channel halves and starts the reader
    /// task. Used by `connect` and by in-memory test channels.
    pub fn attach(
        backend: impl Into<String>,
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        invoke_timeout: Duration,
    ) -> Self {
        let boxed: Box<dyn AsyncWrite + Send + Unpin> = Box::new(writer);
        let inner = Arc::new(SessionInner {
            backend: backend.into(),
            invoke_timeout,
            state: AsyncMutex::new(SessionState::Unconnected),
            writer: AsyncMutex::new(Some(BufWriter::new(boxed))),
            pending: AsyncMutex::new(HashMap::new()),
            gate: AsyncMutex::new(()),
            id_counter: AtomicU64::new(1),
        });

        let reader_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            reader_inner.reader_loop(reader).await;
        });

        Self { inner }
    }

    pub fn backend_key(&self) -> &str {
        &self.inner.backend
    }

    pub async fn state(&self) -> SessionState {
        *self.inner.state.lock().await
    }

    /// Performs the protocol handshake. Idempotent: a ready session is a
    /// no-op. An incompatible version or malformed handshake payload closes
    /// the session with a `Protocol` error.
    pub async fn initialize(&self) -> Result<(), SessionError> {
        let _gate = self.inner.gate.lock().await;

        {
            let mut state = self.inner.state.lock().await;
            match *state {
                SessionState::Ready => return Ok(()),
                SessionState::Closed => {
                    return Err(SessionError::Closed {
                        backend: self.inner.backend.clone(),
                    });
                }
                SessionState::Unconnected | SessionState::Initializing => {
                    *state = SessionState::Initializing;
                }
            }
        }

        match self.inner.handshake().await {
            Ok(()) => {
                let mut state = self.inner.state.lock().await;
                *state = SessionState::Ready;
                debug!(backend = %self.inner.backend, "session handshake complete");
                Ok(())
            }
            Err(err) => {
                if matches!(err, SessionError::Protocol { .. }) {
                    // Version mismatch is fatal to this session.
                    let mut state = self.inner.state.lock().await;
                    *state = SessionState::Closed;
                    drop(state);
                    self.inner.reset().await;
                } else {
                    let mut state = self.inner.state.lock().await;
                    *state = SessionState::Unconnected;
                }
                Err(err)
            }
        }
    }

    /// Queries the peer's capability listing. An empty listing is a valid
    /// empty vec, not an error.
    pub async fn list_capabilities(&self) -> Result<Vec<CapabilityDescriptor>, SessionError> {
        self.initialize().await?;
        let _gate = self.inner.gate.lock().await;
        let result = self
            .inner
            .send_request(
                "tools/list",
                "tools/list",
                json!({}),
                Some(self.inner.invoke_timeout),
            )
            .await?;

        let mut descriptors = Vec::new();
        if let Some(tools) = result.get("tools").and_then(Value::as_array) {
            for tool in tools {
                let Some(name) = tool.get("name").and_then(Value::as_str) else {
                    continue;
                };
                descriptors.push(CapabilityDescriptor {
                    name: name.to_string(),
                    description: tool
                        .get("description")
                        .and_then(Value::as_str)
                        .map(|text| text.to_string()),
                    parameter_schema: tool.get("inputSchema").cloned(),
                });
            }
        }
        Ok(descriptors)
    }

    /// Sends a named invocation and awaits the single correlated response.
    /// Enforces the session's invoke timeout; an unknown name surfaces as
    /// `UnknownCapability` from the peer, not a local check.
    pub async fn invoke(
        &self,
        capability: &str,
        arguments: Value,
    ) -> Result<Value, SessionError> {
        self.initialize().await?;
        let _gate = self.inner.gate.lock().await;

        let params = json!({
            "name": capability,
            "arguments": match arguments {
                Value::Null => Value::Object(Default::default()),
                other => other,
            }
        });

        match self
            .inner
            .send_request(
                "tools/call",
                capability,
                params,
                Some(self.inner.invoke_timeout),
            )
            .await
        {
            Ok(result) => Ok(result),
            Err(SessionError::Rpc { code, .. }) if code == METHOD_NOT_FOUND => {
                Err(SessionError::UnknownCapability {
                    backend: self.inner.backend.clone(),
                    capability: capability.to_string(),
                })
            }
            Err(other) => Err(other),
        }
    }

    /// Releases the channel. Safe to call any number of times and never
    /// fails, even once the underlying transport is gone.
    pub async fn close(&self) {
        {
            let mut state = self.inner.state.lock().await;
            if *state == SessionState::Closed {
                return;
            }
            *state = SessionState::Closed;
        }
        self.inner.reset().await;
        debug!(backend = %self.inner.backend, "session closed");
    }
}

#[async_trait]
impl CapabilityInvoker for Session {
    fn backend(&self) -> &str {
        &self.inner.backend
    }

    async fn list_capabilities(&self) -> Result<Vec<CapabilityDescriptor>, SessionError> {
        Session::list_capabilities(self).await
    }

    async fn invoke(
        &self,
        capability: &str,
        arguments: Value,
    ) -> Result<Value, SessionError> {
        Session::invoke(self, capability, arguments).await
    }
}

impl SessionInner {
    async fn handshake(&self) -> Result<(), SessionError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": {}
        });
        let result = self
            .send_request("initialize", "initialize", params, Some(self.invoke_timeout))
            .await
            .map_err(|err| match err {
                // A backend still inside its readiness window accepts the
                // channel but does not answer; classify that as retryable.
                SessionError::InvocationTimeout { .. } => SessionError::Connection {
                    backend: self.backend.clone(),
                    message: "backend did not answer the handshake".to_string(),
                },
                other => other,
            })?;

        let version = result
            .get("protocolVersion")
            .and_then(Value::as_str)
            .ok_or_else(|| SessionError::Protocol {
                backend: self.backend.clone(),
                message: "handshake result missing protocolVersion".to_string(),
            })?;
        if version != PROTOCOL_VERSION {
            return Err(SessionError::Protocol {
                backend: self.backend.clone(),
                message: format!("peer answered with unsupported protocol version '{version}'"),
            });
        }

        self.send_notification("notifications/initialized", json!({}))
            .await
    }

    /// Sends one request and awaits its correlated response. `label` names
    /// the operation in timeout errors.
    async fn send_request(
        &self,
        method: &str,
        label: &str,
        params: Value,
        wait: Option<Duration>,
    ) -> Result<Value, SessionError> {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(id.clone(), tx);
        }

        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params
        });
        if let Err(err) = self.write_message(&payload).await {
            let mut pending = self.pending.lock().await;
            pending.remove(&id);
            return Err(err);
        }

        let awaited = match wait {
            Some(duration) => match timeout(duration, rx).await {
                Ok(received) => received,
                Err(_) => {
                    let mut pending = self.pending.lock().await;
                    pending.remove(&id);
                    return Err(SessionError::InvocationTimeout {
                        backend: self.backend.clone(),
                        capability: label.to_string(),
                        timeout_ms: duration.as_millis() as u64,
                    });
                }
            },
            None => rx.await,
        };

        match awaited {
            Ok(Ok(value)) => Ok(value.get("result").cloned().unwrap_or(Value::Null)),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(SessionError::Closed {
                backend: self.backend.clone(),
            }),
        }
    }

    async fn send_notification(&self, method: &str, params: Value) -> Result<(), SessionError> {
        let payload = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params
        });
        self.write_message(&payload).await
    }

    async fn send_response(&self, id: Value, result: Value) -> Result<(), SessionError> {
        let mut payload = json!({
            "jsonrpc": "2.0",
            "result": result
        });
        if let Value::Object(ref mut map) = payload {
            map.insert("id".to_string(), id);
        }
        self.write_message(&payload).await
    }

    async fn send_error(&self, id: Value, error: Value) -> Result<(), SessionError> {
        let mut payload = json!({
            "jsonrpc": "2.0",
            "error": error
        });
        if let Value::Object(ref mut map) = payload {
            map.insert("id".to_string(), id);
        }
        self.write_message(&payload).await
    }

    async fn write_message(&self, message: &Value) -> Result<(), SessionError> {
        let encoded =
            serde_json::to_string(message).map_err(|source| SessionError::InvalidJson {
                backend: self.backend.clone(),
                source,
            })?;

        let mut writer = self.writer.lock().await;
        let stream = writer.as_mut().ok_or_else(|| SessionError::Closed {
            backend: self.backend.clone(),
        })?;
        stream
            .write_all(encoded.as_bytes())
            .await
            .map_err(|source| self.connection_error(&source))?;
        stream
            .write_all(b"\n")
            .await
            .map_err(|source| self.connection_error(&source))?;
        stream
            .flush()
            .await
            .map_err(|source| self.connection_error(&source))?;
        Ok(())
    }

    async fn reader_loop(self: Arc<Self>, reader: impl AsyncRead + Send + Unpin) {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(item) = lines.next_line().await {
            match item {
                Some(raw) => {
                    if raw.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Value>(&raw) {
                        Ok(value) => self.process_inbound_message(value).await,
                        Err(source) => {
                            warn!(
                                backend = %self.backend,
                                line = raw,
                                %source,
                                "received invalid JSON from backend"
                            );
                        }
                    }
                }
                None => break,
            }
        }

        // Channel gone: mark the session closed and fail anything in flight.
        {
            let mut state = self.state.lock().await;
            *state = SessionState::Closed;
        }
        self.reset().await;
    }

    async fn process_inbound_message(&self, value: Value) {
        if let Some(id) = value.get("id").cloned() {
            if value.get("method").is_some() {
                self.handle_server_request(id, value).await;
            } else {
                self.handle_response(id, value).await;
            }
        } else if let Some(method) = value.get("method").and_then(Value::as_str) {
            debug!(
                backend = %self.backend,
                method,
                "received notification from backend"
            );
        }
    }

    async fn handle_response(&self, id: Value, value: Value) {
        let key = match response_key(&id) {
            Some(key) => key,
            None => return,
        };

        let responder = {
            let mut pending = self.pending.lock().await;
            pending.remove(&key)
        };

        let Some(sender) = responder else {
            debug!(
                backend = %self.backend,
                response_id = key,
                "received response for unknown request"
            );
            return;
        };

        if value.get("error").is_some() {
            let error = value
                .get("error")
                .and_then(Value::as_object)
                .map(|err| SessionError::Rpc {
                    backend: self.backend.clone(),
                    code: err.get("code").and_then(Value::as_i64).unwrap_or(-32000),
                    message: err
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error")
                        .to_string(),
                })
                .unwrap_or_else(|| SessionError::Protocol {
                    backend: self.backend.clone(),
                    message: "missing error payload in response".to_string(),
                });
            let _ = sender.send(Err(error));
        } else {
            let _ = sender.send(Ok(value));
        }
    }

    async fn handle_server_request(&self, id: Value, value: Value) {
        let method = value
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let outcome = match method {
            "ping" => self.send_response(id, json!({ "ok": true })).await,
            other => {
                warn!(
                    backend = %self.backend,
                    method = other,
                    "backend sent unsupported request"
                );
                let error = json!({
                    "code": METHOD_NOT_FOUND,
                    "message": format!("client does not implement method '{other}'"),
                });
                self.send_error(id, error).await
            }
        };
        if let Err(err) = outcome {
            warn!(backend = %self.backend, %err, "failed to answer backend request");
        }
    }

    async fn reset(&self) {
        {
            let mut writer = self.writer.lock().await;
            *writer = None;
        }

        let mut pending = self.pending.lock().await;
        for (_, sender) in pending.drain() {
            let _ = sender.send(Err(SessionError::Closed {
                backend: self.backend.clone(),
            }));
        }
    }

    fn next_id(&self) -> String {
        let id = self.id_counter.fetch_add(1, Ordering::SeqCst);
        format!("req-{id}")
    }

    fn connection_error(&self, source: &std::io::Error) -> SessionError {
        SessionError::Connection {
            backend: self.backend.clone(),
            message: source.to_string(),
        }
    }
}

fn response_key(id: &Value) -> Option<String> {
    match id {
        Value::String(value) => Some(value.clone()),
        Value::Number(num) => Some(num.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf, split};

    struct FakePeer {
        reader: tokio::io::Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
        protocol_version: String,
        silent_calls: bool,
        initialize_count: Arc<AtomicUsize>,
    }

    impl FakePeer {
        async fn serve(mut self) {
            while let Ok(Some(line)) = self.reader.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                let message: Value = match serde_json::from_str(&line) {
                    Ok(value) => value,
                    Err(_) => continue,
                };
                let method = message
                    .get("method")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let Some(id) = message.get("id").cloned() else {
                    continue;
                };

                let reply = match method.as_str() {
                    "initialize" => {
                        self.initialize_count.fetch_add(1, Ordering::SeqCst);
                        json!({
                            "jsonrpc": "2.0",
                            "id": id,
                            "result": {
                                "protocolVersion": self.protocol_version,
                                "serverInfo": {"name": "fake", "version": "0.0.1"}
                            }
                        })
                    }
                    "tools/list" => json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "result": { "tools": [] }
                    }),
                    "tools/call" => {
                        if self.silent_calls {
                            continue;
                        }
                        let name = message
                            .pointer("/params/name")
                            .and_then(Value::as_str)
                            .unwrap_or_default();
                        if name == "echo" {
                            json!({
                                "jsonrpc": "2.0",
                                "id": id,
                                "result": message.pointer("/params/arguments").cloned()
                                    .unwrap_or(Value::Null)
                            })
                        } else {
                            json!({
                                "jsonrpc": "2.0",
                                "id": id,
                                "error": {
                                    "code": METHOD_NOT_FOUND,
                                    "message": format!("unknown tool '{name}'")
                                }
                            })
                        }
                    }
                    _ => continue,
                };

                let mut encoded = serde_json::to_vec(&reply).expect("encode reply");
                encoded.push(b'\n');
                self.writer.write_all(&encoded).await.expect("peer write");
            }
        }
    }

    fn spawn_peer(protocol_version: &str, silent_calls: bool) -> (Session, Arc<AtomicUsize>) {
        let (session_side, peer_side) = tokio::io::duplex(4096);
        let (peer_read, peer_write) = split(peer_side);
        let initialize_count = Arc::new(AtomicUsize::new(0));

        let peer = FakePeer {
            reader: BufReader::new(peer_read).lines(),
            writer: peer_write,
            protocol_version: protocol_version.to_string(),
            silent_calls,
            initialize_count: Arc::clone(&initialize_count),
        };
        tokio::spawn(peer.serve());

        let (session_read, session_write) = split(session_side);
        let session = Session::attach(
            "fake",
            session_read,
            session_write,
            Duration::from_millis(200),
        );
        (session, initialize_count)
    }

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let (session, count) = spawn_peer(PROTOCOL_VERSION, false);
        session.initialize().await.expect("first handshake");
        session.initialize().await.expect("second handshake");
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(session.state().await, SessionState::Ready);
    }

    #[tokio::test]
    async fn version_mismatch_is_a_protocol_error_and_closes_the_session() {
        let (session, _) = spawn_peer("1999-01-01", false);
        let err = session.initialize().await.expect_err("handshake fails");
        assert!(matches!(err, SessionError::Protocol { .. }));
        assert!(!err.is_retryable());
        assert_eq!(session.state().await, SessionState::Closed);

        let err = session.initialize().await.expect_err("session unusable");
        assert!(matches!(err, SessionError::Closed { .. }));
    }

    #[tokio::test]
    async fn empty_capability_listing_is_ok() {
        let (session, _) = spawn_peer(PROTOCOL_VERSION, false);
        let descriptors = session.list_capabilities().await.expect("list");
        assert!(descriptors.is_empty());
    }

    #[tokio::test]
    async fn unknown_capability_surfaces_from_the_peer() {
        let (session, _) = spawn_peer(PROTOCOL_VERSION, false);
        let err = session
            .invoke("does_not_exist", json!({}))
            .await
            .expect_err("peer rejects");
        assert!(matches!(
            err,
            SessionError::UnknownCapability { capability, .. } if capability == "does_not_exist"
        ));
    }

    #[tokio::test]
    async fn invoke_round_trips_arguments() {
        let (session, _) = spawn_peer(PROTOCOL_VERSION, false);
        let result = session
            .invoke("echo", json!({"page_id": "example_page_123"}))
            .await
            .expect("echo");
        assert_eq!(result["page_id"], "example_page_123");
    }

    #[tokio::test]
    async fn silent_peer_times_out_instead_of_hanging() {
        let (session, _) = spawn_peer(PROTOCOL_VERSION, true);
        let err = session
            .invoke("echo", json!({}))
            .await
            .expect_err("times out");
        assert!(matches!(err, SessionError::InvocationTimeout { .. }));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_marks_the_session_unusable() {
        let (session, _) = spawn_peer(PROTOCOL_VERSION, false);
        session.initialize().await.expect("handshake");
        session.close().await;
        session.close().await;
        assert_eq!(session.state().await, SessionState::Closed);

        let err = session.invoke("echo", json!({})).await.expect_err("closed");
        assert!(matches!(err, SessionError::Closed { .. }));
    }

    #[tokio::test]
    async fn refused_tcp_endpoint_is_a_retryable_connection_error() {
        // Bind then drop to find a port nothing listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let err = Session::connect(
            "unreachable",
            SessionTransport::Tcp {
                host: "127.0.0.1".to_string(),
                port,
            },
            Duration::from_millis(200),
        )
        .await
        .expect_err("nothing listening");
        assert!(err.is_retryable());
    }
}

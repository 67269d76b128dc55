//! JSON-lines RPC over TCP
//!
//! The transport channel between hub and satellite:
//! - request: `{"id": 1, "method": "announce", "params": []}` (no `id` for notifications)
//! - response: `{"id": 1, "result": false}` or `{"id": 1, "error": "..."}`
//!
//! Requests of one session are handled strictly in order.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::RpcError;

/// Positional call arguments
pub type Params = Vec<Value>;

/// Connection state of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

#[derive(Debug, Serialize, Deserialize)]
struct Request {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    method: String,
    #[serde(default)]
    params: Params,
}

#[derive(Debug, Serialize, Deserialize)]
struct Response {
    id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Client side of the transport channel
#[async_trait]
pub trait RpcChannel: Send + Sync {
    /// Call a remote function and wait for its result
    async fn call(&self, method: &str, params: Params) -> Result<Value, RpcError>;

    /// Send a call without waiting for a result
    async fn notify(&self, method: &str, params: Params) -> Result<(), RpcError>;

    fn connection_state(&self) -> ConnectionState;

    /// Apply a timeout to every following call
    fn set_timeout(&self, timeout: Duration);

    /// Let following calls wait until a result arrives or the connection drops
    fn clear_timeout(&self);

    fn local_addr(&self) -> Option<SocketAddr>;

    fn close(&self);
}

/// Creates fresh channels to one peer
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn RpcChannel>, RpcError>;
}

/// Connects with `RpcClient` to a fixed address
pub struct TcpConnector {
    address: String,
}

impl TcpConnector {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<Arc<dyn RpcChannel>, RpcError> {
        let client = RpcClient::connect(&self.address).await?;
        Ok(Arc::new(client))
    }
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, RpcError>>>>>;

/// TCP client of the transport channel
pub struct RpcClient {
    outgoing_tx: mpsc::UnboundedSender<String>,
    pending: PendingMap,
    next_id: AtomicU64,
    timeout: Mutex<Option<Duration>>,
    connected: Arc<AtomicBool>,
    local_addr: SocketAddr,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl RpcClient {
    /// Connect to a server
    pub async fn connect(address: &str) -> Result<Self, RpcError> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| RpcError::Connect(format!("{}: {}", address, e)))?;
        stream.set_nodelay(true)?;
        let local_addr = stream.local_addr()?;

        let (read_half, mut write_half) = stream.into_split();
        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<String>();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));

        let writer_connected = connected.clone();
        let writer = tokio::spawn(async move {
            while let Some(mut line) = outgoing_rx.recv().await {
                line.push('\n');
                if let Err(e) = write_half.write_all(line.as_bytes()).await {
                    warn!("RPC send failed: {}", e);
                    writer_connected.store(false, Ordering::SeqCst);
                    break;
                }
            }
        });

        let reader_pending = pending.clone();
        let reader_connected = connected.clone();
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();

            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match serde_json::from_str::<Response>(&line) {
                        Ok(response) => {
                            let waiter = reader_pending.lock().remove(&response.id);
                            if let Some(tx) = waiter {
                                let result = match response.error {
                                    Some(error) => Err(RpcError::Remote(error)),
                                    None => Ok(response.result.unwrap_or(Value::Null)),
                                };
                                let _ = tx.send(result);
                            } else {
                                debug!("Dropping late response {}", response.id);
                            }
                        }
                        Err(e) => warn!("Failed to parse RPC response: {}", e),
                    },
                    Ok(None) => {
                        debug!("RPC connection closed by peer");
                        break;
                    }
                    Err(e) => {
                        warn!("RPC receive error: {}", e);
                        break;
                    }
                }
            }

            reader_connected.store(false, Ordering::SeqCst);
            fail_pending(&reader_pending);
        });

        Ok(Self {
            outgoing_tx,
            pending,
            next_id: AtomicU64::new(1),
            timeout: Mutex::new(None),
            connected,
            local_addr,
            reader,
            writer,
        })
    }

    fn send_line(&self, request: &Request) -> Result<(), RpcError> {
        let line = serde_json::to_string(request)?;
        self.outgoing_tx.send(line).map_err(|_| RpcError::Closed)
    }
}

fn fail_pending(pending: &PendingMap) {
    let waiters: Vec<_> = pending.lock().drain().collect();
    for (_, tx) in waiters {
        let _ = tx.send(Err(RpcError::Closed));
    }
}

#[async_trait]
impl RpcChannel for RpcClient {
    async fn call(&self, method: &str, params: Params) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        // the reader drains pending calls after flagging the disconnect
        if !self.connected.load(Ordering::SeqCst) {
            self.pending.lock().remove(&id);
            return Err(RpcError::Closed);
        }

        let request = Request {
            id: Some(id),
            method: method.to_string(),
            params,
        };
        if let Err(e) = self.send_line(&request) {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        let timeout = *self.timeout.lock();
        let result = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(result) => result,
                Err(_) => {
                    self.pending.lock().remove(&id);
                    return Err(RpcError::Timeout);
                }
            },
            None => rx.await,
        };

        result.unwrap_or(Err(RpcError::Closed))
    }

    async fn notify(&self, method: &str, params: Params) -> Result<(), RpcError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(RpcError::Closed);
        }
        self.send_line(&Request {
            id: None,
            method: method.to_string(),
            params,
        })
    }

    fn connection_state(&self) -> ConnectionState {
        if self.connected.load(Ordering::SeqCst) {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    fn set_timeout(&self, timeout: Duration) {
        *self.timeout.lock() = Some(timeout);
    }

    fn clear_timeout(&self) {
        *self.timeout.lock() = None;
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local_addr)
    }

    fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.reader.abort();
        self.writer.abort();
        fail_pending(&self.pending);
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Lets a handler end its session or the whole server
#[derive(Clone)]
pub struct SessionControl {
    exit: Arc<AtomicBool>,
    stop_tx: Arc<watch::Sender<bool>>,
}

impl SessionControl {
    /// Close the current session once the running call has been answered
    pub fn post_exit(&self) {
        self.exit.store(true, Ordering::SeqCst);
    }

    /// Stop accepting connections and end all sessions
    pub fn stop_server(&self) {
        self.stop_tx.send_replace(true);
    }

    fn exit_requested(&self) -> bool {
        self.exit.load(Ordering::SeqCst)
    }
}

type Handler =
    Arc<dyn Fn(Params, SessionControl) -> BoxFuture<'static, Result<Value, RpcError>> + Send + Sync>;

/// TCP server of the transport channel
pub struct RpcServer {
    handlers: Arc<RwLock<HashMap<String, Handler>>>,
    stop_tx: Arc<watch::Sender<bool>>,
}

impl Default for RpcServer {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcServer {
    pub fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
            stop_tx: Arc::new(stop_tx),
        }
    }

    /// Register a handler; may be called while the server is running
    pub fn bind<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(Params, SessionControl) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |params, ctl| handler(params, ctl).boxed());
        self.handlers.write().insert(name.to_string(), handler);
    }

    pub fn is_bound(&self, name: &str) -> bool {
        self.handlers.read().contains_key(name)
    }

    /// Start listening in the background, returns the bound address
    pub async fn listen(&self, address: &str) -> Result<SocketAddr, RpcError> {
        let listener = TcpListener::bind(address).await?;
        let local_addr = listener.local_addr()?;
        info!("RPC server listening on {}", local_addr);

        let handlers = self.handlers.clone();
        let stop_tx = self.stop_tx.clone();
        let mut stop_rx = self.stop_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stopped(&mut stop_rx) => {
                        info!("RPC server stopped");
                        break;
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            info!("RPC session opened from {}", peer);
                            tokio::spawn(run_session(stream, peer, handlers.clone(), stop_tx.clone()));
                        }
                        Err(e) => warn!("Failed to accept RPC connection: {}", e),
                    }
                }
            }
        });

        Ok(local_addr)
    }

    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }
}

/// Resolves once the server has been stopped
async fn stopped(stop_rx: &mut watch::Receiver<bool>) {
    while !*stop_rx.borrow_and_update() {
        if stop_rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn run_session(
    stream: TcpStream,
    peer: SocketAddr,
    handlers: Arc<RwLock<HashMap<String, Handler>>>,
    stop_tx: Arc<watch::Sender<bool>>,
) {
    let _ = stream.set_nodelay(true);
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let mut stop_rx = stop_tx.subscribe();
    let ctl = SessionControl {
        exit: Arc::new(AtomicBool::new(false)),
        stop_tx,
    };

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = stopped(&mut stop_rx) => break,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("RPC session {} receive error: {}", peer, e);
                break;
            }
        };

        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!("Failed to parse RPC request from {}: {}", peer, e);
                continue;
            }
        };

        let handler = handlers.read().get(&request.method).cloned();
        let result = match handler {
            Some(handler) => handler(request.params, ctl.clone()).await,
            None => Err(RpcError::UnknownMethod(request.method.clone())),
        };

        if let Some(id) = request.id {
            let response = match result {
                Ok(value) => Response {
                    id,
                    result: Some(value),
                    error: None,
                },
                Err(e) => Response {
                    id,
                    result: None,
                    error: Some(e.to_string()),
                },
            };

            let mut bytes = match serde_json::to_vec(&response) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Failed to serialize RPC response: {}", e);
                    continue;
                }
            };
            bytes.push(b'\n');

            if let Err(e) = write_half.write_all(&bytes).await {
                warn!("RPC session {} send error: {}", peer, e);
                break;
            }
        } else if let Err(e) = result {
            debug!("Notification {} failed: {}", request.method, e);
        }

        if ctl.exit_requested() {
            break;
        }
    }

    let _ = write_half.shutdown().await;
    info!("RPC session with {} closed", peer);
}

/// Decode the positional parameter at `index`
pub fn param<T: DeserializeOwned>(params: &Params, index: usize) -> Result<T, RpcError> {
    let value = params
        .get(index)
        .cloned()
        .ok_or_else(|| RpcError::InvalidParams(format!("missing parameter {}", index)))?;

    serde_json::from_value(value)
        .map_err(|e| RpcError::InvalidParams(format!("parameter {}: {}", index, e)))
}

/// Function names of the transport channel
pub mod methods {
    pub const ANNOUNCE: &str = "announce";
    pub const PEER_READY: &str = "peer-ready";
    pub const GRACEFUL_EXIT: &str = "graceful-exit";
    pub const RETRIEVE_EVENTS: &str = "retrieve-events";
    pub const RETRIEVE_EVENTS_AND_ERRORS: &str = "retrieve-events-and-errors";
    pub const PUSH_VAR: &str = "push-var";

    pub const ENERGY_ENFORCE_LIMITS: &str = "energy-enforce-limits";

    pub const EVSE_GET_EVSE: &str = "evse-get-evse";
    pub const EVSE_ENABLE_DISABLE: &str = "evse-enable-disable";
    pub const EVSE_AUTHORIZE_RESPONSE: &str = "evse-authorize-response";
    pub const EVSE_WITHDRAW_AUTHORIZATION: &str = "evse-withdraw-authorization";
    pub const EVSE_RESERVE: &str = "evse-reserve";
    pub const EVSE_CANCEL_RESERVATION: &str = "evse-cancel-reservation";
    pub const EVSE_SET_FAULTED: &str = "evse-set-faulted";
    pub const EVSE_PAUSE_CHARGING: &str = "evse-pause-charging";
    pub const EVSE_RESUME_CHARGING: &str = "evse-resume-charging";
    pub const EVSE_STOP_TRANSACTION: &str = "evse-stop-transaction";
    pub const EVSE_FORCE_UNLOCK: &str = "evse-force-unlock";
    pub const EVSE_SET_EXTERNAL_LIMITS: &str = "evse-set-external-limits";
    pub const EVSE_SWITCH_THREE_PHASES: &str = "evse-switch-three-phases";
    pub const EVSE_SET_CERTIFICATE_RESPONSE: &str = "evse-set-certificate-response";
    pub const EVSE_EXTERNAL_READY: &str = "evse-external-ready";

    pub const SYSTEM_UPDATE_FIRMWARE: &str = "system-update-firmware";
    pub const SYSTEM_ALLOW_FIRMWARE_INSTALLATION: &str = "system-allow-firmware-installation";
    pub const SYSTEM_UPLOAD_LOGS: &str = "system-upload-logs";
    pub const SYSTEM_IS_RESET_ALLOWED: &str = "system-is-reset-allowed";
    pub const SYSTEM_RESET: &str = "system-reset";
    pub const SYSTEM_SET_SYSTEM_TIME: &str = "system-set-system-time";
    pub const SYSTEM_GET_BOOT_REASON: &str = "system-get-boot-reason";
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn start_server() -> (RpcServer, SocketAddr) {
        let server = RpcServer::new();
        server.bind("add", |params, _| async move {
            let a: i64 = param(&params, 0)?;
            let b: i64 = param(&params, 1)?;
            Ok(json!(a + b))
        });
        server.bind("slow", |_, _| async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(Value::Null)
        });
        server.bind("bye", |_, ctl| async move {
            ctl.post_exit();
            Ok(json!("bye"))
        });

        let addr = server.listen("127.0.0.1:0").await.unwrap();
        (server, addr)
    }

    #[tokio::test]
    async fn test_call_roundtrip() {
        let (_server, addr) = start_server().await;
        let client = RpcClient::connect(&addr.to_string()).await.unwrap();

        let result = client.call("add", vec![json!(2), json!(40)]).await.unwrap();
        assert_eq!(result, json!(42));
        assert_eq!(client.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_unknown_method_is_an_error() {
        let (_server, addr) = start_server().await;
        let client = RpcClient::connect(&addr.to_string()).await.unwrap();

        let err = client.call("nope", vec![]).await.unwrap_err();
        assert!(matches!(err, RpcError::Remote(msg) if msg.contains("nope")));
    }

    #[tokio::test]
    async fn test_invalid_params_are_reported() {
        let (_server, addr) = start_server().await;
        let client = RpcClient::connect(&addr.to_string()).await.unwrap();

        let err = client.call("add", vec![json!("x")]).await.unwrap_err();
        assert!(matches!(err, RpcError::Remote(_)));
    }

    #[tokio::test]
    async fn test_timeout_and_clear() {
        let (_server, addr) = start_server().await;
        let client = RpcClient::connect(&addr.to_string()).await.unwrap();

        client.set_timeout(Duration::from_millis(50));
        let err = client.call("slow", vec![]).await.unwrap_err();
        assert!(matches!(err, RpcError::Timeout));

        client.clear_timeout();
        let result = client.call("slow", vec![]).await.unwrap();
        assert_eq!(result, Value::Null);
    }

    #[tokio::test]
    async fn test_post_exit_closes_session() {
        let (_server, addr) = start_server().await;
        let client = RpcClient::connect(&addr.to_string()).await.unwrap();

        let result = client.call("bye", vec![]).await.unwrap();
        assert_eq!(result, json!("bye"));

        for _ in 0..50 {
            if client.connection_state() == ConnectionState::Disconnected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
        assert!(matches!(client.call("add", vec![]).await, Err(RpcError::Closed)));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = RpcClient::connect(&addr.to_string()).await.err().unwrap();
        assert!(err.is_retryable_connect());
    }
}

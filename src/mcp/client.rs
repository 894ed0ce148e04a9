//! Peer client — one JSON-RPC session against an external MCP peer.
//!
//! A long-lived receive loop owns the inbound side of the transport and
//! routes responses to per-request one-shot channels held in the pending
//! table.  Every request completes exactly once: with its matched response,
//! a timeout, or cancellation when the session closes — and the pending
//! entry is removed in all three cases.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::protocol::{
    CallToolResult, ClientCapabilities, ClientInfo, Frame, GetPromptResult, IdGenerator,
    InitializeRequest, InitializeResponse, ListPromptsResult, ListResourcesResult,
    ListToolsResult, PromptDescriptor, ReadResourceResult, ResourceDescriptor,
    ServerCapabilities, ServerInfo, ToolDescriptor, METHOD_NOT_FOUND, PROTOCOL_VERSION,
};
use super::transport::{Transport, TransportError};

/// Default budget for a single peer request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("peer already connected")]
    AlreadyConnected,
    #[error("peer not ready")]
    NotReady,
    #[error("request timed out")]
    Timeout,
    #[error("session closed while waiting for response")]
    Cancelled,
    #[error("protocol version mismatch: client={client}, server={server}")]
    VersionMismatch { client: String, server: String },
    #[error("peer error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone)]
pub struct PeerClientConfig {
    pub name: String,
    pub version: String,
    pub capabilities: ClientCapabilities,
    pub request_timeout: Duration,
}

impl PeerClientConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            capabilities: ClientCapabilities::default(),
            request_timeout: REQUEST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

type ChangeHandler<T> = Arc<dyn Fn(Vec<T>) + Send + Sync>;

#[derive(Default)]
struct ChangeHandlers {
    resources: std::sync::RwLock<Option<ChangeHandler<ResourceDescriptor>>>,
    tools: std::sync::RwLock<Option<ChangeHandler<ToolDescriptor>>>,
    prompts: std::sync::RwLock<Option<ChangeHandler<PromptDescriptor>>>,
}

pub struct PeerClient {
    config: PeerClientConfig,
    transport: Arc<dyn Transport>,
    ids: IdGenerator,
    pending: Mutex<HashMap<u64, oneshot::Sender<Frame>>>,
    server_info: std::sync::RwLock<Option<ServerInfo>>,
    server_caps: std::sync::RwLock<Option<ServerCapabilities>>,
    connected: AtomicBool,
    initialized: AtomicBool,
    shutdown: watch::Sender<bool>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    handlers: ChangeHandlers,
}

impl PeerClient {
    /// The transport must already be connected.
    pub fn new(config: PeerClientConfig, transport: Arc<dyn Transport>) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            config,
            transport,
            ids: IdGenerator::new(),
            pending: Mutex::new(HashMap::new()),
            server_info: std::sync::RwLock::new(None),
            server_caps: std::sync::RwLock::new(None),
            connected: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            shutdown,
            loop_handle: Mutex::new(None),
            handlers: ChangeHandlers::default(),
        })
    }

    // ─── Lifecycle ──────────────────────────────────────────────────────────

    /// Start the receive loop and perform the initialize handshake.
    pub async fn connect(self: &Arc<Self>) -> Result<(), PeerError> {
        if self.connected.load(Ordering::SeqCst) {
            return Err(PeerError::AlreadyConnected);
        }
        if !self.transport.is_connected() {
            return Err(TransportError::NotConnected.into());
        }

        let loop_self = self.clone();
        let handle = tokio::spawn(async move { loop_self.receive_loop().await });
        *self.loop_handle.lock().await = Some(handle);

        match self.initialize().await {
            Ok(()) => {
                self.connected.store(true, Ordering::SeqCst);
                debug!(peer = %self.config.name, "peer client connected and initialized");
                Ok(())
            }
            Err(e) => {
                self.shutdown.send_replace(true);
                Err(e)
            }
        }
    }

    async fn initialize(self: &Arc<Self>) -> Result<(), PeerError> {
        let params = InitializeRequest {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: self.config.capabilities.clone(),
            client_info: ClientInfo {
                name: self.config.name.clone(),
                version: self.config.version.clone(),
            },
        };
        let result = self
            .rpc("initialize", Some(serde_json::to_value(params).unwrap_or(Value::Null)))
            .await?;

        let init: InitializeResponse =
            serde_json::from_value(result).map_err(|e| PeerError::Protocol(e.to_string()))?;
        if init.protocol_version != PROTOCOL_VERSION {
            return Err(PeerError::VersionMismatch {
                client: PROTOCOL_VERSION.to_string(),
                server: init.protocol_version,
            });
        }

        *self.server_info.write().unwrap() = Some(init.server_info);
        *self.server_caps.write().unwrap() = Some(init.capabilities);
        self.initialized.store(true, Ordering::SeqCst);

        self.transport
            .send(&Frame::notification("notifications/initialized", None))
            .await?;
        Ok(())
    }

    /// Tear the session down: stop the loop, close the transport, and release
    /// every in-flight waiter.
    pub async fn close(&self) {
        self.shutdown.send_replace(true);
        self.transport.close().await;

        if let Some(handle) = self.loop_handle.lock().await.take() {
            let _ = handle.await;
        }

        // Dropping the senders resolves each waiter with a cancellation.
        self.pending.lock().await.clear();

        self.connected.store(false, Ordering::SeqCst);
        self.initialized.store(false, Ordering::SeqCst);
        debug!(peer = %self.config.name, "peer client disconnected");
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.transport.is_connected()
    }

    /// Connected and handshake complete.
    pub fn is_ready(&self) -> bool {
        self.is_connected() && self.initialized.load(Ordering::SeqCst)
    }

    pub fn server_info(&self) -> Option<ServerInfo> {
        self.server_info.read().unwrap().clone()
    }

    pub fn server_capabilities(&self) -> Option<ServerCapabilities> {
        self.server_caps.read().unwrap().clone()
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    // ─── Correlation ────────────────────────────────────────────────────────

    /// Send a request and wait for its response, bounded by the configured
    /// timeout and the session's lifetime.
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Frame, PeerError> {
        let mut shutdown = self.shutdown.subscribe();
        if !self.transport.is_connected() {
            return Err(TransportError::NotConnected.into());
        }

        let id = self.ids.next();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let frame = Frame::request(id, method, params);
        if let Err(e) = self.transport.send(&frame).await {
            self.pending.lock().await.remove(&id);
            return Err(e.into());
        }

        let outcome = tokio::select! {
            received = rx => match received {
                Ok(frame) => Ok(frame),
                Err(_) => Err(PeerError::Cancelled),
            },
            _ = tokio::time::sleep(self.config.request_timeout) => Err(PeerError::Timeout),
            _ = shutdown.changed() => Err(PeerError::Cancelled),
        };

        self.pending.lock().await.remove(&id);
        outcome
    }

    /// `send_request` plus error-frame unwrapping.
    async fn rpc(&self, method: &str, params: Option<Value>) -> Result<Value, PeerError> {
        let response = self.send_request(method, params).await?;
        if let Some(error) = response.error {
            return Err(PeerError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    fn ensure_ready(&self) -> Result<(), PeerError> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(PeerError::NotReady)
        }
    }

    // ─── Receive loop ───────────────────────────────────────────────────────

    async fn receive_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                received = self.transport.receive() => match received {
                    Ok(frame) => self.process_frame(frame).await,
                    Err(e) => {
                        if !self.transport.is_connected() {
                            warn!(peer = %self.config.name, error = %e, "peer transport closed");
                            self.connected.store(false, Ordering::SeqCst);
                            break;
                        }
                        warn!(peer = %self.config.name, error = %e, "error receiving frame");
                    }
                }
            }
        }
    }

    async fn process_frame(self: &Arc<Self>, frame: Frame) {
        if let Err(e) = frame.validate() {
            warn!(peer = %self.config.name, error = %e.message, "invalid frame from peer");
            return;
        }

        if frame.is_response() {
            self.route_response(frame).await;
        } else if frame.is_notification() {
            self.dispatch_notification(&frame);
        } else if frame.is_request() {
            // Inbound requests from peers are refused until a dispatch table
            // exists for sampling/completion callbacks.
            let id = frame.id.clone().unwrap_or(Value::Null);
            let reply = Frame::error_response(id, METHOD_NOT_FOUND, "method not implemented", None);
            if let Err(e) = self.transport.send(&reply).await {
                warn!(peer = %self.config.name, error = %e, "failed to refuse peer request");
            }
        }
    }

    async fn route_response(&self, frame: Frame) {
        let Some(id) = frame.id.as_ref().and_then(Value::as_u64) else {
            warn!(peer = %self.config.name, id = ?frame.id, "response with unroutable id");
            return;
        };
        match self.pending.lock().await.remove(&id) {
            Some(waiter) => {
                // A waiter that timed out concurrently just drops the frame.
                let _ = waiter.send(frame);
            }
            None => {
                warn!(peer = %self.config.name, id, "response for unknown request id");
            }
        }
    }

    fn dispatch_notification(self: &Arc<Self>, frame: &Frame) {
        let method = frame.method.as_deref().unwrap_or_default();
        match method {
            "notifications/resources/list_changed" => {
                let handler = self.handlers.resources.read().unwrap().clone();
                if let Some(handler) = handler {
                    let client = self.clone();
                    tokio::spawn(async move {
                        if let Ok(result) = client.list_resources().await {
                            handler(result.resources);
                        }
                    });
                }
            }
            "notifications/tools/list_changed" => {
                let handler = self.handlers.tools.read().unwrap().clone();
                if let Some(handler) = handler {
                    let client = self.clone();
                    tokio::spawn(async move {
                        if let Ok(result) = client.list_tools().await {
                            handler(result.tools);
                        }
                    });
                }
            }
            "notifications/prompts/list_changed" => {
                let handler = self.handlers.prompts.read().unwrap().clone();
                if let Some(handler) = handler {
                    let client = self.clone();
                    tokio::spawn(async move {
                        if let Ok(result) = client.list_prompts().await {
                            handler(result.prompts);
                        }
                    });
                }
            }
            other => {
                debug!(peer = %self.config.name, method = other, "unhandled notification");
            }
        }
    }

    // ─── Change handlers ────────────────────────────────────────────────────

    pub fn on_resources_changed(&self, handler: impl Fn(Vec<ResourceDescriptor>) + Send + Sync + 'static) {
        *self.handlers.resources.write().unwrap() = Some(Arc::new(handler));
    }

    pub fn on_tools_changed(&self, handler: impl Fn(Vec<ToolDescriptor>) + Send + Sync + 'static) {
        *self.handlers.tools.write().unwrap() = Some(Arc::new(handler));
    }

    pub fn on_prompts_changed(&self, handler: impl Fn(Vec<PromptDescriptor>) + Send + Sync + 'static) {
        *self.handlers.prompts.write().unwrap() = Some(Arc::new(handler));
    }

    // ─── Catalog operations ─────────────────────────────────────────────────

    pub async fn list_resources(&self) -> Result<ListResourcesResult, PeerError> {
        self.ensure_ready()?;
        let result = self.rpc("resources/list", None).await?;
        serde_json::from_value(result).map_err(|e| PeerError::Protocol(e.to_string()))
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, PeerError> {
        self.ensure_ready()?;
        let result = self.rpc("resources/read", Some(json!({ "uri": uri }))).await?;
        serde_json::from_value(result).map_err(|e| PeerError::Protocol(e.to_string()))
    }

    pub async fn list_tools(&self) -> Result<ListToolsResult, PeerError> {
        self.ensure_ready()?;
        let result = self.rpc("tools/list", None).await?;
        serde_json::from_value(result).map_err(|e| PeerError::Protocol(e.to_string()))
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult, PeerError> {
        self.ensure_ready()?;
        let result = self
            .rpc("tools/call", Some(json!({ "name": name, "arguments": arguments })))
            .await?;
        serde_json::from_value(result).map_err(|e| PeerError::Protocol(e.to_string()))
    }

    pub async fn list_prompts(&self) -> Result<ListPromptsResult, PeerError> {
        self.ensure_ready()?;
        let result = self.rpc("prompts/list", None).await?;
        serde_json::from_value(result).map_err(|e| PeerError::Protocol(e.to_string()))
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<Value>,
    ) -> Result<GetPromptResult, PeerError> {
        self.ensure_ready()?;
        let mut params = json!({ "name": name });
        if let Some(arguments) = arguments {
            params["arguments"] = arguments;
        }
        let result = self.rpc("prompts/get", Some(params)).await?;
        serde_json::from_value(result).map_err(|e| PeerError::Protocol(e.to_string()))
    }

    /// Number of in-flight requests; exposed for tests.
    pub async fn pending_requests(&self) -> usize {
        self.pending.lock().await.len()
    }
}

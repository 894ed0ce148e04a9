//! Peer manager — named registry of MCP peer sessions.
//!
//! Holds the configured peer descriptors and the live sessions, connects and
//! disconnects peers on demand, aggregates catalogs across ready sessions,
//! and runs the periodic health monitor that revives dead auto-start peers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::client::{PeerClient, PeerClientConfig};
use super::protocol::{
    CallToolResult, PromptDescriptor, ReadResourceResult, ResourceDescriptor, ServerCapabilities,
    ServerInfo, ToolDescriptor,
};
use super::transport::{build_transport, Transport, TransportConfig};

/// Default health monitor period.
pub const HEALTH_INTERVAL: Duration = Duration::from_secs(30);
/// Budget for one (re)connection attempt.
pub const CONNECT_BUDGET: Duration = Duration::from_secs(30);
/// Budget for catalog fetches inside a status snapshot.
const STATUS_FETCH_BUDGET: Duration = Duration::from_secs(5);

fn default_enabled() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    30
}

/// One configured peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Absent for sessions installed over an externally built transport
    /// (in-process peers in tests).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportConfig>,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub retry_delay_secs: u64,
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

/// Point-in-time snapshot of one peer, served by the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct PeerStatus {
    pub name: String,
    pub connected: bool,
    pub initialized: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_info: Option<ServerInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<ServerCapabilities>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceDescriptor>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDescriptor>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub prompts: Vec<PromptDescriptor>,
}

pub struct PeerManager {
    client_name: String,
    health_interval: Duration,
    configs: RwLock<HashMap<String, PeerConfig>>,
    clients: RwLock<HashMap<String, Arc<PeerClient>>>,
    health_handle: Mutex<Option<JoinHandle<()>>>,
}

impl PeerManager {
    pub fn new(configs: HashMap<String, PeerConfig>) -> Arc<Self> {
        Arc::new(Self {
            client_name: "gadgetd".to_string(),
            health_interval: HEALTH_INTERVAL,
            configs: RwLock::new(configs),
            clients: RwLock::new(HashMap::new()),
            health_handle: Mutex::new(None),
        })
    }

    /// Spawn the health monitor and connect every enabled auto-start peer.
    pub async fn start(self: &Arc<Self>) {
        let monitor = self.clone();
        let handle = tokio::spawn(async move { monitor.health_loop().await });
        *self.health_handle.lock().await = Some(handle);

        let (configured, auto) = {
            let configs = self.configs.read().await;
            let auto: Vec<String> = configs
                .values()
                .filter(|c| c.enabled && c.auto_start)
                .map(|c| c.name.clone())
                .collect();
            (configs.len(), auto)
        };
        info!(configured, auto_start = auto.len(), "peer manager started");
        for name in auto {
            if let Err(e) = self.connect(&name).await {
                warn!(peer = %name, error = %e, "failed to auto-connect peer");
            }
        }
    }

    // ─── Connection management ──────────────────────────────────────────────

    pub async fn connect(&self, name: &str) -> Result<()> {
        let config = {
            let configs = self.configs.read().await;
            configs
                .get(name)
                .cloned()
                .with_context(|| format!("peer {name} not configured"))?
        };
        if !config.enabled {
            bail!("peer {name} is disabled");
        }

        // A dead session is replaced; a live one is an error.
        {
            let mut clients = self.clients.write().await;
            if let Some(existing) = clients.get(name) {
                if existing.is_connected() {
                    bail!("peer {name} already connected");
                }
                clients.remove(name);
            }
        }

        let Some(transport_config) = config.transport.as_ref() else {
            bail!("peer {name} has no transport configured");
        };
        let transport = build_transport(transport_config, &config.environment)
            .await
            .with_context(|| format!("failed to build transport for peer {name}"))?;

        self.install_session(&config, Arc::from(transport)).await
    }

    /// Install a session over an externally built, already-connected
    /// transport.  This is how the test suite wires in-process peers.
    pub async fn connect_with(&self, name: &str, transport: Box<dyn Transport>) -> Result<()> {
        let config = {
            let mut configs = self.configs.write().await;
            configs
                .entry(name.to_string())
                .or_insert_with(|| PeerConfig {
                    name: name.to_string(),
                    description: "in-process peer".to_string(),
                    transport: None,
                    auto_start: false,
                    enabled: true,
                    timeout_secs: default_timeout_secs(),
                    retry_count: 0,
                    retry_delay_secs: 0,
                    environment: HashMap::new(),
                })
                .clone()
        };
        self.install_session(&config, Arc::from(transport)).await
    }

    async fn install_session(
        &self,
        config: &PeerConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<()> {
        let client_config = PeerClientConfig::new(format!("{}-{}", self.client_name, config.name))
            .with_timeout(Duration::from_secs(config.timeout_secs));
        let client = PeerClient::new(client_config, transport);

        if let Err(e) = client.connect().await {
            // No half-open sessions: a failed handshake tears the transport down.
            client.close().await;
            bail!("failed to initialize peer {}: {e}", config.name);
        }

        self.clients
            .write()
            .await
            .insert(config.name.clone(), client);
        info!(peer = %config.name, "connected to peer");
        Ok(())
    }

    pub async fn disconnect(&self, name: &str) -> Result<()> {
        let client = self
            .clients
            .write()
            .await
            .remove(name)
            .with_context(|| format!("peer {name} not connected"))?;
        client.close().await;
        info!(peer = %name, "disconnected from peer");
        Ok(())
    }

    /// A ready session, or an error naming what is wrong.
    pub async fn client(&self, name: &str) -> Result<Arc<PeerClient>> {
        let clients = self.clients.read().await;
        let client = clients
            .get(name)
            .with_context(|| format!("peer {name} not connected"))?;
        if !client.is_ready() {
            bail!("peer {name} not ready");
        }
        Ok(client.clone())
    }

    async fn ready_clients(&self) -> Vec<(String, Arc<PeerClient>)> {
        self.clients
            .read()
            .await
            .iter()
            .filter(|(_, c)| c.is_ready())
            .map(|(n, c)| (n.clone(), c.clone()))
            .collect()
    }

    // ─── Aggregation ────────────────────────────────────────────────────────

    /// Resources across all ready peers. Failing peers are logged and omitted.
    pub async fn list_resources(&self) -> HashMap<String, Vec<ResourceDescriptor>> {
        let mut out = HashMap::new();
        for (name, client) in self.ready_clients().await {
            match client.list_resources().await {
                Ok(result) => {
                    out.insert(name, result.resources);
                }
                Err(e) => warn!(peer = %name, error = %e, "failed to list resources"),
            }
        }
        out
    }

    /// Tools across all ready peers. Failing peers are logged and omitted.
    pub async fn list_tools(&self) -> HashMap<String, Vec<ToolDescriptor>> {
        let mut out = HashMap::new();
        for (name, client) in self.ready_clients().await {
            match client.list_tools().await {
                Ok(result) => {
                    out.insert(name, result.tools);
                }
                Err(e) => warn!(peer = %name, error = %e, "failed to list tools"),
            }
        }
        out
    }

    pub async fn call_tool(
        &self,
        peer: &str,
        tool: &str,
        arguments: serde_json::Value,
    ) -> Result<CallToolResult> {
        let client = self.client(peer).await?;
        Ok(client.call_tool(tool, arguments).await?)
    }

    pub async fn read_resource(&self, peer: &str, uri: &str) -> Result<ReadResourceResult> {
        let client = self.client(peer).await?;
        Ok(client.read_resource(uri).await?)
    }

    // ─── Introspection ──────────────────────────────────────────────────────

    pub async fn peer_configs(&self) -> HashMap<String, PeerConfig> {
        self.configs.read().await.clone()
    }

    /// Snapshot of every configured peer, with catalogs where available.
    pub async fn status(&self) -> HashMap<String, PeerStatus> {
        let configs = self.configs.read().await.clone();
        let clients = self.clients.read().await.clone();

        let mut out = HashMap::new();
        for name in configs.keys() {
            let mut status = PeerStatus {
                name: name.clone(),
                connected: false,
                initialized: false,
                server_info: None,
                capabilities: None,
                resources: Vec::new(),
                tools: Vec::new(),
                prompts: Vec::new(),
            };
            if let Some(client) = clients.get(name) {
                status.connected = client.is_connected();
                status.initialized = client.is_ready();
                status.server_info = client.server_info();
                status.capabilities = client.server_capabilities();
                if client.is_ready() {
                    if let Ok(Ok(r)) =
                        tokio::time::timeout(STATUS_FETCH_BUDGET, client.list_resources()).await
                    {
                        status.resources = r.resources;
                    }
                    if let Ok(Ok(t)) =
                        tokio::time::timeout(STATUS_FETCH_BUDGET, client.list_tools()).await
                    {
                        status.tools = t.tools;
                    }
                    if let Ok(Ok(p)) =
                        tokio::time::timeout(STATUS_FETCH_BUDGET, client.list_prompts()).await
                    {
                        status.prompts = p.prompts;
                    }
                }
            }
            out.insert(name.clone(), status);
        }
        out
    }

    pub async fn add_peer(&self, config: PeerConfig) {
        info!(peer = %config.name, "added peer configuration");
        self.configs
            .write()
            .await
            .insert(config.name.clone(), config);
    }

    /// Drop a peer's configuration, disconnecting it first if needed.
    pub async fn remove_peer(&self, name: &str) {
        if let Some(client) = self.clients.write().await.remove(name) {
            client.close().await;
        }
        self.configs.write().await.remove(name);
        info!(peer = %name, "removed peer");
    }

    // ─── Health monitoring ──────────────────────────────────────────────────

    async fn health_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.health_interval);
        interval.tick().await; // consume the immediate first tick
        loop {
            interval.tick().await;
            self.health_check().await;
        }
    }

    async fn health_check(&self) {
        let snapshot: Vec<(String, Arc<PeerClient>)> = self
            .clients
            .read()
            .await
            .iter()
            .map(|(n, c)| (n.clone(), c.clone()))
            .collect();

        for (name, client) in snapshot {
            if client.is_connected() {
                continue;
            }
            let auto_start = self
                .configs
                .read()
                .await
                .get(&name)
                .map(|c| c.auto_start)
                .unwrap_or(false);
            warn!(peer = %name, auto_start, "health check: peer disconnected");
            if !auto_start {
                continue;
            }
            match tokio::time::timeout(CONNECT_BUDGET, self.connect(&name)).await {
                Ok(Ok(())) => info!(peer = %name, "health check: peer reconnected"),
                Ok(Err(e)) => warn!(peer = %name, error = %e, "health check: reconnect failed"),
                Err(_) => warn!(peer = %name, "health check: reconnect timed out"),
            }
        }
    }

    /// Stop the health monitor and close every session.
    pub async fn stop(&self) {
        if let Some(handle) = self.health_handle.lock().await.take() {
            handle.abort();
        }
        let clients: Vec<_> = self.clients.write().await.drain().collect();
        for (name, client) in clients {
            client.close().await;
            info!(peer = %name, "disconnected from peer");
        }
    }
}

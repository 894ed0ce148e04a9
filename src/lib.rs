pub mod auth;
pub mod config;
pub mod gadgets;
pub mod logging;
pub mod mcp;
pub mod rbac;
pub mod rest;
pub mod safefs;

use std::sync::Arc;

use auth::TokenManager;
use config::ServerConfig;
use gadgets::GadgetRunner;
use mcp::PeerManager;
use rbac::PolicyStore;
use safefs::SafeFs;

/// Shared application state passed to every route handler and middleware.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<ServerConfig>,
    pub tokens: Arc<TokenManager>,
    pub policy: PolicyStore,
    pub safefs: Arc<SafeFs>,
    pub gadgets: Arc<GadgetRunner>,
    pub peers: Arc<PeerManager>,
    pub started_at: std::time::Instant,
}

impl AppContext {
    /// Assemble every component from a resolved configuration.
    ///
    /// Seeds the policy store on first start and grants the default roles
    /// when no admin exists yet.
    pub async fn build(config: ServerConfig) -> anyhow::Result<Arc<Self>> {
        let policy = PolicyStore::new(&config.policy_db).await?;
        policy.seed_defaults().await?;
        policy.ensure_default_grants().await?;

        let tokens = Arc::new(TokenManager::new(
            &config.token_secret,
            auth::DEFAULT_TOKEN_TTL,
            auth::DEFAULT_ISSUER,
        ));

        let audit: Arc<dyn safefs::AuditSink> = Arc::new(safefs::TracingAuditSink);
        let safefs = Arc::new(SafeFs::new(
            safefs::SafeFsConfig {
                base_paths: config.allowed_roots.clone(),
                max_file_size: config.max_file_size,
                allowed_exts: config::DEFAULT_ALLOWED_EXTS
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
                denied_paths: Vec::new(),
            },
            audit.clone(),
        ));

        let gadgets = Arc::new(GadgetRunner::new(config.gadget_binary.clone(), audit));

        let peer_configs = match &config.peers_file {
            Some(path) => config::load_peer_configs(path)?,
            None => Default::default(),
        };
        let peers = PeerManager::new(peer_configs);

        Ok(Arc::new(Self {
            config: Arc::new(config),
            tokens,
            policy,
            safefs,
            gadgets,
            peers,
            started_at: std::time::Instant::now(),
        }))
    }
}

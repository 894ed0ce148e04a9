use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use gadgetd::config::{ServerConfig, UserTable, DEFAULT_TOKEN_SECRET};
use gadgetd::AppContext;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "gadgetd", about = "Multi-user gadget server daemon", version)]
struct Args {
    /// HTTP listen port
    #[arg(long, default_value_t = 8080, env = "GADGETD_PORT")]
    port: u16,

    /// Path to the shared gadget launcher binary
    #[arg(long, default_value = "./go-gadget", env = "GADGETD_GADGET_BIN")]
    gadget_bin: PathBuf,

    /// SQLite policy store path
    #[arg(long, default_value = "./gadgetd.db", env = "GADGETD_POLICY_DB")]
    policy_db: PathBuf,

    /// Symmetric secret for signing identity tokens
    #[arg(long, default_value = DEFAULT_TOKEN_SECRET, env = "GADGETD_TOKEN_SECRET")]
    token_secret: String,

    /// Comma-separated list of allowed filesystem base roots
    #[arg(long, default_value = "/tmp,/home,/workspace", env = "GADGETD_ALLOWED_ROOTS")]
    allowed_roots: String,

    /// Maximum file size in bytes for sandboxed reads and writes
    #[arg(long, default_value_t = 10 * 1024 * 1024, env = "GADGETD_MAX_FILE_SIZE")]
    max_file_size: u64,

    /// Optional JSON file of MCP peer descriptors
    #[arg(long, env = "GADGETD_PEERS_FILE")]
    peers_file: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "GADGETD_LOG")]
    log: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(args.log.clone())
        .compact()
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = args.port,
        gadget_binary = %args.gadget_bin.display(),
        policy_db = %args.policy_db.display(),
        "gadgetd starting"
    );

    let gadget_binary = args
        .gadget_bin
        .canonicalize()
        .unwrap_or_else(|_| args.gadget_bin.clone());

    let config = ServerConfig {
        port: args.port,
        gadget_binary,
        policy_db: args.policy_db,
        token_secret: args.token_secret,
        allowed_roots: args
            .allowed_roots
            .split(',')
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .collect(),
        max_file_size: args.max_file_size,
        peers_file: args.peers_file,
        users: UserTable::default_users(),
    };

    if config.uses_default_secret() {
        warn!("running with the built-in token secret; set GADGETD_TOKEN_SECRET in production");
    }
    if config.users.is_default() {
        warn!("default credential table is active (admin/admin123); change it before exposing the server");
    }

    let port = config.port;
    let ctx = AppContext::build(config).await?;
    ctx.peers.start().await;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let result = gadgetd::rest::serve(ctx.clone(), addr).await;

    ctx.peers.stop().await;
    info!("gadgetd stopped");
    result
}

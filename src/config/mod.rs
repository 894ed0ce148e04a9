//! Server configuration.
//!
//! Everything is environment-backed via the clap `Args` in `main.rs`; this
//! module holds the resolved config plus the static user table used by
//! `/api/auth/login`.  Peer descriptors are loaded separately from a JSON
//! file (see [`load_peer_configs`]).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::mcp::PeerConfig;

/// Default filesystem extension allow-list applied to file-mode sandbox
/// validation.
pub const DEFAULT_ALLOWED_EXTS: &[&str] = &[".txt", ".md", ".json", ".yaml", ".yml", ".log"];

/// The development token secret. Startup warns loudly when it is in use.
pub const DEFAULT_TOKEN_SECRET: &str = "gadgetd-secret-key-change-in-production";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Path to the shared gadget launcher binary.
    pub gadget_binary: PathBuf,
    /// SQLite policy store location.
    pub policy_db: PathBuf,
    pub token_secret: String,
    pub allowed_roots: Vec<PathBuf>,
    pub max_file_size: u64,
    /// Optional JSON file of peer descriptors.
    pub peers_file: Option<PathBuf>,
    pub users: UserTable,
}

impl ServerConfig {
    /// True when the configuration still carries the built-in secret.
    pub fn uses_default_secret(&self) -> bool {
        self.token_secret == DEFAULT_TOKEN_SECRET
    }
}

// ─── User table ───────────────────────────────────────────────────────────────

/// A configured login user: SHA-256 password digest plus assigned roles.
#[derive(Debug, Clone)]
pub struct UserEntry {
    pub password_sha256: String,
    pub roles: Vec<String>,
}

/// The static credential table consulted by `/api/auth/login`.
///
/// Passwords are held as SHA-256 hex digests; comparison happens on digests
/// so the plaintext never sits in the config struct.
#[derive(Debug, Clone)]
pub struct UserTable {
    users: HashMap<String, UserEntry>,
}

impl UserTable {
    /// The development roster: admin/admin123, user/user123,
    /// readonly/readonly123.  `is_default` reports when this roster is live
    /// so startup can warn about it.
    pub fn default_users() -> Self {
        let mut users = HashMap::new();
        for (name, password, role) in [
            ("admin", "admin123", "admin"),
            ("user", "user123", "user"),
            ("readonly", "readonly123", "readonly"),
        ] {
            users.insert(
                name.to_string(),
                UserEntry {
                    password_sha256: crate::auth::sha256_hex(password),
                    roles: vec![role.to_string()],
                },
            );
        }
        Self { users }
    }

    pub fn is_default(&self) -> bool {
        self.users
            .get("admin")
            .map(|e| e.password_sha256 == crate::auth::sha256_hex("admin123"))
            .unwrap_or(false)
    }

    /// Validate credentials. Returns the user's roles on success.
    pub fn authenticate(&self, username: &str, password: &str) -> Option<Vec<String>> {
        let entry = self.users.get(username)?;
        if entry.password_sha256 == crate::auth::sha256_hex(password) {
            Some(entry.roles.clone())
        } else {
            None
        }
    }
}

// ─── Peer descriptor file ─────────────────────────────────────────────────────

/// Load peer descriptors from a JSON file mapping peer name to config.
///
/// Missing file is an error; an empty map is fine.
pub fn load_peer_configs(path: &Path) -> Result<HashMap<String, PeerConfig>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read peers file {}", path.display()))?;
    let configs: HashMap<String, PeerConfig> = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse peers file {}", path.display()))?;
    Ok(configs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_users_authenticate() {
        let table = UserTable::default_users();
        assert_eq!(table.authenticate("admin", "admin123"), Some(vec!["admin".to_string()]));
        assert_eq!(table.authenticate("user", "user123"), Some(vec!["user".to_string()]));
        assert!(table.authenticate("admin", "wrong").is_none());
        assert!(table.authenticate("nobody", "admin123").is_none());
    }

    #[test]
    fn default_roster_is_flagged() {
        assert!(UserTable::default_users().is_default());
    }
}

//! Durable policy store: permission rules and role grants.
//!
//! Two tables back the whole model.  `rules` holds `(subject, object,
//! action)` tuples where the subject is either a literal user id or
//! `role:<name>`; `grants` holds `(user_id, role)` assignments.  A request is
//! allowed iff a rule matches the user directly or matches `role:<r>` for
//! some granted (or token-carried) role `r`.
//!
//! The store is the only durable state in the server and must survive
//! restarts intact.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Result};
use serde::Serialize;
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use tracing::info;

/// Subject prefix marking a rule that applies to a role rather than a user.
pub const ROLE_PREFIX: &str = "role:";

/// A single permission tuple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Permission {
    pub subject: String,
    pub object: String,
    pub action: String,
}

/// A role with its granted permissions, as served by the RBAC API.
#[derive(Debug, Clone, Serialize)]
pub struct RoleInfo {
    pub name: String,
    pub description: String,
    pub permissions: Vec<String>,
}

/// A user with its granted roles.
#[derive(Debug, Clone, Serialize)]
pub struct UserInfo {
    pub id: String,
    pub username: String,
    pub roles: Vec<String>,
}

/// Policy store counters for the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct PolicyStats {
    pub policies: i64,
    pub groupings: i64,
    pub roles: i64,
    pub users: i64,
}

/// The default seed roster, inserted exactly once into an empty store.
const DEFAULT_RULES: &[(&str, &str, &str)] = &[
    ("role:admin", "filesystem", "read"),
    ("role:admin", "filesystem", "write"),
    ("role:admin", "filesystem", "execute"),
    ("role:admin", "system", "config"),
    ("role:admin", "system", "manage"),
    ("role:admin", "ai", "access"),
    ("role:admin", "ai", "models"),
    ("role:admin", "users", "manage"),
    ("role:admin", "roles", "manage"),
    ("role:admin", "gadgets", "execute"),
    ("role:admin", "gadgets", "manage"),
    ("role:user", "filesystem", "read"),
    ("role:user", "ai", "access"),
    ("role:user", "gadgets", "execute"),
    ("role:readonly", "filesystem", "read"),
    ("role:ai_user", "filesystem", "read"),
    ("role:ai_user", "filesystem", "write"),
    ("role:ai_user", "ai", "access"),
    ("role:ai_user", "gadgets", "execute"),
];

/// Human description for the built-in roles; empty for custom ones.
pub fn role_description_of(name: &str) -> &'static str {
    match name {
        "admin" => "Full system administrator with all permissions",
        "user" => "Regular user with basic file and AI access",
        "readonly" => "Read-only access to filesystem",
        "ai_user" => "User with AI and limited file system access",
        _ => "",
    }
}

#[derive(Clone)]
pub struct PolicyStore {
    pool: SqlitePool,
}

impl PolicyStore {
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);

        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS rules (
                 subject TEXT NOT NULL,
                 object  TEXT NOT NULL,
                 action  TEXT NOT NULL,
                 PRIMARY KEY (subject, object, action)
             )",
        )
        .execute(pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS grants (
                 user_id TEXT NOT NULL,
                 role    TEXT NOT NULL,
                 PRIMARY KEY (user_id, role)
             )",
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Insert the default roster iff the rules table is empty.
    ///
    /// Idempotent: a second call on a seeded store is a no-op. Returns
    /// whether seeding ran.
    pub async fn seed_defaults(&self) -> Result<bool> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM rules")
            .fetch_one(&self.pool)
            .await?;
        if count > 0 {
            return Ok(false);
        }

        for (subject, object, action) in DEFAULT_RULES {
            sqlx::query("INSERT OR IGNORE INTO rules (subject, object, action) VALUES (?, ?, ?)")
                .bind(subject)
                .bind(object)
                .bind(action)
                .execute(&self.pool)
                .await?;
        }
        info!(count = DEFAULT_RULES.len(), "seeded default permission rules");
        Ok(true)
    }

    /// Grant the default role set when no user holds `admin` yet.
    ///
    /// Mirrors the login table: admin→admin, user→user, readonly→readonly.
    pub async fn ensure_default_grants(&self) -> Result<bool> {
        let (admins,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM grants WHERE role = 'admin'")
                .fetch_one(&self.pool)
                .await?;
        if admins > 0 {
            return Ok(false);
        }
        for (user, role) in [("admin", "admin"), ("user", "user"), ("readonly", "readonly")] {
            sqlx::query("INSERT OR IGNORE INTO grants (user_id, role) VALUES (?, ?)")
                .bind(user)
                .bind(role)
                .execute(&self.pool)
                .await?;
        }
        info!("granted default roles to the built-in users");
        Ok(true)
    }

    // ─── Enforcement ────────────────────────────────────────────────────────

    /// True iff a rule exactly matching `(subject, object, action)` exists,
    /// or the subject is a user holding a role whose `role:<r>` rule matches.
    pub async fn enforce(&self, subject: &str, object: &str, action: &str) -> Result<bool> {
        let (direct,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM rules WHERE subject = ? AND object = ? AND action = ?",
        )
        .bind(subject)
        .bind(object)
        .bind(action)
        .fetch_one(&self.pool)
        .await?;
        if direct > 0 {
            return Ok(true);
        }

        // Role-prefixed subjects have no grants to follow.
        if subject.starts_with(ROLE_PREFIX) {
            return Ok(false);
        }

        let (via_role,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM grants g
             JOIN rules r ON r.subject = 'role:' || g.role
             WHERE g.user_id = ? AND r.object = ? AND r.action = ?",
        )
        .bind(subject)
        .bind(object)
        .bind(action)
        .fetch_one(&self.pool)
        .await?;
        Ok(via_role > 0)
    }

    /// Permission check for an authenticated request: direct user rule first,
    /// then each token-carried role's `role:<r>` rule.
    pub async fn check_user_permission(
        &self,
        user: &str,
        token_roles: &[String],
        object: &str,
        action: &str,
    ) -> Result<bool> {
        if self.enforce(user, object, action).await? {
            return Ok(true);
        }
        for role in token_roles {
            let subject = format!("{ROLE_PREFIX}{role}");
            if self.enforce(&subject, object, action).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// True iff the user has a durable grant for `role`.
    pub async fn has_role(&self, user: &str, role: &str) -> Result<bool> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM grants WHERE user_id = ? AND role = ?")
                .bind(user)
                .bind(role)
                .fetch_one(&self.pool)
                .await?;
        Ok(count > 0)
    }

    // ─── Rule management ────────────────────────────────────────────────────

    pub async fn add_rule(&self, subject: &str, object: &str, action: &str) -> Result<()> {
        if subject.is_empty() || object.is_empty() || action.is_empty() {
            bail!("permission fields must be non-empty");
        }
        let result =
            sqlx::query("INSERT OR IGNORE INTO rules (subject, object, action) VALUES (?, ?, ?)")
                .bind(subject)
                .bind(object)
                .bind(action)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            bail!("permission already exists: {subject} {object} {action}");
        }
        Ok(())
    }

    pub async fn remove_rule(&self, subject: &str, object: &str, action: &str) -> Result<()> {
        let result =
            sqlx::query("DELETE FROM rules WHERE subject = ? AND object = ? AND action = ?")
                .bind(subject)
                .bind(object)
                .bind(action)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            bail!("permission not found: {subject} {object} {action}");
        }
        Ok(())
    }

    // ─── Grant management ───────────────────────────────────────────────────

    pub async fn grant(&self, user: &str, role: &str) -> Result<()> {
        if user.is_empty() || role.is_empty() {
            bail!("user and role must be non-empty");
        }
        // The prefix is reserved for rule subjects.
        if user.starts_with(ROLE_PREFIX) {
            bail!("user id may not start with the reserved prefix '{ROLE_PREFIX}'");
        }
        let result = sqlx::query("INSERT OR IGNORE INTO grants (user_id, role) VALUES (?, ?)")
            .bind(user)
            .bind(role)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            bail!("role already assigned: user {user} already has role {role}");
        }
        Ok(())
    }

    pub async fn revoke(&self, user: &str, role: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM grants WHERE user_id = ? AND role = ?")
            .bind(user)
            .bind(role)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            bail!("role not found: user {user} does not have role {role}");
        }
        Ok(())
    }

    // ─── Introspection ──────────────────────────────────────────────────────

    pub async fn roles_of(&self, user: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT role FROM grants WHERE user_id = ? ORDER BY role")
                .bind(user)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(r,)| r).collect())
    }

    /// Permissions granted to a role (rules whose subject is `role:<name>`).
    pub async fn rules_of_role(&self, role: &str) -> Result<Vec<Permission>> {
        let subject = format!("{ROLE_PREFIX}{role}");
        Ok(sqlx::query_as(
            "SELECT subject, object, action FROM rules
             WHERE subject = ? ORDER BY object, action",
        )
        .bind(&subject)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn all_users(&self) -> Result<Vec<UserInfo>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT user_id, role FROM grants ORDER BY user_id, role")
                .fetch_all(&self.pool)
                .await?;
        let mut users: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (user, role) in rows {
            users.entry(user).or_default().push(role);
        }
        Ok(users
            .into_iter()
            .map(|(id, roles)| UserInfo {
                username: id.clone(),
                id,
                roles,
            })
            .collect())
    }

    pub async fn all_roles(&self) -> Result<Vec<RoleInfo>> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            "SELECT subject, object, action FROM rules
             WHERE subject LIKE 'role:%' ORDER BY subject, object, action",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut roles: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (subject, object, action) in rows {
            let name = subject.trim_start_matches(ROLE_PREFIX).to_string();
            roles.entry(name).or_default().push(format!("{object}:{action}"));
        }
        Ok(roles
            .into_iter()
            .map(|(name, permissions)| RoleInfo {
                description: role_description_of(&name).to_string(),
                name,
                permissions,
            })
            .collect())
    }

    pub async fn stats(&self) -> Result<PolicyStats> {
        let (policies,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM rules")
            .fetch_one(&self.pool)
            .await?;
        let (groupings,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM grants")
            .fetch_one(&self.pool)
            .await?;
        let (roles,): (i64,) = sqlx::query_as(
            "SELECT COUNT(DISTINCT subject) FROM rules WHERE subject LIKE 'role:%'",
        )
        .fetch_one(&self.pool)
        .await?;
        let (users,): (i64,) = sqlx::query_as("SELECT COUNT(DISTINCT user_id) FROM grants")
            .fetch_one(&self.pool)
            .await?;
        Ok(PolicyStats {
            policies,
            groupings,
            roles,
            users,
        })
    }
}

//! Sandboxed filesystem access.
//!
//! Every operation validates its path against the sandbox policy before any
//! syscall: string-level `..` rejection, base-root containment, deny-list,
//! extension allow-list (files only), and a byte-size cap on reads, writes,
//! and copies.  Exactly one audit record is emitted per call, after the
//! operation completes and before the result is returned.
//!
//! The `..` check runs on the raw input, before normalization. It rejects
//! some legitimate names that merely contain the marker; that trade is
//! accepted so the gate holds independently of symlink resolution.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::logging::redact;

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("path traversal attempt detected")]
    Traversal,
    #[error("path outside allowed base paths")]
    OutsideBase,
    #[error("path explicitly denied")]
    Denied,
    #[error("file extension not allowed")]
    ExtensionNotAllowed,
    #[error("file exceeds maximum size limit")]
    TooLarge,
    #[error("{0}")]
    Io(String),
}

// ─── Audit ────────────────────────────────────────────────────────────────────

/// One audit record per filesystem or gadget operation.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub operation: String,
    /// Path, or `src -> dst` for copies, or gadget name for executions.
    pub target: String,
    pub user: String,
    pub success: bool,
    pub detail: String,
}

/// Pluggable audit destination. Stateless from the sandbox's view.
pub trait AuditSink: Send + Sync {
    fn record(&self, record: AuditRecord);
}

/// Default sink: audit records become structured log events, with credential
/// material masked out of the detail string.
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: AuditRecord) {
        let detail = redact(&record.detail);
        if record.success {
            info!(
                operation = %record.operation,
                target = %record.target,
                user = %record.user,
                detail = %detail,
                "audit"
            );
        } else {
            warn!(
                operation = %record.operation,
                target = %record.target,
                user = %record.user,
                detail = %detail,
                "audit"
            );
        }
    }
}

// ─── Policy ───────────────────────────────────────────────────────────────────

/// Immutable sandbox policy. Built once at startup.
pub struct SafeFsConfig {
    pub base_paths: Vec<PathBuf>,
    /// Zero means unbounded.
    pub max_file_size: u64,
    /// Lower-cased, dot-prefixed (e.g. `.txt`). Empty means any.
    pub allowed_exts: Vec<String>,
    pub denied_paths: Vec<PathBuf>,
}

/// A directory entry returned by `list`.
#[derive(Debug, Clone, Serialize)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
    pub mode: String,
    pub is_dir: bool,
    pub modified: Option<DateTime<Utc>>,
}

pub struct SafeFs {
    base_paths: Vec<PathBuf>,
    max_file_size: u64,
    allowed_exts: Vec<String>,
    denied_paths: Vec<PathBuf>,
    audit: Arc<dyn AuditSink>,
}

impl SafeFs {
    pub fn new(config: SafeFsConfig, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            base_paths: config.base_paths,
            max_file_size: config.max_file_size,
            allowed_exts: config
                .allowed_exts
                .into_iter()
                .map(|e| e.to_lowercase())
                .collect(),
            denied_paths: config.denied_paths,
            audit,
        }
    }

    // ─── Validation ─────────────────────────────────────────────────────────

    /// Validate a path against the sandbox policy and return its normalized
    /// absolute form.  `for_directory` skips the extension check.
    pub fn validate(&self, path: &str, for_directory: bool) -> Result<PathBuf, SandboxError> {
        if path.contains("..") {
            return Err(SandboxError::Traversal);
        }

        let abs = absolutize(Path::new(path));

        if !self.base_paths.iter().any(|base| abs.starts_with(base)) {
            return Err(SandboxError::OutsideBase);
        }

        if self.denied_paths.iter().any(|denied| abs.starts_with(denied)) {
            return Err(SandboxError::Denied);
        }

        if !for_directory && !self.allowed_exts.is_empty() {
            let ext = abs
                .extension()
                .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
                .unwrap_or_default();
            if !self.allowed_exts.contains(&ext) {
                return Err(SandboxError::ExtensionNotAllowed);
            }
        }

        Ok(abs)
    }

    // ─── Operations ─────────────────────────────────────────────────────────

    pub async fn read(&self, path: &str, user: &str) -> Result<Vec<u8>, SandboxError> {
        let abs = match self.validate(path, false) {
            Ok(p) => p,
            Err(e) => {
                warn!(path, user, reason = %e, "fs.read.denied");
                self.audit("read", path, user, false, e.to_string());
                return Err(e);
            }
        };

        let meta = match tokio::fs::metadata(&abs).await {
            Ok(m) => m,
            Err(e) => {
                self.audit("read", path, user, false, format!("stat failed: {e}"));
                return Err(SandboxError::Io(format!("failed to stat file: {e}")));
            }
        };
        if self.max_file_size > 0 && meta.len() > self.max_file_size {
            warn!(path, user, size = meta.len(), "fs.read.denied");
            self.audit("read", path, user, false, format!("file too big: {} bytes", meta.len()));
            return Err(SandboxError::TooLarge);
        }

        match tokio::fs::read(&abs).await {
            Ok(data) => {
                info!(path, user, size = data.len(), "fs.read.ok");
                self.audit("read", path, user, true, format!("read {} bytes", data.len()));
                Ok(data)
            }
            Err(e) => {
                self.audit("read", path, user, false, format!("read failed: {e}"));
                Err(SandboxError::Io(format!("failed to read file: {e}")))
            }
        }
    }

    pub async fn write(
        &self,
        path: &str,
        user: &str,
        data: &[u8],
        mode: u32,
    ) -> Result<(), SandboxError> {
        let abs = match self.validate(path, false) {
            Ok(p) => p,
            Err(e) => {
                warn!(path, user, reason = %e, "fs.write.denied");
                self.audit("write", path, user, false, e.to_string());
                return Err(e);
            }
        };

        // Size gate comes before any filesystem mutation.
        if self.max_file_size > 0 && data.len() as u64 > self.max_file_size {
            warn!(path, user, size = data.len(), "fs.write.denied");
            self.audit("write", path, user, false, format!("data too big: {} bytes", data.len()));
            return Err(SandboxError::TooLarge);
        }

        if let Some(parent) = abs.parent() {
            if let Err(e) = create_dirs_with_mode(parent).await {
                self.audit("write", path, user, false, format!("mkdir failed: {e}"));
                return Err(SandboxError::Io(format!("failed to create directory: {e}")));
            }
        }

        if let Err(e) = tokio::fs::write(&abs, data).await {
            self.audit("write", path, user, false, format!("write failed: {e}"));
            return Err(SandboxError::Io(format!("failed to write file: {e}")));
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = tokio::fs::set_permissions(&abs, std::fs::Permissions::from_mode(mode)).await;
        }
        #[cfg(not(unix))]
        let _ = mode;

        info!(path, user, size = data.len(), "fs.write.ok");
        self.audit("write", path, user, true, format!("wrote {} bytes", data.len()));
        Ok(())
    }

    pub async fn list(&self, path: &str, user: &str) -> Result<Vec<FileEntry>, SandboxError> {
        let abs = match self.validate(path, true) {
            Ok(p) => p,
            Err(e) => {
                warn!(path, user, reason = %e, "fs.list.denied");
                self.audit("list", path, user, false, e.to_string());
                return Err(e);
            }
        };

        let mut dir = match tokio::fs::read_dir(&abs).await {
            Ok(d) => d,
            Err(e) => {
                self.audit("list", path, user, false, format!("readdir failed: {e}"));
                return Err(SandboxError::Io(format!("failed to read directory: {e}")));
            }
        };

        let mut entries = Vec::new();
        while let Ok(Some(entry)) = dir.next_entry().await {
            // Entries that cannot be stat'd are skipped.
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            entries.push(FileEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                size: meta.len(),
                mode: format_mode(&meta),
                is_dir: meta.is_dir(),
                modified: meta.modified().ok().map(DateTime::<Utc>::from),
            });
        }

        info!(path, user, count = entries.len(), "fs.list.ok");
        self.audit("list", path, user, true, format!("listed {} entries", entries.len()));
        Ok(entries)
    }

    pub async fn copy(&self, src: &str, dst: &str, user: &str) -> Result<u64, SandboxError> {
        let pair = format!("{src} -> {dst}");

        let abs_src = match self.validate(src, false) {
            Ok(p) => p,
            Err(e) => {
                self.audit("copy", &pair, user, false, format!("src validation failed: {e}"));
                return Err(e);
            }
        };
        let abs_dst = match self.validate(dst, false) {
            Ok(p) => p,
            Err(e) => {
                self.audit("copy", &pair, user, false, format!("dst validation failed: {e}"));
                return Err(e);
            }
        };

        let meta = match tokio::fs::metadata(&abs_src).await {
            Ok(m) => m,
            Err(e) => {
                self.audit("copy", &pair, user, false, format!("stat src failed: {e}"));
                return Err(SandboxError::Io(format!("failed to stat source file: {e}")));
            }
        };
        if self.max_file_size > 0 && meta.len() > self.max_file_size {
            self.audit("copy", &pair, user, false, format!("src file too big: {} bytes", meta.len()));
            return Err(SandboxError::TooLarge);
        }

        if let Some(parent) = abs_dst.parent() {
            if let Err(e) = create_dirs_with_mode(parent).await {
                self.audit("copy", &pair, user, false, format!("mkdir dst failed: {e}"));
                return Err(SandboxError::Io(format!("failed to create destination directory: {e}")));
            }
        }

        match tokio::fs::copy(&abs_src, &abs_dst).await {
            Ok(written) => {
                self.audit("copy", &pair, user, true, format!("copied {written} bytes"));
                Ok(written)
            }
            Err(e) => {
                // Destination may be partially written; no rollback is attempted.
                self.audit("copy", &pair, user, false, format!("copy failed: {e}"));
                Err(SandboxError::Io(format!("failed to copy file contents: {e}")))
            }
        }
    }

    fn audit(&self, operation: &str, target: &str, user: &str, success: bool, detail: String) {
        self.audit.record(AuditRecord {
            operation: operation.to_string(),
            target: target.to_string(),
            user: user.to_string(),
            success,
            detail,
        });
    }
}

// ─── Path helpers ─────────────────────────────────────────────────────────────

/// Fold `.` components and make the path absolute against the current
/// directory, without touching the filesystem.  `..` never reaches this
/// function; `validate` rejects it beforehand.
fn absolutize(path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")).join(path)
    };
    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

async fn create_dirs_with_mode(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        let mut builder = std::fs::DirBuilder::new();
        builder.recursive(true).mode(0o755);
        let dir = dir.to_path_buf();
        tokio::task::spawn_blocking(move || builder.create(&dir))
            .await
            .map_err(|e| std::io::Error::other(e))?
    }
    #[cfg(not(unix))]
    {
        tokio::fs::create_dir_all(dir).await
    }
}

fn format_mode(meta: &std::fs::Metadata) -> String {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        format!("{:o}", meta.permissions().mode() & 0o7777)
    }
    #[cfg(not(unix))]
    {
        if meta.permissions().readonly() {
            "r".to_string()
        } else {
            "rw".to_string()
        }
    }
}

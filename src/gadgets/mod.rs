//! Gadget runner — supervised execution of out-of-process gadgets.
//!
//! Gadgets are opaque executables invoked by name through a shared launcher
//! binary (`<binary> run <gadget> [args...]`).  The runner owns the security
//! gates in front of the spawn: name validation and the system-gadget
//! classification.  Execution is bounded by a wall-clock timeout; stdout and
//! stderr are captured into one combined buffer.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::process::Command;
use tracing::{info, warn};

use crate::safefs::{AuditRecord, AuditSink};

/// Wall-clock budget for a single gadget execution.
pub const EXEC_TIMEOUT: Duration = Duration::from_secs(30);

/// Gadgets that additionally require the `(system, manage)` permission.
const SYSTEM_GADGETS: &[&str] = &["sysinfo", "network-scanner", "process", "hardware"];

/// A gadget name is 1–50 characters from `[A-Za-z0-9_-]`.
pub fn is_valid_gadget_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 50
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// True for the fixed set of system-classified gadget names.
pub fn is_system_gadget(name: &str) -> bool {
    SYSTEM_GADGETS.iter().any(|s| s.eq_ignore_ascii_case(name))
}

#[derive(Debug, thiserror::Error)]
pub enum GadgetError {
    #[error("invalid gadget name")]
    InvalidName,
    #[error("failed to run gadget launcher: {0}")]
    Launcher(String),
}

/// Outcome of one gadget execution.
#[derive(Debug, Clone, Serialize)]
pub struct GadgetExecution {
    pub success: bool,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub exit_code: i32,
    pub gadget_name: String,
}

/// Catalog entry parsed from the launcher's `list` / `info` output.
#[derive(Debug, Clone, Serialize)]
pub struct GadgetInfo {
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

pub struct GadgetRunner {
    binary: PathBuf,
    audit: Arc<dyn AuditSink>,
    exec_counter: AtomicU64,
}

impl GadgetRunner {
    pub fn new(binary: PathBuf, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            binary,
            audit,
            exec_counter: AtomicU64::new(1),
        }
    }

    /// Run a gadget with a bounded timeout and capture its combined output.
    ///
    /// The only hard error is an invalid name, raised before any process is
    /// spawned; launcher and gadget failures come back as an unsuccessful
    /// [`GadgetExecution`].
    pub async fn execute(
        &self,
        name: &str,
        args: &[String],
        user: &str,
        request_id: &str,
    ) -> Result<GadgetExecution, GadgetError> {
        if !is_valid_gadget_name(name) {
            return Err(GadgetError::InvalidName);
        }

        let exec_id = format!("{name}-{}", self.exec_counter.fetch_add(1, Ordering::Relaxed));
        let start = Instant::now();
        info!(
            request_id,
            exec_id,
            gadget_name = name,
            args_count = args.len(),
            user,
            "gadget.exec.start"
        );

        let result = self.run_launcher(name, args).await;

        let duration_ms = start.elapsed().as_millis() as u64;
        if result.success {
            info!(
                request_id,
                exec_id,
                gadget_name = name,
                exit_code = result.exit_code,
                duration_ms,
                "gadget.exec.finish"
            );
        } else {
            warn!(
                request_id,
                exec_id,
                gadget_name = name,
                exit_code = result.exit_code,
                duration_ms,
                error = result.error.as_deref().unwrap_or(""),
                "gadget.exec.finish"
            );
        }
        self.audit.record(AuditRecord {
            operation: "execute".to_string(),
            target: name.to_string(),
            user: user.to_string(),
            success: result.success,
            detail: format!("exit code {} in {duration_ms}ms", result.exit_code),
        });

        Ok(result)
    }

    async fn run_launcher(&self, name: &str, args: &[String]) -> GadgetExecution {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("run")
            .arg(name)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(EXEC_TIMEOUT, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return GadgetExecution {
                    success: false,
                    output: String::new(),
                    error: Some(e.to_string()),
                    exit_code: -1,
                    gadget_name: name.to_string(),
                };
            }
            // Timeout: dropping the future kills the child (kill_on_drop).
            Err(_) => {
                return GadgetExecution {
                    success: false,
                    output: String::new(),
                    error: Some(format!(
                        "execution timed out after {}s",
                        EXEC_TIMEOUT.as_secs()
                    )),
                    exit_code: -1,
                    gadget_name: name.to_string(),
                };
            }
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        let exit_code = output.status.code().unwrap_or(-1);
        if output.status.success() {
            GadgetExecution {
                success: true,
                output: combined,
                error: None,
                exit_code,
                gadget_name: name.to_string(),
            }
        } else {
            GadgetExecution {
                success: false,
                output: combined,
                error: Some(format!("gadget exited with status {exit_code}")),
                exit_code,
                gadget_name: name.to_string(),
            }
        }
    }

    /// List available gadgets via `<binary> list`.
    ///
    /// The parser is deliberately permissive; the launcher's output format is
    /// advisory and never feeds authorization decisions.
    pub async fn list(&self) -> Result<Vec<GadgetInfo>, GadgetError> {
        let output = self.launcher_output(&["list"]).await?;
        Ok(parse_gadget_list(&output))
    }

    /// Fetch one gadget's description via `<binary> info <name>`.
    pub async fn info(&self, name: &str) -> Result<GadgetInfo, GadgetError> {
        if !is_valid_gadget_name(name) {
            return Err(GadgetError::InvalidName);
        }
        let output = self.launcher_output(&["info", name]).await?;
        Ok(GadgetInfo {
            name: name.to_string(),
            description: output.trim().to_string(),
            category: Some("general".to_string()),
            version: Some("1.0.0".to_string()),
        })
    }

    /// Liveness probe: the launcher responds to `list`.
    pub async fn health_check(&self) -> Result<(), GadgetError> {
        self.launcher_output(&["list"]).await.map(|_| ())
    }

    async fn launcher_output(&self, args: &[&str]) -> Result<String, GadgetError> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::time::timeout(EXEC_TIMEOUT, cmd.output())
            .await
            .map_err(|_| GadgetError::Launcher("launcher timed out".to_string()))?
            .map_err(|e| GadgetError::Launcher(e.to_string()))?;
        if !output.status.success() {
            return Err(GadgetError::Launcher(format!(
                "launcher exited with status {}",
                output.status.code().unwrap_or(-1)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Parse `list` output: one gadget per line, first token is the name, the
/// rest is a description.  Banner and non-name lines are skipped.
fn parse_gadget_list(output: &str) -> Vec<GadgetInfo> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let mut parts = line.split_whitespace();
            let name = parts.next()?;
            if !is_valid_gadget_name(name) {
                return None;
            }
            Some(GadgetInfo {
                name: name.to_string(),
                description: parts.collect::<Vec<_>>().join(" "),
                category: None,
                version: None,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safefs::TracingAuditSink;

    #[test]
    fn name_gate_boundaries() {
        assert!(is_valid_gadget_name("a"));
        assert!(is_valid_gadget_name(&"x".repeat(50)));
        assert!(is_valid_gadget_name("net-scan_2"));
        assert!(!is_valid_gadget_name(""));
        assert!(!is_valid_gadget_name(&"x".repeat(51)));
        assert!(!is_valid_gadget_name("rm -rf"));
        assert!(!is_valid_gadget_name("a/b"));
        assert!(!is_valid_gadget_name("a;b"));
    }

    #[test]
    fn system_classification_is_case_insensitive() {
        assert!(is_system_gadget("sysinfo"));
        assert!(is_system_gadget("SysInfo"));
        assert!(is_system_gadget("network-scanner"));
        assert!(!is_system_gadget("echo"));
    }

    #[test]
    fn list_parser_skips_banner_lines() {
        let output = "Gadget Launcher v2\n\necho      prints its arguments\nsysinfo   host summary\n* not a gadget\n";
        let gadgets = parse_gadget_list(output);
        let names: Vec<_> = gadgets.iter().map(|g| g.name.as_str()).collect();
        assert!(names.contains(&"echo"));
        assert!(names.contains(&"sysinfo"));
        assert!(!names.contains(&"*"));
        let echo = gadgets.iter().find(|g| g.name == "echo").unwrap();
        assert_eq!(echo.description, "prints its arguments");
    }

    #[tokio::test]
    async fn invalid_name_never_spawns() {
        let runner = GadgetRunner::new(
            PathBuf::from("/nonexistent/launcher"),
            Arc::new(TracingAuditSink),
        );
        let err = runner
            .execute("bad name", &[], "tester", "req-1")
            .await
            .unwrap_err();
        assert!(matches!(err, GadgetError::InvalidName));
    }

    #[tokio::test]
    async fn missing_launcher_reports_failure_not_error() {
        let runner = GadgetRunner::new(
            PathBuf::from("/nonexistent/launcher"),
            Arc::new(TracingAuditSink),
        );
        let result = runner.execute("echo", &[], "tester", "req-1").await.unwrap();
        assert!(!result.success);
        assert_eq!(result.exit_code, -1);
        assert!(result.error.is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_combined_output_and_exit_code() {
        // /bin/sh as the launcher: `sh -c ...` won't match, so fake a launcher
        // script that echoes and exits.
        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("launcher.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\n# $1=run $2=gadget\nshift 2\necho out:$@\necho err:$@ >&2\nexit 3\n",
        )
        .unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let runner = GadgetRunner::new(script, Arc::new(TracingAuditSink));
        let result = runner
            .execute("echo", &["hi".to_string()], "tester", "req-1")
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.exit_code, 3);
        assert!(result.output.contains("out:hi"));
        assert!(result.output.contains("err:hi"));
    }
}

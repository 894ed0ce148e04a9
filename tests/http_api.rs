//! End-to-end tests over the real HTTP server.
//!
//! Each test builds a full `AppContext` on a random port with a temp policy
//! store, a sandboxed temp directory, and a stub gadget launcher script,
//! then speaks plain HTTP over a TcpStream.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use gadgetd::config::{ServerConfig, UserTable};
use gadgetd::mcp::protocol::{Frame, PROTOCOL_VERSION};
use gadgetd::mcp::transport::{in_memory_pair, InMemoryTransport, Transport};
use gadgetd::AppContext;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const TEST_SECRET: &str = "test-secret";

/// Find a free local port by binding to port 0.
fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Write a stub gadget launcher that answers `list`, `info`, and `run`.
#[cfg(unix)]
fn write_stub_launcher(dir: &TempDir) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.path().join("launcher.sh");
    std::fs::write(
        &path,
        concat!(
            "#!/bin/sh\n",
            "cmd=\"$1\"\n",
            "case \"$cmd\" in\n",
            "  list) echo \"echo     prints its arguments\"; echo \"sysinfo  host summary\" ;;\n",
            "  info) echo \"information about $2\" ;;\n",
            "  run) shift; name=\"$1\"; shift; echo \"$name: $@\" ;;\n",
            "  *) exit 1 ;;\n",
            "esac\n",
            "exit 0\n",
        ),
    )
    .unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

async fn start_server(dir: &TempDir) -> (Arc<AppContext>, u16) {
    #[cfg(unix)]
    let gadget_binary = write_stub_launcher(dir);
    #[cfg(not(unix))]
    let gadget_binary = PathBuf::from("gadget-launcher-stub");

    let config = ServerConfig {
        port: 0,
        gadget_binary,
        policy_db: dir.path().join("policy.db"),
        token_secret: TEST_SECRET.to_string(),
        allowed_roots: vec![dir.path().to_path_buf(), PathBuf::from("/tmp")],
        max_file_size: 1024 * 1024,
        peers_file: None,
        users: UserTable::default_users(),
    };

    let ctx = AppContext::build(config).await.unwrap();
    let port = find_free_port();
    let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
    let serve_ctx = ctx.clone();
    tokio::spawn(async move {
        let _ = gadgetd::rest::serve(serve_ctx, addr).await;
    });
    tokio::time::sleep(Duration::from_millis(150)).await;
    (ctx, port)
}

/// Minimal HTTP client: returns (status, headers, body).
async fn request(
    port: u16,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: Option<&str>,
) -> (u16, HashMap<String, String>, String) {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{port}")).await.unwrap();

    let mut req = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n");
    for (name, value) in headers {
        req.push_str(&format!("{name}: {value}\r\n"));
    }
    if let Some(body) = body {
        req.push_str(&format!(
            "Content-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        ));
    } else {
        req.push_str("\r\n");
    }
    stream.write_all(req.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let response = String::from_utf8_lossy(&raw).into_owned();

    let status: u16 = response
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("no status line");
    let header_end = response.find("\r\n\r\n").expect("no header terminator");
    let mut headers_out = HashMap::new();
    for line in response[..header_end].lines().skip(1) {
        if let Some((name, value)) = line.split_once(':') {
            headers_out.insert(name.trim().to_lowercase(), value.trim().to_string());
        }
    }
    (status, headers_out, response[header_end + 4..].to_string())
}

async fn login(port: u16, username: &str, password: &str) -> String {
    let body = json!({ "username": username, "password": password }).to_string();
    let (status, _, body) = request(port, "POST", "/api/auth/login", &[], Some(&body)).await;
    assert_eq!(status, 200, "login as {username} failed: {body}");
    let json: Value = serde_json::from_str(&body).unwrap();
    json["token"].as_str().unwrap().to_string()
}

fn bearer(token: &str) -> (&'static str, String) {
    ("Authorization", format!("Bearer {token}"))
}

// ─── Scenario 1: login, then read a file ─────────────────────────────────────

#[tokio::test]
#[cfg(unix)]
async fn login_then_list_and_extension_denial() {
    let dir = TempDir::new().unwrap();
    let (_ctx, port) = start_server(&dir).await;

    let token = login(port, "user", "user123").await;
    let auth = bearer(&token);

    let path = format!("/api/fs/list?path={}", dir.path().display());
    let (status, _, body) = request(port, "GET", &path, &[(auth.0, &auth.1)], None).await;
    assert_eq!(status, 200, "{body}");
    let json: Value = serde_json::from_str(&body).unwrap();
    assert!(json["count"].as_u64().unwrap() < u64::MAX);

    let path = format!("/api/fs/read?path={}/notallowed.exe", dir.path().display());
    let (status, _, body) = request(port, "GET", &path, &[(auth.0, &auth.1)], None).await;
    assert_eq!(status, 400);
    assert!(body.contains("extension not allowed"), "{body}");
}

// ─── Scenario 2: role gate ───────────────────────────────────────────────────

#[tokio::test]
#[cfg(unix)]
async fn admin_routes_reject_plain_users() {
    let dir = TempDir::new().unwrap();
    let (_ctx, port) = start_server(&dir).await;
    let grant = json!({ "username": "newbie", "role": "readonly" }).to_string();

    let token = login(port, "user", "user123").await;
    let auth = bearer(&token);
    let (status, _, body) =
        request(port, "POST", "/api/rbac/users", &[(auth.0, &auth.1)], Some(&grant)).await;
    assert_eq!(status, 403, "{body}");

    let token = login(port, "admin", "admin123").await;
    let auth = bearer(&token);
    let (status, _, body) =
        request(port, "POST", "/api/rbac/users", &[(auth.0, &auth.1)], Some(&grant)).await;
    assert_eq!(status, 200, "{body}");
}

// ─── Scenario 3: path traversal ──────────────────────────────────────────────

#[tokio::test]
#[cfg(unix)]
async fn traversal_rejected_at_the_string_level() {
    let dir = TempDir::new().unwrap();
    let (_ctx, port) = start_server(&dir).await;

    let token = login(port, "admin", "admin123").await;
    let auth = bearer(&token);

    let (status, _, body) = request(
        port,
        "GET",
        "/api/fs/read?path=/tmp/../etc/passwd",
        &[(auth.0, &auth.1)],
        None,
    )
    .await;
    assert_eq!(status, 400);
    assert!(body.contains("traversal"), "{body}");
}

// ─── Scenario 4: gadget lifecycle ────────────────────────────────────────────

#[tokio::test]
#[cfg(unix)]
async fn gadget_execution_and_system_classification() {
    let dir = TempDir::new().unwrap();
    let (_ctx, port) = start_server(&dir).await;

    let user_token = login(port, "user", "user123").await;
    let auth = bearer(&user_token);

    let exec = json!({ "gadget_name": "echo", "args": ["hi"] }).to_string();
    let (status, _, body) = request(
        port,
        "POST",
        "/api/gadgets/echo/execute",
        &[(auth.0, &auth.1)],
        Some(&exec),
    )
    .await;
    assert_eq!(status, 200, "{body}");
    let json: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["success"], true);
    assert_eq!(json["exit_code"], 0);
    assert!(json["output"].as_str().unwrap().contains("hi"));

    // System gadget as plain user: denied before any spawn.
    let sys = json!({ "gadget_name": "sysinfo", "args": [] }).to_string();
    let (status, _, body) = request(
        port,
        "POST",
        "/api/gadgets/sysinfo/execute",
        &[(auth.0, &auth.1)],
        Some(&sys),
    )
    .await;
    assert_eq!(status, 403, "{body}");

    // Admin carries (system, manage) through the admin role.
    let admin_token = login(port, "admin", "admin123").await;
    let auth = bearer(&admin_token);
    let (status, _, body) = request(
        port,
        "POST",
        "/api/gadgets/sysinfo/execute",
        &[(auth.0, &auth.1)],
        Some(&sys),
    )
    .await;
    assert_eq!(status, 200, "{body}");
}

#[tokio::test]
#[cfg(unix)]
async fn invalid_gadget_names_rejected() {
    let dir = TempDir::new().unwrap();
    let (_ctx, port) = start_server(&dir).await;
    let token = login(port, "user", "user123").await;
    let auth = bearer(&token);

    let exec = json!({ "args": [] }).to_string();
    let long_name = "x".repeat(51);
    let (status, _, _) = request(
        port,
        "POST",
        &format!("/api/gadgets/{long_name}/execute"),
        &[(auth.0, &auth.1)],
        Some(&exec),
    )
    .await;
    assert_eq!(status, 400);
}

// ─── Scenario 5: peer tool call over HTTP ────────────────────────────────────

/// A minimal in-process MCP peer: initialize plus an `echo` tool that
/// returns its arguments as text.
async fn run_echo_peer(far: InMemoryTransport) {
    loop {
        let frame = match far.receive().await {
            Ok(frame) => frame,
            Err(_) => break,
        };
        let Some(method) = frame.method.clone() else { continue };
        let id = frame.id.clone().unwrap_or(Value::Null);
        let reply = match method.as_str() {
            "initialize" => Frame::response(
                id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": "echo-peer", "version": "1.0.0" },
                }),
            ),
            "tools/list" => Frame::response(
                id,
                json!({ "tools": [{ "name": "echo", "inputSchema": { "type": "object" } }] }),
            ),
            "tools/call" => {
                let arguments = frame
                    .params
                    .as_ref()
                    .and_then(|p| p.get("arguments"))
                    .cloned()
                    .unwrap_or(Value::Null);
                Frame::response(
                    id,
                    json!({ "content": [{ "type": "text", "text": arguments.to_string() }] }),
                )
            }
            // Notifications need no reply.
            _ if frame.id.is_none() => continue,
            _ => Frame::error_response(id, -32601, "method not found", None),
        };
        if far.send(&reply).await.is_err() {
            break;
        }
    }
}

#[tokio::test]
#[cfg(unix)]
async fn peer_tool_call_round_trips_through_the_api() {
    let dir = TempDir::new().unwrap();
    let (ctx, port) = start_server(&dir).await;

    let (near, far) = in_memory_pair();
    tokio::spawn(run_echo_peer(far));
    ctx.peers.connect_with("echo-peer", Box::new(near)).await.unwrap();

    let token = login(port, "user", "user123").await;
    let auth = bearer(&token);

    let args = json!({ "x": 1 }).to_string();
    let (status, _, body) = request(
        port,
        "POST",
        "/api/mcp/tools/echo-peer/echo",
        &[(auth.0, &auth.1)],
        Some(&args),
    )
    .await;
    assert_eq!(status, 200, "{body}");
    let json: Value = serde_json::from_str(&body).unwrap();
    let text = json["content"][0]["text"].as_str().unwrap();
    assert!(text.contains("\"x\":1"), "{text}");

    // The servers listing reflects the connected peer.
    let (status, _, body) =
        request(port, "GET", "/api/mcp/servers", &[(auth.0, &auth.1)], None).await;
    assert_eq!(status, 200);
    let json: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["status"]["echo-peer"]["connected"], true);

    // readonly lacks (ai, access).
    let ro_token = login(port, "readonly", "readonly123").await;
    let auth = bearer(&ro_token);
    let (status, _, _) =
        request(port, "GET", "/api/mcp/servers", &[(auth.0, &auth.1)], None).await;
    assert_eq!(status, 403);
}

// ─── Universal invariants ────────────────────────────────────────────────────

#[tokio::test]
#[cfg(unix)]
async fn request_id_is_echoed_or_synthesized() {
    let dir = TempDir::new().unwrap();
    let (_ctx, port) = start_server(&dir).await;

    let (_, headers, _) = request(
        port,
        "GET",
        "/health",
        &[("X-Request-ID", "corr-1234")],
        None,
    )
    .await;
    assert_eq!(headers.get("x-request-id").map(String::as_str), Some("corr-1234"));

    let (_, headers, _) = request(port, "GET", "/health", &[], None).await;
    let generated = headers.get("x-request-id").expect("missing request id");
    assert!(!generated.is_empty());
}

#[tokio::test]
#[cfg(unix)]
async fn expired_and_missing_tokens_are_unauthorized() {
    let dir = TempDir::new().unwrap();
    let (_ctx, port) = start_server(&dir).await;

    let (status, _, _) = request(port, "GET", "/api/rbac/me", &[], None).await;
    assert_eq!(status, 401);

    // A token signed with the server's secret but already expired.
    let expired = gadgetd::auth::TokenManager::new(
        TEST_SECRET,
        Duration::from_secs(0),
        gadgetd::auth::DEFAULT_ISSUER,
    )
    .mint("user", "user", vec!["user".to_string()])
    .unwrap();
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let auth = bearer(&expired);
    let (status, _, body) =
        request(port, "GET", "/api/rbac/me", &[(auth.0, &auth.1)], None).await;
    assert_eq!(status, 401);
    assert!(body.contains("expired"), "{body}");

    // The query-parameter fallback also authenticates.
    let token = login(port, "user", "user123").await;
    let (status, _, _) =
        request(port, "GET", &format!("/api/rbac/me?token={token}"), &[], None).await;
    assert_eq!(status, 200);
}

#[tokio::test]
#[cfg(unix)]
async fn refresh_returns_a_working_token() {
    let dir = TempDir::new().unwrap();
    let (_ctx, port) = start_server(&dir).await;

    let token = login(port, "user", "user123").await;
    let auth = bearer(&token);
    let (status, _, body) =
        request(port, "POST", "/api/auth/refresh", &[(auth.0, &auth.1)], Some("{}")).await;
    assert_eq!(status, 200, "{body}");
    let json: Value = serde_json::from_str(&body).unwrap();
    let fresh = json["token"].as_str().unwrap();
    assert_eq!(json["username"], "user");

    let auth = bearer(fresh);
    let (status, _, _) = request(port, "GET", "/api/rbac/me", &[(auth.0, &auth.1)], None).await;
    assert_eq!(status, 200);
}

#[tokio::test]
#[cfg(unix)]
async fn health_reports_all_components() {
    let dir = TempDir::new().unwrap();
    let (_ctx, port) = start_server(&dir).await;

    let (status, _, body) = request(port, "GET", "/health", &[], None).await;
    assert_eq!(status, 200);
    let json: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["server"], "healthy");
    assert_eq!(json["gadget_framework"], "healthy");
    assert_eq!(json["rbac"]["status"], "healthy");
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
    assert!(json["timestamp"].is_string());
}

#[tokio::test]
#[cfg(unix)]
async fn write_requires_the_write_permission() {
    let dir = TempDir::new().unwrap();
    let (_ctx, port) = start_server(&dir).await;

    let body = json!({
        "path": format!("{}/note.txt", dir.path().display()),
        "content": "hello",
    })
    .to_string();

    // The built-in `user` role has filesystem:read only.
    let token = login(port, "user", "user123").await;
    let auth = bearer(&token);
    let (status, _, response) =
        request(port, "POST", "/api/fs/write", &[(auth.0, &auth.1)], Some(&body)).await;
    assert_eq!(status, 403, "{response}");

    let token = login(port, "admin", "admin123").await;
    let auth = bearer(&token);
    let (status, _, response) =
        request(port, "POST", "/api/fs/write", &[(auth.0, &auth.1)], Some(&body)).await;
    assert_eq!(status, 200, "{response}");
}

//! Peer client behavior over the in-process transport: correlation,
//! timeouts, teardown, and notification dispatch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use gadgetd::mcp::client::{PeerClient, PeerClientConfig, PeerError};
use gadgetd::mcp::protocol::{Frame, PROTOCOL_VERSION};
use gadgetd::mcp::transport::{in_memory_pair, InMemoryTransport, Transport};
use serde_json::{json, Value};
use tokio::sync::mpsc;

fn init_response(id: Value) -> Frame {
    Frame::response(
        id,
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": {} },
            "serverInfo": { "name": "test-peer", "version": "0.1.0" },
        }),
    )
}

/// Answer the initialize handshake on the far half, then hand the transport
/// back for scripted behavior.
async fn handshake(far: &InMemoryTransport) {
    loop {
        let frame = far.receive().await.expect("peer receive");
        match frame.method.as_deref() {
            Some("initialize") => {
                let id = frame.id.clone().unwrap();
                far.send(&init_response(id)).await.unwrap();
            }
            Some("notifications/initialized") => return,
            _ => panic!("unexpected frame during handshake: {frame:?}"),
        }
    }
}

async fn connected_client(
    far: &InMemoryTransport,
    near: InMemoryTransport,
    timeout: Duration,
) -> Arc<PeerClient> {
    let client = PeerClient::new(
        PeerClientConfig::new("test-client").with_timeout(timeout),
        Arc::new(near),
    );
    let connect = {
        let client = client.clone();
        tokio::spawn(async move { client.connect().await })
    };
    handshake(far).await;
    connect.await.unwrap().expect("connect failed");
    assert!(client.is_ready());
    client
}

#[tokio::test]
async fn handshake_stores_server_identity() {
    let (near, far) = in_memory_pair();
    let client = connected_client(&far, near, Duration::from_secs(5)).await;

    let info = client.server_info().expect("server info");
    assert_eq!(info.name, "test-peer");
    assert!(client.server_capabilities().is_some());
    client.close().await;
    assert!(!client.is_ready());
}

#[tokio::test]
async fn version_mismatch_fails_initialize() {
    let (near, far) = in_memory_pair();
    let client = PeerClient::new(PeerClientConfig::new("test-client"), Arc::new(near));

    let connect = {
        let client = client.clone();
        tokio::spawn(async move { client.connect().await })
    };
    let frame = far.receive().await.unwrap();
    assert_eq!(frame.method.as_deref(), Some("initialize"));
    far.send(&Frame::response(
        frame.id.unwrap(),
        json!({
            "protocolVersion": "1999-01-01",
            "capabilities": {},
            "serverInfo": { "name": "old-peer", "version": "0.0.1" },
        }),
    ))
    .await
    .unwrap();

    let result = connect.await.unwrap();
    assert!(matches!(result, Err(PeerError::VersionMismatch { .. })));
    assert!(!client.is_ready());
}

#[tokio::test]
async fn responses_match_requests_regardless_of_order() {
    let (near, far) = in_memory_pair();
    let client = connected_client(&far, near, Duration::from_secs(5)).await;

    // Collect two tool calls, then answer them in reverse order.
    let responder = tokio::spawn(async move {
        let mut pending = Vec::new();
        while pending.len() < 2 {
            let frame = far.receive().await.unwrap();
            if frame.method.as_deref() == Some("tools/call") {
                pending.push(frame);
            }
        }
        pending.reverse();
        for frame in pending {
            let name = frame.params.as_ref().unwrap()["name"].as_str().unwrap().to_string();
            far.send(&Frame::response(
                frame.id.unwrap(),
                json!({ "content": [{ "type": "text", "text": name }] }),
            ))
            .await
            .unwrap();
        }
        far
    });

    let (first, second) = tokio::join!(
        client.call_tool("alpha", json!({})),
        client.call_tool("beta", json!({})),
    );
    assert_eq!(first.unwrap().content[0].text.as_deref(), Some("alpha"));
    assert_eq!(second.unwrap().content[0].text.as_deref(), Some("beta"));
    assert_eq!(client.pending_requests().await, 0);
    drop(responder);
}

#[tokio::test]
async fn request_timeout_cleans_the_pending_table() {
    let (near, far) = in_memory_pair();
    let client = connected_client(&far, near, Duration::from_millis(200)).await;

    // The peer never answers tools/call.
    let result = client.call_tool("slow", json!({})).await;
    assert!(matches!(result, Err(PeerError::Timeout)));
    assert_eq!(client.pending_requests().await, 0);

    // The session stays ready after a timeout.
    assert!(client.is_ready());
}

#[tokio::test]
async fn close_releases_in_flight_waiters() {
    let (near, far) = in_memory_pair();
    let client = connected_client(&far, near, Duration::from_secs(30)).await;

    let call = {
        let client = client.clone();
        tokio::spawn(async move { client.call_tool("never", json!({})).await })
    };
    // Let the request reach the pending table, then tear the session down.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.pending_requests().await, 1);
    client.close().await;

    let result = tokio::time::timeout(Duration::from_secs(2), call)
        .await
        .expect("waiter was not released")
        .unwrap();
    assert!(result.is_err());
    assert_eq!(client.pending_requests().await, 0);
    assert!(!client.is_ready());
}

#[tokio::test]
async fn peer_death_is_observed_and_calls_fail() {
    let (near, far) = in_memory_pair();
    let client = connected_client(&far, near, Duration::from_millis(300)).await;

    // Simulate the peer dying: its transport closes, dropping the queues.
    far.close().await;
    drop(far);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let result = client.call_tool("echo", json!({})).await;
    assert!(result.is_err());
    assert_eq!(client.pending_requests().await, 0);
}

#[tokio::test]
async fn inbound_requests_are_refused_with_method_not_found() {
    let (near, far) = in_memory_pair();
    let client = connected_client(&far, near, Duration::from_secs(5)).await;

    far.send(&Frame::request(99, "sampling/createMessage", None))
        .await
        .unwrap();
    let reply = far.receive().await.unwrap();
    assert_eq!(reply.id, Some(json!(99)));
    let error = reply.error.expect("expected error response");
    assert_eq!(error.code, -32601);
    client.close().await;
}

#[tokio::test]
async fn list_changed_notification_triggers_refetch() {
    let (near, far) = in_memory_pair();
    let client = connected_client(&far, near, Duration::from_secs(5)).await;

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    client.on_tools_changed(move |tools| {
        let names: Vec<String> = tools.into_iter().map(|t| t.name).collect();
        let _ = seen_tx.send(names);
    });

    // Notify, then serve the re-fetch.
    far.send(&Frame::notification("notifications/tools/list_changed", None))
        .await
        .unwrap();
    let refetch = far.receive().await.unwrap();
    assert_eq!(refetch.method.as_deref(), Some("tools/list"));
    far.send(&Frame::response(
        refetch.id.unwrap(),
        json!({ "tools": [{ "name": "fresh-tool", "inputSchema": {} }] }),
    ))
    .await
    .unwrap();

    let names = tokio::time::timeout(Duration::from_secs(2), seen_rx.recv())
        .await
        .expect("handler not invoked")
        .unwrap();
    assert_eq!(names, vec!["fresh-tool".to_string()]);
    client.close().await;
}

#[tokio::test]
async fn resource_and_prompt_operations_parse_typed_results() {
    let (near, far) = in_memory_pair();
    let client = connected_client(&far, near, Duration::from_secs(5)).await;

    let peer = tokio::spawn(async move {
        loop {
            let frame = match far.receive().await {
                Ok(frame) => frame,
                Err(_) => break,
            };
            let Some(id) = frame.id.clone() else { continue };
            let reply = match frame.method.as_deref() {
                Some("resources/list") => Frame::response(
                    id,
                    json!({ "resources": [{ "uri": "file:///tmp/a.txt", "name": "a.txt" }] }),
                ),
                Some("resources/read") => Frame::response(
                    id,
                    json!({ "contents": [{ "uri": "file:///tmp/a.txt", "text": "hello" }] }),
                ),
                Some("prompts/list") => Frame::response(
                    id,
                    json!({ "prompts": [{ "name": "summarize" }] }),
                ),
                Some("prompts/get") => Frame::response(
                    id,
                    json!({ "description": "summarize a file", "messages": [] }),
                ),
                _ => Frame::error_response(id, -32601, "method not found", None),
            };
            if far.send(&reply).await.is_err() {
                break;
            }
        }
    });

    let resources = client.list_resources().await.unwrap();
    assert_eq!(resources.resources[0].uri, "file:///tmp/a.txt");

    let contents = client.read_resource("file:///tmp/a.txt").await.unwrap();
    assert_eq!(contents.contents[0].text.as_deref(), Some("hello"));

    let prompts = client.list_prompts().await.unwrap();
    assert_eq!(prompts.prompts[0].name, "summarize");

    let prompt = client.get_prompt("summarize", None).await.unwrap();
    assert_eq!(prompt.description.as_deref(), Some("summarize a file"));

    client.close().await;
    let _ = peer.await;
}

// ─── Stdio close semantics ───────────────────────────────────────────────────

#[cfg(unix)]
#[tokio::test]
async fn stdio_close_kills_a_child_that_ignores_eof_and_term() {
    use gadgetd::mcp::transport::StdioTransport;

    // Ignores both EOF and SIGTERM; only SIGKILL ends it.
    let transport = StdioTransport::spawn(
        "sh",
        &["-c".to_string(), "trap '' TERM; while true; do sleep 1; done".to_string()],
        &HashMap::new(),
    )
    .expect("spawn stubborn child");

    let started = std::time::Instant::now();
    transport.close().await;
    let elapsed = started.elapsed();

    assert!(!transport.is_connected());
    // EOF wait (5s) + grace (2s), then the kill; allow slack for CI.
    assert!(elapsed >= Duration::from_secs(7), "closed too fast: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(10), "closed too slow: {elapsed:?}");
}

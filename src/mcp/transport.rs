//! Peer transports.
//!
//! Three variants share one contract: newline-delimited JSON frames over a
//! child process's stdio, over a stream socket (unix or tcp), or over a pair
//! of in-process queues (tests).  Sends are serialized by an internal writer
//! lock; each transport has a single logical reader.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, warn};

use super::protocol::Frame;

/// Socket dial budget.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// How long a closing stdio transport waits for the child after EOF.
pub const CLOSE_WAIT: Duration = Duration::from_secs(5);
/// Additional grace between the terminate signal and the hard kill.
pub const CLOSE_GRACE: Duration = Duration::from_secs(2);
/// In-process queue capacity.
pub const QUEUE_CAPACITY: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport not connected")]
    NotConnected,
    #[error("transport closed: {0}")]
    Closed(String),
    #[error("outgoing queue full")]
    QueueFull,
    #[error("i/o error: {0}")]
    Io(String),
    #[error("codec error: {0}")]
    Codec(String),
}

/// The common transport contract.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, frame: &Frame) -> Result<(), TransportError>;
    async fn receive(&self) -> Result<Frame, TransportError>;
    fn is_connected(&self) -> bool;
    async fn close(&self);
}

// ─── Configuration + factory ──────────────────────────────────────────────────

/// Serialized transport description from the peer descriptor file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
    Unix {
        path: PathBuf,
    },
    Tcp {
        host: String,
        port: u16,
    },
}

/// Dial or spawn a transport for the given configuration.
pub async fn build_transport(
    config: &TransportConfig,
    environment: &HashMap<String, String>,
) -> Result<Box<dyn Transport>, TransportError> {
    match config {
        TransportConfig::Stdio { command, args } => {
            Ok(Box::new(StdioTransport::spawn(command, args, environment)?))
        }
        TransportConfig::Unix { path } => Ok(Box::new(SocketTransport::connect_unix(path).await?)),
        TransportConfig::Tcp { host, port } => {
            Ok(Box::new(SocketTransport::connect_tcp(host, *port).await?))
        }
    }
}

// ─── Codec helpers ────────────────────────────────────────────────────────────

fn encode_frame(frame: &Frame) -> Result<String, TransportError> {
    let mut line = serde_json::to_string(frame).map_err(|e| TransportError::Codec(e.to_string()))?;
    line.push('\n');
    Ok(line)
}

fn decode_frame(line: &str) -> Result<Frame, TransportError> {
    serde_json::from_str(line.trim()).map_err(|e| TransportError::Codec(e.to_string()))
}

// ─── Stdio ────────────────────────────────────────────────────────────────────

/// Newline-delimited JSON over a child process's stdin/stdout.
///
/// A background waiter observes the child: its death flips the connected
/// flag asynchronously.  `close` is staged — EOF on stdin, wait, terminate
/// signal, grace, hard kill.
pub struct StdioTransport {
    stdin: Mutex<Option<tokio::process::ChildStdin>>,
    stdout: Mutex<BufReader<tokio::process::ChildStdout>>,
    connected: Arc<AtomicBool>,
    exited: Mutex<watch::Receiver<bool>>,
    pid: Option<u32>,
}

impl StdioTransport {
    pub fn spawn(
        command: &str,
        args: &[String],
        environment: &HashMap<String, String>,
    ) -> Result<Self, TransportError> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        for (k, v) in environment {
            cmd.env(k, v);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| TransportError::Io(format!("failed to spawn '{command}': {e}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Io("child stdin not available".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Io("child stdout not available".to_string()))?;
        let pid = child.id();

        let connected = Arc::new(AtomicBool::new(true));
        let (exit_tx, exit_rx) = watch::channel(false);
        {
            let connected = connected.clone();
            tokio::spawn(async move {
                let status = child.wait().await;
                connected.store(false, Ordering::SeqCst);
                let _ = exit_tx.send(true);
                debug!(?status, "peer child process exited");
            });
        }

        Ok(Self {
            stdin: Mutex::new(Some(stdin)),
            stdout: Mutex::new(BufReader::new(stdout)),
            connected,
            exited: Mutex::new(exit_rx),
            pid,
        })
    }

    async fn wait_for_exit(&self, budget: Duration) -> bool {
        let mut rx = self.exited.lock().await;
        if *rx.borrow() {
            return true;
        }
        tokio::time::timeout(budget, rx.changed()).await.is_ok()
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let line = encode_frame(frame)?;
        let mut stdin = self.stdin.lock().await;
        let Some(stdin) = stdin.as_mut() else {
            return Err(TransportError::Closed("stdin already closed".to_string()));
        };
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| TransportError::Io(format!("write to child stdin: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| TransportError::Io(format!("flush child stdin: {e}")))?;
        Ok(())
    }

    async fn receive(&self) -> Result<Frame, TransportError> {
        let mut stdout = self.stdout.lock().await;
        loop {
            let mut line = String::new();
            let read = stdout
                .read_line(&mut line)
                .await
                .map_err(|e| TransportError::Io(format!("read from child stdout: {e}")))?;
            if read == 0 {
                self.connected.store(false, Ordering::SeqCst);
                return Err(TransportError::Closed("peer closed stdout".to_string()));
            }
            if line.trim().is_empty() {
                continue;
            }
            return decode_frame(&line);
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        // Stage 1: EOF on stdin signals shutdown to the child.
        self.stdin.lock().await.take();

        if !self.wait_for_exit(CLOSE_WAIT).await {
            // Stage 2: terminate signal, then a short grace.
            #[cfg(unix)]
            if let Some(pid) = self.pid {
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
            }
            if !self.wait_for_exit(CLOSE_GRACE).await {
                // Stage 3: hard kill.
                #[cfg(unix)]
                if let Some(pid) = self.pid {
                    warn!(pid, "peer child ignored termination, killing");
                    unsafe {
                        libc::kill(pid as libc::pid_t, libc::SIGKILL);
                    }
                }
            }
        }
        self.connected.store(false, Ordering::SeqCst);
    }
}

// ─── Stream socket ────────────────────────────────────────────────────────────

/// Newline-delimited JSON over a unix or tcp stream.
pub struct SocketTransport {
    reader: Mutex<Box<dyn tokio::io::AsyncBufRead + Send + Unpin>>,
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    connected: AtomicBool,
}

impl SocketTransport {
    pub async fn connect_tcp(host: &str, port: u16) -> Result<Self, TransportError> {
        let addr = format!("{host}:{port}");
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, tokio::net::TcpStream::connect(&addr))
            .await
            .map_err(|_| TransportError::Io(format!("connect to tcp://{addr} timed out")))?
            .map_err(|e| TransportError::Io(format!("connect to tcp://{addr}: {e}")))?;
        let (read, write) = stream.into_split();
        Ok(Self::from_halves(read, write))
    }

    #[cfg(unix)]
    pub async fn connect_unix(path: &std::path::Path) -> Result<Self, TransportError> {
        let stream =
            tokio::time::timeout(CONNECT_TIMEOUT, tokio::net::UnixStream::connect(path))
                .await
                .map_err(|_| {
                    TransportError::Io(format!("connect to unix://{} timed out", path.display()))
                })?
                .map_err(|e| {
                    TransportError::Io(format!("connect to unix://{}: {e}", path.display()))
                })?;
        let (read, write) = stream.into_split();
        Ok(Self::from_halves(read, write))
    }

    #[cfg(not(unix))]
    pub async fn connect_unix(path: &std::path::Path) -> Result<Self, TransportError> {
        Err(TransportError::Io(format!(
            "unix sockets unsupported on this platform: {}",
            path.display()
        )))
    }

    fn from_halves(
        read: impl AsyncRead + Send + Unpin + 'static,
        write: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: Mutex::new(Box::new(BufReader::new(read))),
            writer: Mutex::new(Box::new(write)),
            connected: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl Transport for SocketTransport {
    async fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let line = encode_frame(frame)?;
        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| TransportError::Io(format!("socket write: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| TransportError::Io(format!("socket flush: {e}")))?;
        Ok(())
    }

    async fn receive(&self) -> Result<Frame, TransportError> {
        let mut reader = self.reader.lock().await;
        loop {
            let mut line = String::new();
            let read = reader
                .read_line(&mut line)
                .await
                .map_err(|e| TransportError::Io(format!("socket read: {e}")))?;
            if read == 0 {
                self.connected.store(false, Ordering::SeqCst);
                return Err(TransportError::Closed("peer closed the connection".to_string()));
            }
            if line.trim().is_empty() {
                continue;
            }
            return decode_frame(&line);
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
        self.connected.store(false, Ordering::SeqCst);
    }
}

// ─── In-process ───────────────────────────────────────────────────────────────

/// Bounded in-process queue transport, used by the test suite.
///
/// `send` never blocks; a full outgoing queue is an error.  `close` drains
/// the incoming queue and releases any blocked receiver.
pub struct InMemoryTransport {
    outgoing: mpsc::Sender<Frame>,
    incoming: Mutex<mpsc::Receiver<Frame>>,
    connected: AtomicBool,
    shutdown: watch::Sender<bool>,
}

/// Build two cross-connected in-process transports.
pub fn in_memory_pair() -> (InMemoryTransport, InMemoryTransport) {
    let (a_tx, a_rx) = mpsc::channel(QUEUE_CAPACITY);
    let (b_tx, b_rx) = mpsc::channel(QUEUE_CAPACITY);
    (
        InMemoryTransport::new(a_tx, b_rx),
        InMemoryTransport::new(b_tx, a_rx),
    )
}

impl InMemoryTransport {
    fn new(outgoing: mpsc::Sender<Frame>, incoming: mpsc::Receiver<Frame>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            outgoing,
            incoming: Mutex::new(incoming),
            connected: AtomicBool::new(true),
            shutdown,
        }
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        match self.outgoing.try_send(frame.clone()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(TransportError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.connected.store(false, Ordering::SeqCst);
                Err(TransportError::Closed("peer dropped its queue".to_string()))
            }
        }
    }

    async fn receive(&self) -> Result<Frame, TransportError> {
        let mut shutdown = self.shutdown.subscribe();
        // Checked after subscribing so a concurrent close cannot slip between.
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            frame = incoming.recv() => match frame {
                Some(frame) => Ok(frame),
                None => {
                    self.connected.store(false, Ordering::SeqCst);
                    Err(TransportError::Closed("peer dropped its queue".to_string()))
                }
            },
            _ = shutdown.changed() => {
                Err(TransportError::Closed("transport closed".to_string()))
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.shutdown.send_replace(true);
        // Drain anything still queued.
        let mut incoming = self.incoming.lock().await;
        while incoming.try_recv().is_ok() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn in_memory_pair_round_trips_frames() {
        let (near, far) = in_memory_pair();
        let frame = Frame::request(1, "tools/list", None);
        near.send(&frame).await.unwrap();
        assert_eq!(far.receive().await.unwrap(), frame);

        let reply = Frame::response(json!(1), json!({"tools": []}));
        far.send(&reply).await.unwrap();
        assert_eq!(near.receive().await.unwrap(), reply);
    }

    #[tokio::test]
    async fn in_memory_send_reports_full_queue() {
        let (near, _far) = in_memory_pair();
        let frame = Frame::notification("ping", None);
        for _ in 0..QUEUE_CAPACITY {
            near.send(&frame).await.unwrap();
        }
        assert!(matches!(
            near.send(&frame).await,
            Err(TransportError::QueueFull)
        ));
    }

    #[tokio::test]
    async fn in_memory_close_releases_blocked_receiver() {
        let (near, _far) = in_memory_pair();
        let near = Arc::new(near);
        let receiver = {
            let near = near.clone();
            tokio::spawn(async move { near.receive().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        near.close().await;
        let result = tokio::time::timeout(Duration::from_secs(1), receiver)
            .await
            .expect("receiver did not unblock")
            .unwrap();
        assert!(matches!(result, Err(TransportError::Closed(_))));
        assert!(!near.is_connected());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stdio_echo_child_round_trips() {
        // `cat` echoes each newline-delimited frame straight back.
        let transport =
            StdioTransport::spawn("cat", &[], &HashMap::new()).expect("spawn cat");
        let frame = Frame::request(42, "resources/list", Some(json!({"cursor": null})));
        transport.send(&frame).await.unwrap();
        let echoed = transport.receive().await.unwrap();
        assert_eq!(echoed, frame);
        transport.close().await;
        assert!(!transport.is_connected());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stdio_child_death_flips_connected() {
        let transport = StdioTransport::spawn("true", &[], &HashMap::new()).expect("spawn true");
        // The child exits immediately; receive observes EOF.
        let err = transport.receive().await.unwrap_err();
        assert!(matches!(err, TransportError::Closed(_)));
        assert!(!transport.is_connected());
    }
}

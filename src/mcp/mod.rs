//! Model Context Protocol peer plane.
//!
//! `gadgetd` acts as an MCP *client*: it connects to configured external
//! peers, performs the initialize handshake, and proxies resource, tool, and
//! prompt operations to them over JSON-RPC 2.0.
//!
//! | Module | Role |
//! |--------|------|
//! | `protocol` | wire frames, error codes, id generation, typed payloads |
//! | `transport` | stdio / socket / in-process transports behind one trait |
//! | `client` | one peer session: handshake, correlation, receive loop |
//! | `manager` | named registry, aggregation, health monitoring |
//!
//! Protocol revision: MCP 2024-11-05.

pub mod client;
pub mod manager;
pub mod protocol;
pub mod transport;

pub use client::{PeerClient, PeerClientConfig, PeerError, REQUEST_TIMEOUT};
pub use manager::{PeerConfig, PeerManager, PeerStatus, HEALTH_INTERVAL};
pub use protocol::{
    CallToolResult, ClientCapabilities, ContentItem, Frame, IdGenerator, PromptDescriptor,
    ResourceDescriptor, RpcError, ServerCapabilities, ServerInfo, ToolDescriptor,
    PROTOCOL_VERSION,
};
pub use transport::{
    build_transport, in_memory_pair, InMemoryTransport, SocketTransport, StdioTransport,
    Transport, TransportConfig, TransportError,
};

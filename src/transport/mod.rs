//! Network transport layer for clipboard relaying
//!
//! This module provides the chunk codec, framed sockets over WebSocket or raw
//! TCP, the remote relay node that streams messages over one socket, and the
//! client and server connection lifecycles.

use std::net::SocketAddr;

use thiserror::Error;

pub mod chunk;
pub mod framed;
pub mod message;
pub mod reconnect;
pub mod remote;
pub mod server;
pub mod socket;
pub mod websocket;

pub use chunk::{split, Chunk, Chunks, Fingerprint, Reassembly, Rejoiner, RejoinerConfig};
pub use message::Message;
pub use reconnect::{connector_for_url, ConnectionManager, Connector, ReconnectionConfig};
pub use remote::{RemoteNode, RemoteNodeConfig};
pub use server::{Server, ServerConfig};
pub use socket::{Frame, FrameSink, FrameSource, Socket};

/// Transport layer errors with user-friendly messages
#[derive(Debug, Error)]
pub enum TransportError {
    /// WebSocket protocol error
    #[error("CS001: Network connection error: {message}. Please check your network connection and try again.")]
    WebSocket { message: String },

    /// Connection error
    #[error("CS003: Connection failed: {message}. Check if the remote device is online and accessible.")]
    Connection { message: String },

    /// Message serialization error
    #[error("CS004: Data format error: {message}. The clipboard content could not be encoded.")]
    Encode { message: String },

    /// Message deserialization error
    #[error("CS004: Data format error: {message}. The message format may be corrupted or incompatible.")]
    Decode { message: String },

    /// IO error
    #[error("CS005: System error: {0}. Check your network connection and socket permissions.")]
    Io(#[from] std::io::Error),

    /// Chunk that cannot belong to any valid message
    #[error("CS006: Transfer error: {message}. Large clipboard content may not have transferred correctly.")]
    MalformedChunk { message: String },

    /// Frame larger than the negotiated maximum
    #[error("CS006: Transfer error: frame of {size} bytes exceeds the {max} byte limit.")]
    FrameTooLarge { size: usize, max: usize },

    /// Connection closed
    #[error("CS009: Connection closed unexpectedly. The remote device may have gone offline or network connectivity was lost.")]
    ConnectionClosed,

    /// Timeout error
    #[error("CS010: Operation timed out after waiting too long. Check your network connection and try again.")]
    Timeout,

    /// Lifecycle already running
    #[error("CS016: Already active. Disconnect or stop before starting again.")]
    AlreadyActive,

    /// Node attached to a relay twice
    #[error("CS017: This node is already attached to the relay.")]
    AlreadyAttached,

    /// Endpoint URL with an unusable scheme or address
    #[error("CS018: Invalid endpoint '{endpoint}': {reason}. Use ws://host:port or tcp://host:port.")]
    InvalidEndpoint { endpoint: String, reason: String },

    /// Configuration error
    #[error("CS012: Configuration error: {message}. Run 'clipshare config validate' to check your settings.")]
    Configuration { message: String },
}

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

/// State of one outbound connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Never connected
    #[default]
    Idle,

    /// Handshake in progress
    Connecting,

    /// Socket open and a remote node attached to the relay
    Connected,

    /// Waiting before the next connection attempt
    Reconnecting,

    /// Stopped by the user
    Disconnected,
}

impl ConnectionState {
    /// Whether a `connect()` call would be rejected
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }
}

/// Transport events for monitoring and management
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Outbound connection attempt started
    Connecting { endpoint: String },

    /// Outbound connection established
    Connected { endpoint: String },

    /// Outbound connection dropped; a reconnect follows
    ConnectionLost { endpoint: String },

    /// Outbound connection stopped by the user
    Disconnected { endpoint: String },

    /// Server bound and accepting
    Listening { addr: SocketAddr },

    /// Server stopped
    ServerStopped,

    /// Inbound peer attached
    PeerAttached { peer: String },

    /// Inbound peer gone
    PeerDetached { peer: String },
}

//! # ClipShare
//!
//! Clipboard relay for syncing text and images between devices.
//!
//! Every participant (the local clipboard, each connected peer) is a
//! [`relay::Node`] attached to a shared [`relay::Relay`]. A change produced by
//! one node is fanned out to every other node; remote nodes stream it over
//! their socket as fixed-size chunks which the far side reassembles before
//! re-emitting it into its own relay.

pub mod cli;
pub mod clipboard;
pub mod config;
pub mod progress;
pub mod relay;
pub mod sync;
pub mod transport;

pub use config::Config;
pub use relay::{Node, NodeGuard, Relay};
pub use transport::{Fingerprint, Message};

/// Result type alias for ClipShare operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for ClipShare operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Clipboard operation error
    #[error("Clipboard error: {0}")]
    Clipboard(#[from] clipboard::ClipboardError),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default number of payload bytes carried by one chunk
pub const DEFAULT_SPLIT_SIZE: usize = 100_000;

//! Clipboard abstraction layer
//!
//! A [`Payload`] maps MIME types to raw bytes. Providers report local changes
//! through a [`ClipboardWatcher`] and apply payloads received from peers.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bincode::{Decode, Encode};
use thiserror::Error;
use tokio::sync::mpsc;

pub mod memory;
pub mod system;

pub use memory::MemoryClipboard;
pub use system::SystemClipboard;

/// Maximum clipboard content size (5MB)
pub const MAX_CLIPBOARD_SIZE: usize = 5 * 1024 * 1024;

/// MIME type used for plain text
pub const TEXT_PLAIN: &str = "text/plain";

/// MIME type images travel as
pub const IMAGE_PNG: &str = "image/png";

/// Clipboard contents keyed by MIME type
#[derive(Debug, Clone, Default, PartialEq, Eq, Encode, Decode)]
pub struct Payload {
    formats: BTreeMap<String, Vec<u8>>,
}

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plain text payload
    pub fn text(text: impl Into<String>) -> Self {
        Self::new().with_format(TEXT_PLAIN, text.into().into_bytes())
    }

    /// Add or replace one format
    pub fn with_format(mut self, mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        self.formats.insert(mime_type.into(), data);
        self
    }

    pub fn get(&self, mime_type: &str) -> Option<&[u8]> {
        self.formats.get(mime_type).map(Vec::as_slice)
    }

    /// Get content as text if a UTF-8 `text/plain` format is present
    pub fn as_text(&self) -> Option<&str> {
        self.get(TEXT_PLAIN)
            .and_then(|data| std::str::from_utf8(data).ok())
    }

    pub fn formats(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.formats
            .iter()
            .map(|(mime, data)| (mime.as_str(), data.as_slice()))
    }

    /// No formats, or only empty ones
    pub fn is_empty(&self) -> bool {
        self.formats.values().all(Vec::is_empty)
    }

    /// Total size of all formats in bytes
    pub fn size(&self) -> usize {
        self.formats.values().map(Vec::len).sum()
    }
}

/// Clipboard provider trait
#[async_trait]
pub trait ClipboardProvider: Send + Sync {
    /// Start watching for clipboard changes
    async fn watch(&self) -> Result<ClipboardWatcher, ClipboardError>;

    /// Set clipboard content
    async fn set_content(&self, payload: &Payload) -> Result<(), ClipboardError>;

    /// Clear clipboard
    async fn clear(&self) -> Result<(), ClipboardError>;

    /// Get provider name
    fn name(&self) -> &str;
}

/// Clipboard change event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipboardEvent {
    /// The new clipboard content
    pub payload: Payload,
}

/// Clipboard watcher for monitoring changes
pub struct ClipboardWatcher {
    /// Channel receiver for clipboard events
    pub receiver: mpsc::Receiver<ClipboardEvent>,
    /// Handle to stop watching
    _handle: Box<dyn Send + Sync>,
}

impl ClipboardWatcher {
    /// Create a new watcher with the given receiver
    pub fn new(
        receiver: mpsc::Receiver<ClipboardEvent>,
        handle: impl Send + Sync + 'static,
    ) -> Self {
        Self {
            receiver,
            _handle: Box::new(handle),
        }
    }

    pub async fn recv(&mut self) -> Option<ClipboardEvent> {
        self.receiver.recv().await
    }
}

/// Aborts a polling task when the owning watcher is dropped
pub(crate) struct AbortOnDrop(pub tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Clipboard errors
#[derive(Debug, Error)]
pub enum ClipboardError {
    /// Platform-specific error
    #[error("Platform error: {0}")]
    Platform(String),

    /// Content too large
    #[error("Content too large: {size} bytes (max: {max} bytes)")]
    TooLarge { size: usize, max: usize },

    /// No content available
    #[error("No clipboard content available")]
    NoContent,

    /// Watch error
    #[error("Failed to watch clipboard: {0}")]
    WatchError(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_text() {
        let payload = Payload::text("Hello, world!");
        assert_eq!(payload.as_text(), Some("Hello, world!"));
        assert_eq!(payload.size(), 13);
        assert!(!payload.is_empty());
    }

    #[test]
    fn test_payload_multiple_formats() {
        let payload = Payload::text("caption").with_format("image/png", vec![1, 2, 3]);
        assert_eq!(payload.get("image/png"), Some(&[1u8, 2, 3][..]));
        assert_eq!(payload.size(), 10);
        let mimes: Vec<_> = payload.formats().map(|(m, _)| m).collect();
        assert_eq!(mimes, vec!["image/png", TEXT_PLAIN]);
    }

    #[test]
    fn test_payload_empty() {
        assert!(Payload::new().is_empty());
        assert!(Payload::text("").is_empty());
        assert!(Payload::new().with_format("image/png", vec![]).is_empty());
    }

    #[test]
    fn test_non_utf8_text_is_not_text() {
        let payload = Payload::new().with_format(TEXT_PLAIN, vec![0xff, 0xfe]);
        assert_eq!(payload.as_text(), None);
    }
}

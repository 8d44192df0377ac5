//! In-process clipboard
//!
//! Holds one payload in memory and reports every write, including its own,
//! to all watchers. Used for headless runs and tests.

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use super::{
    AbortOnDrop, ClipboardError, ClipboardEvent, ClipboardProvider, ClipboardWatcher, Payload,
};

/// In-memory clipboard provider
pub struct MemoryClipboard {
    current: Mutex<Payload>,
    changes: broadcast::Sender<Payload>,
}

impl Default for MemoryClipboard {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryClipboard {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            current: Mutex::new(Payload::new()),
            changes,
        }
    }

    /// Current contents
    pub fn content(&self) -> Payload {
        match self.current.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Simulate a local copy
    pub fn copy(&self, payload: Payload) {
        self.store(payload);
    }

    fn store(&self, payload: Payload) {
        match self.current.lock() {
            Ok(mut guard) => *guard = payload.clone(),
            Err(poisoned) => *poisoned.into_inner() = payload.clone(),
        }
        // No watchers is fine
        let _ = self.changes.send(payload);
    }
}

#[async_trait]
impl ClipboardProvider for MemoryClipboard {
    async fn watch(&self) -> Result<ClipboardWatcher, ClipboardError> {
        let (tx, rx) = mpsc::channel(100);
        let mut changes = self.changes.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(payload) => {
                        if tx.send(ClipboardEvent { payload }).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Memory clipboard watcher skipped {} changes", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(ClipboardWatcher::new(rx, AbortOnDrop(handle)))
    }

    async fn set_content(&self, payload: &Payload) -> Result<(), ClipboardError> {
        self.store(payload.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<(), ClipboardError> {
        self.store(Payload::new());
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_memory_clipboard_reports_copies_and_writes() {
        let clipboard = MemoryClipboard::new();
        let mut watcher = clipboard.watch().await.unwrap();

        clipboard.copy(Payload::text("copied"));
        clipboard.set_content(&Payload::text("applied")).await.unwrap();
        clipboard.clear().await.unwrap();

        assert_eq!(watcher.recv().await.unwrap().payload, Payload::text("copied"));
        assert_eq!(watcher.recv().await.unwrap().payload, Payload::text("applied"));
        assert!(watcher.recv().await.unwrap().payload.is_empty());
        assert!(clipboard.content().is_empty());
    }

    #[tokio::test]
    async fn test_content_without_watchers() {
        let clipboard = MemoryClipboard::new();
        clipboard.set_content(&Payload::text("x")).await.unwrap();
        assert_eq!(clipboard.content().as_text(), Some("x"));
        assert_eq!(clipboard.name(), "memory");
    }
}
